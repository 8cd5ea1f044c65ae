use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::time::Duration;

/// Stream extension.
///
/// Implemented for the duplex socket types a connection can run over. The
/// codec layer clones the stream so one half can be read by the receive
/// loop while the other is written under the send lock.
pub trait StreamExt: Sized + Read + Write + Send + 'static {
    /// try clone the stream
    fn try_clone(&self) -> io::Result<Self>;
    /// set read timeout
    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()>;
    /// shut down both halves of the stream, waking any blocked reader
    fn shutdown(&self) -> io::Result<()>;
}

macro_rules! impl_stream_ext {
    ($name: ty) => {
        impl StreamExt for $name {
            fn try_clone(&self) -> io::Result<Self> {
                (*self).try_clone()
            }
            fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
                (*self).set_read_timeout(timeout)
            }
            fn shutdown(&self) -> io::Result<()> {
                (*self).shutdown(Shutdown::Both)
            }
        }
    };
}

impl_stream_ext!(may::net::TcpStream);
#[cfg(unix)]
impl_stream_ext!(may::os::unix::net::UnixStream);
