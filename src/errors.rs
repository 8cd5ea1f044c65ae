use std::io;
use std::time::Duration;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// All errors that can occur during the use of geerpc.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),
    /// Error in deserializing a server response.
    ///
    /// Typically this indicates a faulty implementation of `serde::Serialize` or
    /// `serde::Deserialize`, or a codec mismatch between client and server.
    #[error("deserializing a server response err: {0}")]
    ClientDeserialize(String),
    /// Error in serializing a client request.
    #[error("serializing a client request err: {0}")]
    ClientSerialize(String),
    /// Error in deserializing a client request.
    #[error("deserializing a client request err: {0}")]
    ServerDeserialize(String),
    /// Error in serializing a server response.
    #[error("serializing a server response err: {0}")]
    ServerSerialize(String),
    /// The error string a server placed in a response header.
    #[error("{0}")]
    Status(String),
    /// The connection has been closed by the user or torn down by the
    /// receive loop.
    #[error("connection is shut down")]
    Shutdown,
    /// The connection died while calls were outstanding.
    #[error("connection error: {0}")]
    Disconnected(String),
    /// The caller gave up on the call before a response arrived.
    #[error("call failed: call canceled")]
    Canceled,
    /// Dialing the server did not complete in time.
    #[error("rpc client: connect timeout: expect within {0:?}")]
    ConnectTimeout(Duration),
    /// The server could not produce a response in time.
    #[error("rpc server: request handle timeout: expect within {0:?}")]
    HandleTimeout(Duration),
    /// The handshake preamble carried the wrong magic number.
    #[error("rpc server: invalid magic number {0:#x}")]
    InvalidMagic(u32),
    /// A body frame exceeded the allowed size.
    #[error("body frame too big: len={0}")]
    FrameTooBig(u64),
    /// A service name was registered twice.
    #[error("rpc: service already defined: {0}")]
    DuplicateService(String),
    /// A service/method name without a `.` separator.
    #[error("rpc server: service/method request ill-formed: {0}")]
    IllFormedServiceMethod(String),
    /// No service registered under this name.
    #[error("rpc server: can't find service {0}")]
    ServiceNotFound(String),
    /// The service exists but has no such method.
    #[error("rpc server: can't find method {0}")]
    MethodNotFound(String),
    /// The discovery has no addresses to hand out.
    #[error("rpc discovery: no available servers")]
    NoAvailableServers,
    /// The discovery was asked for an unknown selection mode.
    #[error("rpc discovery: not supported select mode")]
    UnsupportedSelectMode,
}

impl Error {
    /// Whether this error means the peer went away (clean EOF included).
    ///
    /// Read loops treat these as the normal end of a connection and log them
    /// at info level instead of error.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::NotConnected
            ),
            _ => false,
        }
    }
}
