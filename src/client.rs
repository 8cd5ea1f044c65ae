use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use may::net::TcpStream;
#[cfg(unix)]
use may::os::unix::net::UnixStream;
use may::sync::{mpsc, Mutex};
use may::{coroutine, go};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{CodecRead, CodecType, CodecWrite, Header};
use crate::errors::{Error, Result};
use crate::http;
use crate::options::Options;
use crate::server::DEFAULT_RPC_PATH;
use crate::stream::StreamExt;

/// A call completion: the caller-chosen token plus the encoded reply blob
/// or the error that ended the call.
pub type Completion = (u64, Result<Vec<u8>>);

/// Where completions are delivered. The channel is unbounded, so the
/// receive loop never blocks on delivery; several calls may share one
/// sender and tell their completions apart by token.
pub type DoneSender = mpsc::Sender<Completion>;

struct Pending {
    token: u64,
    done: DoneSender,
}

struct State {
    seq: u64,
    pending: HashMap<u64, Pending>,
    /// user has called close
    closing: bool,
    /// the receive loop observed a terminal error
    shutdown: bool,
}

struct SendHalf {
    writer: Box<dyn CodecWrite>,
    // only touched while sending, which is serialized by the lock, so one
    // header buffer per client is enough
    header: Header,
}

struct Inner {
    codec_type: CodecType,
    send: Mutex<SendHalf>,
    state: Mutex<State>,
}

/// An RPC client over one shared connection.
///
/// Many coroutines may call through a single `Client` concurrently; each
/// outstanding request is tracked by its `seq` until the matching response
/// arrives or the connection dies.
pub struct Client {
    inner: Arc<Inner>,
    receiver: Option<coroutine::JoinHandle<()>>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("codec_type", &self.inner.codec_type)
            .field("available", &self.is_available())
            .finish()
    }
}

impl Client {
    /// Connect to an RPC server at `addr` with default options.
    pub fn dial<A: ToSocketAddrs>(addr: A) -> Result<Client> {
        Self::dial_with(addr, Options::default())
    }

    /// Connect to an RPC server at `addr`.
    pub fn dial_with<A: ToSocketAddrs>(addr: A, opt: Options) -> Result<Client> {
        let stream = connect(addr, opt.connect_timeout)?;
        stream.set_nodelay(true).ok();
        Client::new(stream, opt)
    }

    /// Connect to an RPC server through its HTTP CONNECT endpoint.
    pub fn dial_http<A: ToSocketAddrs>(addr: A) -> Result<Client> {
        Self::dial_http_with(addr, Options::default())
    }

    /// Connect through HTTP CONNECT with explicit options.
    pub fn dial_http_with<A: ToSocketAddrs>(addr: A, opt: Options) -> Result<Client> {
        let mut stream = connect(addr, opt.connect_timeout)?;
        stream.set_nodelay(true).ok();
        stream.write_all(format!("CONNECT {DEFAULT_RPC_PATH} HTTP/1.0\n\n").as_bytes())?;
        let head = http::read_response_head(&mut stream)?;
        if head.status != 200 {
            return Err(Error::Status(format!(
                "unexpected HTTP response: {} {}",
                head.status, head.reason
            )));
        }
        Client::new(stream, opt)
    }

    /// Connect to an RPC server on a unix socket.
    #[cfg(unix)]
    pub fn dial_unix<P: AsRef<Path>>(path: P) -> Result<Client> {
        Self::dial_unix_with(path, Options::default())
    }

    /// Connect on a unix socket with explicit options.
    #[cfg(unix)]
    pub fn dial_unix_with<P: AsRef<Path>>(path: P, opt: Options) -> Result<Client> {
        let stream = UnixStream::connect(path)?;
        Client::new(stream, opt)
    }

    /// Build a client over an already-connected stream: send the options
    /// preamble and start the receive loop.
    pub fn new<S: StreamExt>(mut stream: S, opt: Options) -> Result<Client> {
        opt.write_to(&mut stream)?;
        let (reader, writer) = opt.codec_type.new_codec(stream)?;
        let inner = Arc::new(Inner {
            codec_type: opt.codec_type,
            send: Mutex::new(SendHalf {
                writer,
                header: Header::default(),
            }),
            state: Mutex::new(State {
                seq: 1,
                pending: HashMap::new(),
                closing: false,
                shutdown: false,
            }),
        });
        let loop_inner = inner.clone();
        let receiver = go!(
            coroutine::Builder::new().name("RpcClientReceiver".to_owned()),
            move || receive_loop(loop_inner, reader)
        )?;
        Ok(Client {
            inner,
            receiver: Some(receiver),
        })
    }

    /// Start a call, delivering its completion as `(token, result)` on
    /// `done`. Registration fails with [`Error::Shutdown`] once the client
    /// stops being available; a send failure is delivered through `done`
    /// unless the response raced ahead of it.
    pub fn go_with<A: Serialize>(
        &self,
        service_method: &str,
        args: &A,
        done: DoneSender,
        token: u64,
    ) -> Result<CallHandle> {
        let body = self
            .inner
            .codec_type
            .encode(args)
            .map_err(Error::ClientSerialize)?;

        // register and send under the send lock, so wire order matches seq
        // order and a complete header+body pair goes out in one piece
        let mut send = self.inner.send.lock().unwrap();
        let seq = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
            let seq = state.seq;
            state.seq += 1;
            state.pending.insert(
                seq,
                Pending {
                    token,
                    done: done.clone(),
                },
            );
            seq
        };
        let SendHalf { writer, header } = &mut *send;
        header.service_method.clear();
        header.service_method.push_str(service_method);
        header.seq = seq;
        header.error.clear();
        if let Err(e) = writer.write(header, &body) {
            // if the entry is already gone the response raced ahead of the
            // write failure and was handled by the receive loop
            let removed = self.inner.state.lock().unwrap().pending.remove(&seq);
            if let Some(pending) = removed {
                let _ = pending.done.send((pending.token, Err(e)));
            }
        }
        Ok(CallHandle {
            seq,
            service_method: service_method.to_owned(),
            inner: self.inner.clone(),
        })
    }

    /// Invoke the named method asynchronously.
    pub fn go<A: Serialize>(&self, service_method: &str, args: &A) -> Result<Call> {
        let (tx, rx) = mpsc::channel();
        let handle = self.go_with(service_method, args, tx, 0)?;
        Ok(Call { handle, done: rx })
    }

    /// Invoke the named method, wait for it to complete, and return its
    /// reply.
    pub fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        self.go(service_method, args)?.wait()
    }

    /// Like [`call`](Client::call), but give up after `timeout`. Giving up
    /// only abandons the caller's wait; the connection stays usable and a
    /// late response is discarded cleanly.
    pub fn call_timeout<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R> {
        self.go(service_method, args)?.wait_timeout(timeout)
    }

    /// Close the connection. Closing an already-closed or already-dead
    /// client returns [`Error::Shutdown`]. The receive loop observes the
    /// teardown and fails every pending call.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock().unwrap();
            if state.closing || state.shutdown {
                return Err(Error::Shutdown);
            }
            state.closing = true;
        }
        self.inner.send.lock().unwrap().writer.close()
    }

    /// Whether the client still works: neither closed by the user nor torn
    /// down by the receive loop.
    pub fn is_available(&self) -> bool {
        let state = self.inner.state.lock().unwrap();
        !state.shutdown && !state.closing
    }

    /// The codec this connection negotiated.
    pub fn codec_type(&self) -> CodecType {
        self.inner.codec_type
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.close().ok();
        if let Some(handle) = self.receiver.take() {
            handle.join().ok();
        }
    }
}

/// Identifies one in-flight call; lets a caller abandon it.
pub struct CallHandle {
    seq: u64,
    service_method: String,
    inner: Arc<Inner>,
}

impl CallHandle {
    /// The request id this call was sent under.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The "Service.Method" this call addresses.
    pub fn service_method(&self) -> &str {
        &self.service_method
    }

    /// Abandon the call: remove its pending entry so no completion is
    /// delivered. Returns false if the call already completed (its
    /// completion is on the done channel). Work already sent to the server
    /// is not revoked.
    pub fn cancel(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .pending
            .remove(&self.seq)
            .is_some()
    }
}

/// An asynchronous call started with [`Client::go`].
pub struct Call {
    handle: CallHandle,
    done: mpsc::Receiver<Completion>,
}

impl Call {
    /// The in-flight call's handle.
    pub fn handle(&self) -> &CallHandle {
        &self.handle
    }

    /// Block until the response arrives and decode it.
    pub fn wait<R: DeserializeOwned>(self) -> Result<R> {
        match self.done.recv() {
            Ok(completion) => decode_completion(&self.handle, completion),
            Err(_) => Err(Error::Shutdown),
        }
    }

    /// Block for at most `timeout`; on expiry abandon the call and return
    /// [`Error::Canceled`].
    pub fn wait_timeout<R: DeserializeOwned>(self, timeout: Duration) -> Result<R> {
        match self.done.recv_timeout(timeout) {
            Ok(completion) => decode_completion(&self.handle, completion),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                self.handle.cancel();
                Err(Error::Canceled)
            }
            Err(_) => Err(Error::Shutdown),
        }
    }
}

fn decode_completion<R: DeserializeOwned>(
    handle: &CallHandle,
    (_token, result): Completion,
) -> Result<R> {
    let body = result?;
    handle
        .inner
        .codec_type
        .decode(&body)
        .map_err(Error::ClientDeserialize)
}

fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<TcpStream> {
    if timeout.is_zero() {
        return Ok(TcpStream::connect(addr)?);
    }
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    let (tx, rx) = mpsc::channel();
    go!(move || {
        // if the caller gave up, the send fails and the fresh connection
        // drops closed
        let _ = tx.send(TcpStream::connect(&addrs[..]));
    });
    match rx.recv_timeout(timeout) {
        Ok(stream) => Ok(stream?),
        Err(_) => Err(Error::ConnectTimeout(timeout)),
    }
}

fn receive_loop(inner: Arc<Inner>, mut reader: Box<dyn CodecRead>) {
    let terminal = loop {
        let mut header = Header::default();
        if let Err(e) = reader.read_header(&mut header) {
            break e;
        }
        let pending = inner.state.lock().unwrap().pending.remove(&header.seq);
        match pending {
            // cancelled, or its send failed partway: consume the body so
            // framing stays intact, then move on
            None => {
                if let Err(e) = reader.read_body() {
                    break e;
                }
            }
            Some(pending) => match reader.read_body() {
                Ok(body) => {
                    let result = if header.error.is_empty() {
                        Ok(body)
                    } else {
                        Err(Error::Status(header.error))
                    };
                    let _ = pending.done.send((pending.token, result));
                }
                Err(e) => {
                    let _ = pending
                        .done
                        .send((pending.token, Err(Error::Disconnected(e.to_string()))));
                    break e;
                }
            },
        }
    };
    if terminal.is_disconnect() {
        info!("rpc client: connection closed");
    } else {
        error!("rpc client: receive error: {terminal}");
    }
    terminate(&inner, &terminal);
}

// Fail every pending call with the terminal error. Lock order matters:
// send lock before state lock, so no sender can be between registration
// and write while we flip shutdown.
fn terminate(inner: &Inner, err: &Error) {
    let _send = inner.send.lock().unwrap();
    let mut state = inner.state.lock().unwrap();
    state.shutdown = true;
    let msg = err.to_string();
    for (_seq, pending) in state.pending.drain() {
        let _ = pending.done.send((pending.token, Err(Error::Disconnected(msg.clone()))));
    }
}
