use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, ToSocketAddrs};
#[cfg(unix)]
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use co_managed::Manager;
use may::net::{TcpListener, TcpStream};
#[cfg(unix)]
use may::os::unix::net::UnixListener;
use may::sync::{mpsc, Mutex};
use may::{coroutine, go};

use crate::codec::{CodecRead, CodecType, CodecWrite, Header};
use crate::errors::{Error, Result};
use crate::http;
use crate::options::Options;
use crate::service::{MethodDescriptor, Service};
use crate::stream::StreamExt;

/// HTTP path answering CONNECT upgrades.
pub const DEFAULT_RPC_PATH: &str = "/_geerpc_";
/// Debug path serving a plaintext summary of services and call counts.
pub const DEFAULT_DEBUG_PATH: &str = "/debug/geerpc";

const CONNECTED: &str = "200 Connected to Gee RPC";

type SharedWriter = Arc<Mutex<Box<dyn CodecWrite>>>;

/// An RPC server: a map of registered services plus the per-connection
/// serving pipeline. Cheap to clone; clones share the same services.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
}

struct Shared {
    services: Mutex<HashMap<String, Arc<Service>>>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    /// Returns a new `Server`.
    pub fn new() -> Server {
        Server {
            shared: Arc::new(Shared {
                services: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Publish a service. Fails if a service with the same name is already
    /// registered, leaving the existing registration untouched.
    pub fn register(&self, service: Service) -> Result<()> {
        let mut services = self.shared.services.lock().unwrap();
        if services.contains_key(service.name()) {
            return Err(Error::DuplicateService(service.name().to_owned()));
        }
        info!("rpc server: register service {}", service.name());
        services.insert(service.name().to_owned(), Arc::new(service));
        Ok(())
    }

    fn find_method(&self, service_method: &str) -> Result<Arc<MethodDescriptor>> {
        let dot = service_method
            .rfind('.')
            .ok_or_else(|| Error::IllFormedServiceMethod(service_method.to_owned()))?;
        let (service_name, method_name) = (&service_method[..dot], &service_method[dot + 1..]);
        let services = self.shared.services.lock().unwrap();
        let service = services
            .get(service_name)
            .ok_or_else(|| Error::ServiceNotFound(service_name.to_owned()))?;
        service
            .method(method_name)
            .ok_or_else(|| Error::MethodNotFound(method_name.to_owned()))
    }

    /// Run the server on a single connection, blocking until the client
    /// hangs up.
    pub fn serve_conn<S: StreamExt>(&self, mut stream: S) {
        let opt = match Options::read_from(&mut stream) {
            Ok(opt) => opt,
            Err(e) => {
                error!("rpc server: options error: {e}");
                return;
            }
        };
        let (reader, writer) = match opt.codec_type.new_codec(stream) {
            Ok(pair) => pair,
            Err(e) => {
                error!("rpc server: codec error: {e}");
                return;
            }
        };
        self.serve_codec(reader, writer, opt.codec_type, opt.handle_timeout);
    }

    fn serve_codec(
        &self,
        mut reader: Box<dyn CodecRead>,
        writer: Box<dyn CodecWrite>,
        codec_type: CodecType,
        handle_timeout: Duration,
    ) {
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        // shut the connection down however the session ends; handlers may
        // outlive the session and must not keep the socket open
        struct CloseGuard(SharedWriter);
        impl Drop for CloseGuard {
            fn drop(&mut self) {
                // try_lock: never park inside a drop (the session may be
                // unwinding from a cancel); a handler caught mid-write keeps
                // the lock and the socket dies with the last writer clone
                if let Ok(mut writer) = self.0.try_lock() {
                    writer.close().ok();
                }
            }
        }
        let _close = CloseGuard(writer.clone());
        // every in-flight handler holds a clone of this sender; the session
        // may not close the codec until all of them are gone
        let (done_tx, done_rx) = mpsc::channel::<()>();
        loop {
            let mut header = Header::default();
            if let Err(e) = reader.read_header(&mut header) {
                if e.is_disconnect() {
                    info!("rpc server: connection closed");
                } else {
                    error!("rpc server: read header error: {e}");
                }
                break;
            }
            let method = self.find_method(&header.service_method);
            // the body must be consumed either way to keep framing intact
            let body = match reader.read_body() {
                Ok(body) => body,
                Err(e) => {
                    error!("rpc server: read body error: {e}");
                    break;
                }
            };
            match method {
                Err(e) => {
                    header.error = e.to_string();
                    send_response(&writer, &header, &[]);
                }
                Ok(method) => {
                    let writer = writer.clone();
                    let done = done_tx.clone();
                    go!(move || {
                        handle_request(&writer, header, method, codec_type, body, handle_timeout);
                        drop(done);
                    });
                }
            }
        }
        drop(done_tx);
        while done_rx.recv().is_ok() {}
    }

    /// Accept connections on the listener and serve requests for each
    /// incoming connection. Accept errors terminate the loop.
    pub fn accept(&self, listener: TcpListener) {
        let manager = Manager::new();
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    error!("rpc server: accept error: {e}");
                    return;
                }
            };
            stream.set_nodelay(true).ok();
            let server = self.clone();
            manager.add(move |_| server.serve_conn(stream));
        }
    }

    /// Bind `addr` and serve in a background coroutine.
    pub fn start<L: ToSocketAddrs>(&self, addr: L) -> std::io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!("rpc server: listening on {local_addr}");
        let server = self.clone();
        let handle = go!(
            coroutine::Builder::new().name("TcpRpcServer".to_owned()),
            move || server.accept(listener)
        )?;
        Ok(ServerInstance {
            handle: Some(handle),
            local_addr: Some(local_addr),
        })
    }

    /// Bind a unix socket at `path` and serve in a background coroutine.
    /// The socket file is removed again when the instance stops.
    #[cfg(unix)]
    pub fn start_unix<P: AsRef<Path>>(&self, path: P) -> std::io::Result<ServerInstance> {
        struct AutoDrop(UnixListener, PathBuf);
        impl Drop for AutoDrop {
            fn drop(&mut self) {
                std::fs::remove_file(&self.1).ok();
            }
        }

        std::fs::remove_file(&path).ok();
        let listener = AutoDrop(UnixListener::bind(&path)?, path.as_ref().to_owned());
        let server = self.clone();
        let handle = go!(
            coroutine::Builder::new().name("UnixRpcServer".to_owned()),
            move || {
                let manager = Manager::new();
                for stream in listener.0.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("rpc server: accept error: {e}");
                            return;
                        }
                    };
                    let server = server.clone();
                    manager.add(move |_| server.serve_conn(stream));
                }
            }
        )?;
        Ok(ServerInstance {
            handle: Some(handle),
            local_addr: None,
        })
    }

    /// Serve one HTTP connection: a CONNECT on the RPC path is hijacked
    /// into a plain RPC session on the same byte stream.
    pub fn serve_http_conn(&self, mut stream: TcpStream) {
        let req = match http::read_request_head(&mut stream) {
            Ok(req) => req,
            Err(e) => {
                error!("rpc server: http read error: {e}");
                return;
            }
        };
        match (req.method.as_str(), req.path.as_str()) {
            ("CONNECT", DEFAULT_RPC_PATH) => {
                if let Err(e) = stream.write_all(format!("HTTP/1.0 {CONNECTED}\n\n").as_bytes()) {
                    error!("rpc server: http hijack error: {e}");
                    return;
                }
                self.serve_conn(stream);
            }
            (_, DEFAULT_RPC_PATH) => {
                let _ = http::write_response(
                    &mut stream,
                    "405 Method Not Allowed",
                    &[("Content-Type", "text/plain; charset=utf-8")],
                    "405 must CONNECT\n",
                );
            }
            ("GET", DEFAULT_DEBUG_PATH) => {
                let body = self.debug_summary();
                let _ = http::write_response(
                    &mut stream,
                    "200 OK",
                    &[("Content-Type", "text/plain; charset=utf-8")],
                    &body,
                );
            }
            _ => {
                let _ = http::write_response(&mut stream, "404 Not Found", &[], "");
            }
        }
    }

    /// Bind `addr` and answer HTTP CONNECT upgrades in a background
    /// coroutine.
    pub fn start_http<L: ToSocketAddrs>(&self, addr: L) -> std::io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!("rpc server: http listening on {local_addr}");
        let server = self.clone();
        let handle = go!(
            coroutine::Builder::new().name("HttpRpcServer".to_owned()),
            move || {
                let manager = Manager::new();
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("rpc server: accept error: {e}");
                            return;
                        }
                    };
                    stream.set_nodelay(true).ok();
                    let server = server.clone();
                    manager.add(move |_| server.serve_http_conn(stream));
                }
            }
        )?;
        Ok(ServerInstance {
            handle: Some(handle),
            local_addr: Some(local_addr),
        })
    }

    fn debug_summary(&self) -> String {
        let services = self.shared.services.lock().unwrap();
        let mut names: Vec<_> = services.keys().cloned().collect();
        names.sort();
        let mut out = String::from("geerpc services:\n");
        for name in &names {
            let mut methods: Vec<_> = services[name]
                .methods()
                .map(|m| (m.name().to_owned(), m.num_calls()))
                .collect();
            methods.sort();
            for (method, calls) in methods {
                out.push_str(&format!("{name}.{method}: {calls} calls\n"));
            }
        }
        out
    }
}

fn send_response(writer: &SharedWriter, header: &Header, body: &[u8]) {
    let mut writer = writer.lock().unwrap();
    if let Err(e) = writer.write(header, body) {
        error!("rpc server: write response error: {e}");
    }
}

fn handle_request(
    writer: &SharedWriter,
    mut header: Header,
    method: Arc<MethodDescriptor>,
    codec_type: CodecType,
    body: Vec<u8>,
    timeout: Duration,
) {
    let result = if timeout.is_zero() {
        method.call(codec_type, &body)
    } else {
        let (tx, rx) = mpsc::channel();
        go!(move || {
            let _ = tx.send(method.call(codec_type, &body));
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => result,
            // the invocation keeps running, but its result will never be
            // sent; the response slot is spent on the timeout error
            Err(_) => Err(Error::HandleTimeout(timeout)),
        }
    };
    match result {
        Ok(reply) => send_response(writer, &header, &reply),
        Err(e) => {
            header.error = e.to_string();
            send_response(writer, &header, &[]);
        }
    }
}

/// Handle of a background serving coroutine. Dropping it stops the
/// accept loop and every session it spawned.
pub struct ServerInstance {
    handle: Option<coroutine::JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl ServerInstance {
    pub(crate) fn new(
        handle: Option<coroutine::JoinHandle<()>>,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        ServerInstance { handle, local_addr }
    }

    /// The bound TCP address, if this instance listens on TCP.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Wait until the accept loop stops.
    pub fn join(mut self) -> std::thread::Result<()> {
        if let Some(handle) = self.handle.take() {
            handle.join()
        } else {
            Ok(())
        }
    }
}

impl Drop for ServerInstance {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { handle.coroutine().cancel() };
            handle.join().ok();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Foo;

    fn foo_service(name: &str) -> Service {
        Service::build(name, Foo)
            .method("Sum", |_: &Foo, (a, b): (i32, i32), reply: &mut i32| {
                *reply = a + b;
                Ok(())
            })
            .finish()
    }

    #[test]
    fn duplicate_registration_fails_without_mutation() {
        let server = Server::new();
        server.register(foo_service("Foo")).unwrap();
        let before = server.find_method("Foo.Sum").unwrap();
        let arg = CodecType::Bincode.encode(&(1, 2)).unwrap();
        before.call(CodecType::Bincode, &arg).unwrap();

        let err = server.register(foo_service("Foo")).unwrap_err();
        assert!(matches!(err, Error::DuplicateService(_)));
        // still the original descriptor, counter intact
        let after = server.find_method("Foo.Sum").unwrap();
        assert_eq!(after.num_calls(), 1);
    }

    #[test]
    fn lookup_errors_are_distinct() {
        let server = Server::new();
        server.register(foo_service("Foo")).unwrap();

        assert!(matches!(
            server.find_method("NoDot"),
            Err(Error::IllFormedServiceMethod(_))
        ));
        assert!(matches!(
            server.find_method("Bar.Sum"),
            Err(Error::ServiceNotFound(_))
        ));
        assert!(matches!(
            server.find_method("Foo.Nope"),
            Err(Error::MethodNotFound(s)) if s == "Nope"
        ));
        assert!(server.find_method("Foo.Sum").is_ok());
    }

    #[test]
    fn nested_service_method_splits_at_the_last_dot() {
        let server = Server::new();
        server.register(foo_service("ns.Foo")).unwrap();
        assert!(server.find_method("ns.Foo.Sum").is_ok());
    }
}
