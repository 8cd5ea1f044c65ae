use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::{Duration, Instant};

use co_managed::Manager;
use may::net::{TcpListener, TcpStream};
use may::sync::Mutex;
use may::{coroutine, go};

use crate::http;
use crate::server::ServerInstance;

/// HTTP path the registry answers on.
pub const DEFAULT_REGISTRY_PATH: &str = "/_geerpc_/registry";

/// How long a server stays listed without a fresh heartbeat.
pub const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);

/// A simple register center: accepts heartbeats to keep servers alive and
/// answers list queries, pruning dead servers as it goes.
///
/// Everything useful travels in HTTP headers: `GET` returns the alive list
/// in `X-Servers`, `POST` upserts the address in `X-Server`. Cheap to
/// clone; clones share the same server map.
#[derive(Clone)]
pub struct Registry {
    shared: Arc<Shared>,
}

struct Shared {
    ttl: Duration,
    servers: Mutex<HashMap<String, Instant>>,
}

impl Registry {
    /// Create a registry; entries older than `ttl` are dead. A zero `ttl`
    /// means entries never expire.
    pub fn new(ttl: Duration) -> Registry {
        Registry {
            shared: Arc::new(Shared {
                ttl,
                servers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Insert the address, or refresh its keep-alive time if present.
    pub fn put_server(&self, addr: &str) {
        let mut servers = self.shared.servers.lock().unwrap();
        servers.insert(addr.to_owned(), Instant::now());
    }

    /// All alive addresses, sorted; dead entries are removed on the way.
    pub fn alive_servers(&self) -> Vec<String> {
        let mut servers = self.shared.servers.lock().unwrap();
        let now = Instant::now();
        let ttl = self.shared.ttl;
        if !ttl.is_zero() {
            servers.retain(|_, last_seen| *last_seen + ttl > now);
        }
        let mut alive: Vec<String> = servers.keys().cloned().collect();
        alive.sort();
        alive
    }

    fn serve_conn(&self, mut stream: TcpStream) {
        let req = match http::read_request_head(&mut stream) {
            Ok(req) => req,
            Err(e) => {
                error!("rpc registry: http read error: {e}");
                return;
            }
        };
        if req.path != DEFAULT_REGISTRY_PATH {
            let _ = http::write_response(&mut stream, "404 Not Found", &[], "");
            return;
        }
        match req.method.as_str() {
            "GET" => {
                let servers = self.alive_servers().join(",");
                let _ = http::write_response(
                    &mut stream,
                    "200 OK",
                    &[("X-Servers", servers.as_str())],
                    "",
                );
            }
            "POST" => match http::header_value(&req.headers, "X-Server") {
                Some(addr) if !addr.is_empty() => {
                    self.put_server(addr);
                    let _ = http::write_response(&mut stream, "200 OK", &[], "");
                }
                _ => {
                    let _ =
                        http::write_response(&mut stream, "500 Internal Server Error", &[], "");
                }
            },
            _ => {
                let _ = http::write_response(&mut stream, "405 Method Not Allowed", &[], "");
            }
        }
    }

    /// Bind `addr` and serve registry queries in a background coroutine.
    pub fn start<L: ToSocketAddrs>(&self, addr: L) -> std::io::Result<ServerInstance> {
        let listener = TcpListener::bind(addr)?;
        let local_addr = listener.local_addr()?;
        info!("rpc registry: listening on {local_addr}");
        let registry = self.clone();
        let handle = go!(
            coroutine::Builder::new().name("RpcRegistry".to_owned()),
            move || {
                let manager = Manager::new();
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            error!("rpc registry: accept error: {e}");
                            return;
                        }
                    };
                    let registry = registry.clone();
                    manager.add(move |_| registry.serve_conn(stream));
                }
            }
        )?;
        Ok(ServerInstance::new(Some(handle), Some(local_addr)))
    }
}

/// A running heartbeat loop; dropping it stops the beats.
pub struct Heartbeat(Option<coroutine::JoinHandle<()>>);

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            unsafe { handle.coroutine().cancel() };
            handle.join().ok();
        }
    }
}

/// Register `addr` with the registry at `registry_url` and keep it alive.
///
/// Sends one heartbeat immediately (its failure is returned), then beats
/// every `period` until one fails, at which point the loop stops for good.
/// A zero `period` defaults to the registry TTL minus a minute, leaving
/// enough slack for a beat to land before the entry expires.
pub fn heartbeat(registry_url: &str, addr: &str, period: Duration) -> std::io::Result<Heartbeat> {
    let period = if period.is_zero() {
        DEFAULT_TTL - Duration::from_secs(60)
    } else {
        period
    };
    send_heartbeat(registry_url, addr)?;
    let registry_url = registry_url.to_owned();
    let addr = addr.to_owned();
    let handle = go!(
        coroutine::Builder::new().name("RegistryHeartbeat".to_owned()),
        move || loop {
            coroutine::sleep(period);
            if let Err(e) = send_heartbeat(&registry_url, &addr) {
                error!("rpc server: heart beat err: {e}");
                return;
            }
        }
    )?;
    Ok(Heartbeat(Some(handle)))
}

fn send_heartbeat(registry_url: &str, addr: &str) -> std::io::Result<()> {
    info!("{addr} send heart beat to registry {registry_url}");
    http::post(registry_url, &[("X-Server", addr)])
}
