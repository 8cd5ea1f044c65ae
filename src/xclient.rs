use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use may::sync::{mpsc, Mutex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::{CallHandle, Client};
use crate::errors::{Error, Result};
use crate::http;
use crate::options::Options;

/// How a balanced client picks among known servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// uniformly sample an address
    Random,
    /// walk the address list, starting from a random position
    RoundRobin,
}

/// Where a balanced client learns its server addresses from.
///
/// Addresses use the `protocol@addr` form, e.g. `tcp@127.0.0.1:9999`,
/// `http@127.0.0.1:9999` or `unix@/tmp/geerpc.sock`.
pub trait Discovery: Send + Sync {
    /// Re-fetch the address set from wherever it comes from.
    fn refresh(&self) -> Result<()>;
    /// Replace the address set by hand.
    fn update(&self, servers: Vec<String>) -> Result<()>;
    /// Pick one address according to `mode`.
    fn get(&self, mode: SelectMode) -> Result<String>;
    /// An independent copy of the whole address set.
    fn get_all(&self) -> Result<Vec<String>>;
}

struct DiscoveryInner {
    rng: StdRng,
    servers: Vec<String>,
    index: usize,
}

/// A discovery over a hand-maintained server list, no register center
/// involved.
pub struct MultiServersDiscovery {
    inner: Mutex<DiscoveryInner>,
}

impl MultiServersDiscovery {
    /// Build from an explicit address list.
    pub fn new(servers: Vec<String>) -> Self {
        let mut rng = StdRng::from_entropy();
        // start from a random position so co-located instances don't
        // march over the servers in step
        let index = rng.gen_range(0..u32::MAX as usize);
        MultiServersDiscovery {
            inner: Mutex::new(DiscoveryInner {
                rng,
                servers,
                index,
            }),
        }
    }
}

impl Discovery for MultiServersDiscovery {
    fn refresh(&self) -> Result<()> {
        // nothing to refresh from
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<()> {
        self.inner.lock().unwrap().servers = servers;
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        let n = inner.servers.len();
        if n == 0 {
            return Err(Error::NoAvailableServers);
        }
        match mode {
            SelectMode::Random => {
                let i = inner.rng.gen_range(0..n);
                Ok(inner.servers[i].clone())
            }
            SelectMode::RoundRobin => {
                // servers may have been updated since, so mod n for safety
                let server = inner.servers[inner.index % n].clone();
                inner.index = (inner.index + 1) % n;
                Ok(server)
            }
        }
    }

    fn get_all(&self) -> Result<Vec<String>> {
        Ok(self.inner.lock().unwrap().servers.clone())
    }
}

/// How long a registry answer stays fresh before the next `get` refreshes.
pub const DEFAULT_UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// A discovery backed by a register center, refreshing its list over HTTP
/// when stale.
pub struct RegistryDiscovery {
    registry_url: String,
    update_timeout: Duration,
    last_update: Mutex<Option<Instant>>,
    servers: MultiServersDiscovery,
}

impl RegistryDiscovery {
    /// Point at the registry endpoint, e.g.
    /// `http://127.0.0.1:9999/_geerpc_/registry`. A zero `update_timeout`
    /// means the default freshness window.
    pub fn new(registry_url: impl Into<String>, update_timeout: Duration) -> Self {
        let update_timeout = if update_timeout.is_zero() {
            DEFAULT_UPDATE_TIMEOUT
        } else {
            update_timeout
        };
        RegistryDiscovery {
            registry_url: registry_url.into(),
            update_timeout,
            last_update: Mutex::new(None),
            servers: MultiServersDiscovery::new(Vec::new()),
        }
    }
}

impl Discovery for RegistryDiscovery {
    fn refresh(&self) -> Result<()> {
        let mut last_update = self.last_update.lock().unwrap();
        if matches!(*last_update, Some(at) if at.elapsed() < self.update_timeout) {
            return Ok(());
        }
        info!("rpc registry: refresh servers from registry {}", self.registry_url);
        let head = http::get(&self.registry_url)?;
        let servers: Vec<String> = http::header_value(&head.headers, "X-Servers")
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        self.servers.update(servers)?;
        *last_update = Some(Instant::now());
        Ok(())
    }

    fn update(&self, servers: Vec<String>) -> Result<()> {
        // a manual update is newer than anything the registry said
        let mut last_update = self.last_update.lock().unwrap();
        self.servers.update(servers)?;
        *last_update = Some(Instant::now());
        Ok(())
    }

    fn get(&self, mode: SelectMode) -> Result<String> {
        self.refresh()?;
        self.servers.get(mode)
    }

    fn get_all(&self) -> Result<Vec<String>> {
        self.refresh()?;
        self.servers.get_all()
    }
}

/// Dial a `protocol@addr` endpoint.
pub fn dial_rpc_addr(rpc_addr: &str, opt: Options) -> Result<Client> {
    let (protocol, addr) = rpc_addr.split_once('@').ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("rpc client err: wrong format '{rpc_addr}', expect protocol@addr"),
        ))
    })?;
    match protocol {
        "tcp" => Client::dial_with(addr, opt),
        "http" => Client::dial_http_with(addr, opt),
        #[cfg(unix)]
        "unix" => Client::dial_unix_with(addr, opt),
        _ => Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("rpc client err: unsupported protocol '{protocol}'"),
        ))),
    }
}

/// A load-balanced client over a [`Discovery`], reusing one [`Client`] per
/// address for as long as it stays available.
pub struct XClient<D: Discovery> {
    discovery: D,
    mode: SelectMode,
    opt: Options,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl<D: Discovery> XClient<D> {
    /// Build a balanced client.
    pub fn new(discovery: D, mode: SelectMode, opt: Options) -> Self {
        XClient {
            discovery,
            mode,
            opt,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn dial(&self, rpc_addr: &str) -> Result<Arc<Client>> {
        let mut clients = self.clients.lock().unwrap();
        if let Some(client) = clients.get(rpc_addr) {
            if client.is_available() {
                return Ok(client.clone());
            }
            client.close().ok();
            clients.remove(rpc_addr);
        }
        let client = Arc::new(dial_rpc_addr(rpc_addr, self.opt.clone())?);
        clients.insert(rpc_addr.to_owned(), client.clone());
        Ok(client)
    }

    /// Invoke the named method on one server picked by the discovery.
    pub fn call<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        let rpc_addr = self.discovery.get(self.mode)?;
        self.dial(&rpc_addr)?.call(service_method, args)
    }

    /// Like [`call`](XClient::call) with a caller-side deadline.
    pub fn call_timeout<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
        timeout: Duration,
    ) -> Result<R> {
        let rpc_addr = self.discovery.get(self.mode)?;
        self.dial(&rpc_addr)?.call_timeout(service_method, args, timeout)
    }

    /// Invoke the named method on every known server at once.
    ///
    /// The first successful reply wins and later successes are discarded.
    /// The first error is recorded and aborts the still-outstanding
    /// siblings, but a success from any server masks it; the error is only
    /// returned when nobody succeeded.
    pub fn broadcast<A: Serialize, R: DeserializeOwned>(
        &self,
        service_method: &str,
        args: &A,
    ) -> Result<R> {
        let servers = self.discovery.get_all()?;
        let (tx, rx) = mpsc::channel();
        let mut outstanding: Vec<Option<CallHandle>> = Vec::with_capacity(servers.len());
        let mut remaining = 0usize;
        let mut first_err: Option<Error> = None;
        let mut winner: Option<R> = None;

        for (index, rpc_addr) in servers.iter().enumerate() {
            let issued = self.dial(rpc_addr).and_then(|client| {
                client.go_with(service_method, args, tx.clone(), index as u64)
            });
            match issued {
                Ok(handle) => {
                    outstanding.push(Some(handle));
                    remaining += 1;
                }
                Err(e) => {
                    outstanding.push(None);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        drop(tx);
        if first_err.is_some() {
            remaining -= cancel_outstanding(&mut outstanding);
        }

        while remaining > 0 {
            let (token, result) = match rx.recv() {
                Ok(completion) => completion,
                Err(_) => break,
            };
            remaining -= 1;
            outstanding[token as usize] = None;
            let outcome = match result {
                // a success after the winner is discarded undecoded
                Ok(_) if winner.is_some() => continue,
                Ok(body) => self
                    .opt
                    .codec_type
                    .decode::<R>(&body)
                    .map_err(Error::ClientDeserialize),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(value) => winner = Some(value),
                Err(e) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                        remaining -= cancel_outstanding(&mut outstanding);
                    }
                }
            }
        }

        match winner {
            Some(value) => Ok(value),
            None => Err(first_err.unwrap_or(Error::NoAvailableServers)),
        }
    }

    /// Close and evict every cached client.
    pub fn close(&self) {
        let mut clients = self.clients.lock().unwrap();
        for (_, client) in clients.drain() {
            client.close().ok();
        }
    }
}

/// Abandon every still-running call; returns how many were abandoned.
/// A handle whose completion already raced onto the channel stays counted
/// as expected.
fn cancel_outstanding(outstanding: &mut [Option<CallHandle>]) -> usize {
    let mut cancelled = 0;
    for slot in outstanding.iter_mut() {
        if let Some(handle) = slot.take() {
            if handle.cancel() {
                cancelled += 1;
            }
        }
    }
    cancelled
}
