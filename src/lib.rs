//! geerpc is a small RPC framework for rust based on coroutines, exposing
//! in-process methods as network-callable services over TCP, unix sockets
//! or an HTTP CONNECT upgrade.
//!
//! Every connection starts with a JSON options preamble picking the codec,
//! then carries codec-encoded header/body pairs. A single [`Client`] is a
//! multiplexer: many coroutines call through one connection concurrently
//! and responses are matched back by sequence number. On top of the core
//! sit a TTL-based [`Registry`] with heartbeats and a load-balanced
//! [`XClient`] that can broadcast a call to every known server.
//!
//! Example usage:
//!
//! ```
//! use geerpc::{Client, Server, Service};
//!
//! struct Foo;
//!
//! let server = Server::new();
//! server
//!     .register(
//!         Service::build("Foo", Foo)
//!             .method("Sum", |_: &Foo, (a, b): (i32, i32), reply: &mut i32| {
//!                 *reply = a + b;
//!                 Ok(())
//!             })
//!             .finish(),
//!     )
//!     .unwrap();
//! let instance = server.start("127.0.0.1:0").unwrap();
//!
//! let client = Client::dial(instance.local_addr().unwrap()).unwrap();
//! let sum: i32 = client.call("Foo.Sum", &(1, 2)).unwrap();
//! assert_eq!(sum, 3);
//! ```

#[macro_use]
extern crate log;

mod client;
mod codec;
mod errors;
mod http;
mod options;
mod registry;
mod server;
mod service;
mod stream;
mod xclient;

pub use client::{Call, CallHandle, Client, Completion, DoneSender};
pub use codec::{CodecRead, CodecType, CodecWrite, Header};
pub use errors::{Error, Result};
pub use options::{Options, MAGIC};
pub use registry::{heartbeat, Heartbeat, Registry, DEFAULT_REGISTRY_PATH, DEFAULT_TTL};
pub use server::{Server, ServerInstance, DEFAULT_DEBUG_PATH, DEFAULT_RPC_PATH};
pub use service::{MethodDescriptor, Service, ServiceBuilder};
pub use stream::StreamExt;
pub use xclient::{
    dial_rpc_addr, Discovery, MultiServersDiscovery, RegistryDiscovery, SelectMode, XClient,
    DEFAULT_UPDATE_TIMEOUT,
};

use std::sync::OnceLock;

/// The process-wide default server, created on first use. The core works
/// without it; these conveniences just route to one shared instance.
pub fn default_server() -> &'static Server {
    static DEFAULT_SERVER: OnceLock<Server> = OnceLock::new();
    DEFAULT_SERVER.get_or_init(Server::new)
}

/// Publish a service on the default server.
pub fn register(service: Service) -> Result<()> {
    default_server().register(service)
}

/// Start the default server on `addr`.
pub fn start<L: std::net::ToSocketAddrs>(addr: L) -> std::io::Result<ServerInstance> {
    default_server().start(addr)
}

/// Start the default server's HTTP CONNECT endpoint on `addr`.
pub fn start_http<L: std::net::ToSocketAddrs>(addr: L) -> std::io::Result<ServerInstance> {
    default_server().start_http(addr)
}

/// The process-wide default registry, created with [`DEFAULT_TTL`] on
/// first use.
pub fn default_registry() -> &'static Registry {
    static DEFAULT_REGISTRY: OnceLock<Registry> = OnceLock::new();
    DEFAULT_REGISTRY.get_or_init(|| Registry::new(DEFAULT_TTL))
}
