use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::CodecType;
use crate::errors::{Error, Result};

type Invoker = Box<dyn Fn(CodecType, &[u8]) -> Result<Vec<u8>> + Send + Sync>;

/// One callable method of a registered service.
///
/// Holds the method name, a monotonic call counter and the invoker that
/// decodes the argument, runs the user function against the receiver and
/// encodes the reply.
pub struct MethodDescriptor {
    name: String,
    num_calls: AtomicU64,
    invoke: Invoker,
}

impl MethodDescriptor {
    /// The bare method name (without the service prefix).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// How many times this method has been invoked.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::Relaxed)
    }

    pub(crate) fn call(&self, codec_type: CodecType, arg: &[u8]) -> Result<Vec<u8>> {
        self.num_calls.fetch_add(1, Ordering::Relaxed);
        (self.invoke)(codec_type, arg)
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("name", &self.name)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named set of methods sharing one receiver, ready to be registered
/// with a [`Server`](crate::Server).
///
/// ```
/// use geerpc::Service;
///
/// struct Foo;
///
/// let service = Service::build("Foo", Foo)
///     .method("Sum", |_foo: &Foo, (a, b): (i32, i32), reply: &mut i32| {
///         *reply = a + b;
///         Ok(())
///     })
///     .finish();
/// assert_eq!(service.name(), "Foo");
/// ```
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    /// Start building a service named `name` around `receiver`.
    pub fn build<T: Send + Sync + 'static>(
        name: impl Into<String>,
        receiver: T,
    ) -> ServiceBuilder<T> {
        ServiceBuilder {
            name: name.into(),
            receiver: Arc::new(receiver),
            methods: HashMap::new(),
        }
    }

    /// The service name, unique per server.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn method(&self, name: &str) -> Option<Arc<MethodDescriptor>> {
        self.methods.get(name).cloned()
    }

    /// All methods of this service, in no particular order.
    pub fn methods(&self) -> impl Iterator<Item = &MethodDescriptor> {
        self.methods.values().map(|m| m.as_ref())
    }
}

/// Builder collecting the typed methods of a [`Service`].
pub struct ServiceBuilder<T> {
    name: String,
    receiver: Arc<T>,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl<T: Send + Sync + 'static> ServiceBuilder<T> {
    /// Register one method.
    ///
    /// The argument is decoded into a fresh `A`; the reply starts from
    /// `R::default()`, so containers are always initialized and the user
    /// function only fills in what it needs. The function's error is carried
    /// back to the caller in the response header.
    ///
    /// Panics if `name` was already registered on this service.
    pub fn method<A, R, F>(mut self, name: &str, f: F) -> Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + Default + 'static,
        F: Fn(&T, A, &mut R) -> Result<()> + Send + Sync + 'static,
    {
        let receiver = self.receiver.clone();
        let invoke: Invoker = Box::new(move |codec_type, arg_bytes| {
            let arg: A = codec_type
                .decode(arg_bytes)
                .map_err(Error::ServerDeserialize)?;
            let mut reply = R::default();
            f(&receiver, arg, &mut reply)?;
            codec_type.encode(&reply).map_err(Error::ServerSerialize)
        });
        let descriptor = Arc::new(MethodDescriptor {
            name: name.to_owned(),
            num_calls: AtomicU64::new(0),
            invoke,
        });
        let prev = self.methods.insert(name.to_owned(), descriptor);
        assert!(prev.is_none(), "method already defined: {}.{}", self.name, name);
        self
    }

    /// Finish building; the receiver is shared by all registered methods.
    pub fn finish(self) -> Service {
        Service {
            name: self.name,
            methods: self.methods,
        }
    }
}
