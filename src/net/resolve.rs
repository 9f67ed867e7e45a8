//! Asynchronous name resolution.
//!
//! `getaddrinfo` blocks for unbounded time, so lookups run on a dedicated
//! [`Worker`] draining a bounded request queue; callers get a
//! [`Future`] that resolves to the candidate address list. A process-wide
//! resolver instance serves the transport layer.

use crate::error::Result;
use crate::net::addr::{AddressList, Endpoint};
use crate::sync::future::{pair, Future, Promise};
use crate::sync::queue::Queue;
use crate::worker::Worker;
use std::sync::OnceLock;

type ResolveRequest = (Endpoint, Promise<AddressList>);

const REQUEST_QUEUE_DEPTH: usize = 64;

/// A name-resolver worker.
pub struct Resolver {
    requests: Queue<ResolveRequest>,
    _worker: Worker,
}

impl Resolver {
    /// Creates a resolver with its own worker thread.
    ///
    /// # Errors
    ///
    /// `io_error` if the worker or its queue cannot be created.
    pub fn new() -> Result<Self> {
        let requests: Queue<ResolveRequest> = Queue::new(REQUEST_QUEUE_DEPTH)?;
        let feed = requests.clone();
        let worker = Worker::spawn_daemon("resolver", move || loop {
            let (endpoint, promise) = feed.get()?;
            tracing::trace!(endpoint = %endpoint, "resolving");
            promise.set_result(endpoint.resolve_blocking());
        })?;
        Ok(Self {
            requests,
            _worker: worker,
        })
    }

    /// The process-wide resolver.
    ///
    /// # Panics
    ///
    /// Panics if the resolver cannot be started on first use; this only
    /// happens when the process is out of threads or file descriptors.
    #[must_use]
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<Resolver> = OnceLock::new();
        GLOBAL.get_or_init(|| Resolver::new().expect("resolver startup"))
    }

    /// Queues a lookup and returns a future for its result.
    ///
    /// # Errors
    ///
    /// `cancelled` or `deadline_exceeded` from the current context while
    /// waiting for queue room.
    pub fn async_resolve(&self, endpoint: Endpoint) -> Result<Future<AddressList>> {
        let (promise, future) = pair()?;
        self.requests.put((endpoint, promise))?;
        Ok(future)
    }

    /// Resolves an endpoint, blocking until the worker answers.
    ///
    /// # Errors
    ///
    /// Resolution errors from the endpoint, or `cancelled` /
    /// `deadline_exceeded` from the current context.
    pub fn resolve(&self, endpoint: Endpoint) -> Result<AddressList> {
        self.async_resolve(endpoint)?.get()
    }
}

impl std::fmt::Debug for Resolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolver")
            .field("queued", &self.requests.len())
            .finish()
    }
}
