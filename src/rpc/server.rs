//! The server-side dispatcher.
//!
//! A [`Server`] owns a listening channel, an acceptor worker, one receiver
//! worker per connection, and a small executor pool that runs request
//! handlers. Objects are registered by name; each method is keyed by
//! `(method name, signature hash)` so schema-mismatched clients are
//! rejected with `data_mismatch`.
//!
//! Every request runs under its own child context loaded from the wire
//! snapshot in the envelope, so the caller's deadline and cancellation
//! reach the handler: a `CANCEL_REQUEST` for an in-flight request cancels
//! that context, and handlers suspended in `select` observe it
//! immediately. Error mapping for a request that never reaches its
//! handler: unknown object or method name is `not_found`, a signature
//! hash mismatch is `data_mismatch`, and argument decoding failures are
//! `invalid_argument`. The outcome travels back as a
//! [`ResultHolder`](crate::wire::ResultHolder) envelope either way.

use crate::config::ServerOptions;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::net::addr::{Address, Endpoint};
use crate::net::channel::Channel;
use crate::net::resolve::Resolver;
use crate::rpc::message::{self, Header, MessageType, RequestId};
use crate::select::select;
use crate::sync::queue::Queue;
use crate::transport::{read_packet, write_packet, StreamConnection};
use crate::util::FlatMap;
use crate::wire::{ErrorEnvelope, Wire, WireReader};
use crate::worker::Worker;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

/// A registered method body: decodes arguments from the reader and
/// returns the encoded result value.
pub type HandlerFn = Arc<dyn Fn(&Context, &mut WireReader<'_>) -> Result<Vec<u8>> + Send + Sync>;

struct MethodEntry {
    hash: u64,
    handler: HandlerFn,
}

#[derive(Default)]
struct ObjectEntry {
    methods: FlatMap<String, MethodEntry>,
}

type Job = Box<dyn FnOnce() + Send>;

struct ServerShared {
    objects: RwLock<FlatMap<String, ObjectEntry>>,
    jobs: Queue<Job>,
    options: ServerOptions,
}

impl ServerShared {
    fn dispatch(
        &self,
        ctx: &Context,
        object: &str,
        method: &str,
        hash: u64,
        args: &[u8],
    ) -> Result<Vec<u8>> {
        let handler = {
            let objects = self.objects.read();
            let entry = objects
                .get(&object.to_string())
                .ok_or_else(|| Error::not_found(format!("unknown object {object}")))?;
            let method_entry = entry
                .methods
                .get(&method.to_string())
                .ok_or_else(|| Error::not_found(format!("unknown method {object}.{method}")))?;
            if method_entry.hash != hash {
                return Err(Error::data_mismatch(format!(
                    "signature mismatch for {object}.{method}"
                )));
            }
            Arc::clone(&method_entry.handler)
        };
        let mut reader = WireReader::new(args);
        handler(ctx, &mut reader)
    }
}

/// Encodes a dispatch outcome as `ResultHolder` bytes. The success path
/// splices in the handler's already-encoded value.
fn encode_outcome(outcome: Result<Vec<u8>>) -> Vec<u8> {
    match outcome {
        Ok(value_bytes) => {
            let mut buf = Vec::with_capacity(value_bytes.len() + 1);
            buf.push(0);
            buf.extend_from_slice(&value_bytes);
            buf
        }
        Err(e) => {
            let mut buf = vec![1];
            ErrorEnvelope::from_error(&e).encode(&mut buf);
            buf
        }
    }
}

fn connection_loop(shared: &Arc<ServerShared>, channel: Channel) -> Result<()> {
    let conn = Arc::new(StreamConnection::new(channel)?);
    let send_mu = Arc::new(Mutex::new(()));
    let active: Arc<Mutex<FlatMap<RequestId, Context>>> = Arc::new(Mutex::new(FlatMap::new()));

    loop {
        let packet = match read_packet(&conn, shared.options.max_packet_size) {
            Ok(packet) => packet,
            Err(e) if e.is_cancelled() || e.is_deadline() => return Err(e),
            Err(e) => {
                tracing::debug!(error = %e, "connection closed");
                return Ok(());
            }
        };

        let mut r = WireReader::new(&packet);
        let header = match Header::decode(&mut r) {
            Ok(header) => header,
            Err(e) => {
                tracing::debug!(error = %e, "dropping connection with malformed envelope");
                return Ok(());
            }
        };

        match header.message_type {
            MessageType::Request => {
                if let Err(e) = enqueue_request(shared, &conn, &send_mu, &active, header.request_id, &mut r)
                {
                    if e.is_cancelled() || e.is_deadline() {
                        return Err(e);
                    }
                    tracing::debug!(error = %e, "dropping connection with malformed request");
                    return Ok(());
                }
            }
            MessageType::CancelRequest => {
                let cancelled = active.lock().get(&header.request_id).cloned();
                if let Some(ctx) = cancelled {
                    tracing::trace!(request_id = header.request_id, "cancelling request");
                    ctx.cancel();
                }
            }
            MessageType::Response => {
                tracing::debug!("dropping connection sending response envelopes");
                return Ok(());
            }
        }
    }
}

fn enqueue_request(
    shared: &Arc<ServerShared>,
    conn: &Arc<StreamConnection>,
    send_mu: &Arc<Mutex<()>>,
    active: &Arc<Mutex<FlatMap<RequestId, Context>>>,
    request_id: RequestId,
    r: &mut WireReader<'_>,
) -> Result<()> {
    let object = String::decode(r)?;
    let method = String::decode(r)?;
    let hash = u64::decode(r)?;
    let request_ctx = Context::child_of_current()?;
    if let Err(e) = request_ctx.apply_wire(r) {
        // A context snapshot this build cannot decode fails the one
        // request, not the connection.
        let response = message::encode_response(request_id, &encode_outcome(Err(e)));
        let _guard = send_mu.lock();
        if let Err(e) = write_packet(conn, &response, shared.options.max_packet_size) {
            tracing::debug!(request_id, error = %e, "response not delivered");
        }
        return Ok(());
    }
    let args = r.rest().to_vec();

    active.lock().replace(request_id, request_ctx.clone());

    let job_shared = Arc::clone(shared);
    let job_conn = Arc::clone(conn);
    let job_send_mu = Arc::clone(send_mu);
    let job_active = Arc::clone(active);
    shared.jobs.put(Box::new(move || {
        let outcome = {
            let _scope = request_ctx.enter();
            job_shared.dispatch(&request_ctx, &object, &method, hash, &args)
        };
        let response = message::encode_response(request_id, &encode_outcome(outcome));
        {
            let _guard = job_send_mu.lock();
            if let Err(e) = write_packet(&job_conn, &response, job_shared.options.max_packet_size) {
                tracing::debug!(request_id, error = %e, "response not delivered");
            }
        }
        job_active.lock().remove(&request_id);
    }))
}

/// An RPC server bound to a local endpoint.
///
/// Dropping the server stops accepting, cancels every connection and
/// in-flight request context, and joins all workers.
pub struct Server {
    shared: Arc<ServerShared>,
    local_addr: Address,
    acceptor: Option<Worker>,
    connections: Arc<Mutex<Vec<Worker>>>,
    executors: Vec<Worker>,
}

impl Server {
    /// Binds to the endpoint and starts accepting connections.
    ///
    /// # Errors
    ///
    /// Resolution or socket errors, or worker allocation failures.
    pub fn bind(endpoint: Endpoint, options: ServerOptions) -> Result<Self> {
        let addresses = Resolver::global().resolve(endpoint)?;
        let addr = addresses[0];
        let listener = Channel::stream_for(&addr)?;
        listener.set_reuse_addr(true)?;
        listener.bind(&addr)?;
        listener.listen(options.backlog)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(ServerShared {
            objects: RwLock::new(FlatMap::new()),
            jobs: Queue::new(options.job_queue_depth)?,
            options,
        });

        let mut executors = Vec::new();
        for i in 0..shared.options.executor_threads.max(1) {
            let jobs = shared.jobs.clone();
            executors.push(Worker::spawn_daemon(&format!("rpc-server-exec-{i}"), move || {
                loop {
                    let job = jobs.get()?;
                    job();
                }
            })?);
        }

        let connections: Arc<Mutex<Vec<Worker>>> = Arc::new(Mutex::new(Vec::new()));
        let acceptor_shared = Arc::clone(&shared);
        let acceptor_connections = Arc::clone(&connections);
        let acceptor = Worker::spawn_daemon("rpc-server-acceptor", move || {
            loop {
                let (accepted,) = select((listener.async_accept(),))?;
                let Some((channel, peer)) = accepted else {
                    continue;
                };
                tracing::debug!(peer = %peer, "accepted connection");
                let conn_shared = Arc::clone(&acceptor_shared);
                let worker = Worker::spawn(&format!("rpc-server-conn-{peer}"), move || {
                    connection_loop(&conn_shared, channel)
                })?;
                let mut conns = acceptor_connections.lock();
                conns.retain(|w| !w.is_finished());
                conns.push(worker);
            }
        })?;

        tracing::debug!(address = %local_addr, "server listening");
        Ok(Self {
            shared,
            local_addr,
            acceptor: Some(acceptor),
            connections,
            executors,
        })
    }

    /// The bound listening address.
    #[must_use]
    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    /// Registers one method of `object`.
    ///
    /// Usually called through the `register` function an
    /// [`rpc_interface!`](crate::rpc_interface) expansion generates.
    ///
    /// # Errors
    ///
    /// `invalid_state` if the method is already registered.
    pub fn register_method(
        &self,
        object: &str,
        method: &str,
        hash: u64,
        handler: HandlerFn,
    ) -> Result<()> {
        let mut objects = self.shared.objects.write();
        if objects.get(&object.to_string()).is_none() {
            objects.insert(object.to_string(), ObjectEntry::default());
        }
        let entry = objects
            .get_mut(&object.to_string())
            .ok_or_else(|| Error::internal("object entry vanished during registration"))?;
        if !entry
            .methods
            .insert(method.to_string(), MethodEntry {
                hash,
                handler,
            })
        {
            return Err(Error::invalid_state(format!(
                "{object}.{method} is already registered"
            )));
        }
        Ok(())
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Cancelling the acceptor's context also cancels every connection
        // worker and request context underneath it.
        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.context().cancel();
            acceptor.join();
        }
        let workers: Vec<Worker> = self.connections.lock().drain(..).collect();
        drop(workers);
        self.executors.clear();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("address", &self.local_addr.to_string())
            .field("objects", &self.shared.objects.read().len())
            .finish()
    }
}
