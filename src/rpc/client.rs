//! The client connection engine.
//!
//! A [`ClientConnection`] turns method invocations into framed request
//! envelopes over one reconnecting transport, matching responses back to
//! pending calls by request id. Two workers run per connection:
//!
//! - the **receiver** waits for the transport to become ready, then reads
//!   response packets and fulfils pending promises. Any transport failure
//!   rejects *every* in-flight call with that failure, resets the ready
//!   flag, and disconnects, exactly once per failure episode;
//! - the **scavenger** enforces request deadlines and forwards
//!   cancellations to the peer. It selects on two best-effort signal
//!   queues (`new_deadline`, `cancelled_requests`) and a timer for the
//!   earliest pending deadline. The queues tolerate drops: the scavenger
//!   re-scans the pending table on every wake, so a lost signal only
//!   delays, never loses, a timeout.
//!
//! Request ids are allocated under the pending-table mutex, so entries are
//! inserted in id order before any bytes hit the wire; the sending mutex
//! serializes the transport. No lock is held across a `select`.

use crate::config::ClientOptions;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::net::addr::Endpoint;
use crate::rpc::interface::MethodDescriptor;
use crate::rpc::message::{self, Header, MessageType, RequestId};
use crate::select::select;
use crate::sync::flag::Flag;
use crate::sync::future::{pair, Future, Promise};
use crate::sync::queue::Queue;
use crate::transport::PacketConnection;
use crate::util::FlatMap;
use crate::wire::{self, ResultHolder, Wire, WireReader};
use crate::worker::Worker;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;

struct PendingRequest {
    deadline: Option<Instant>,
    result: Promise<Vec<u8>>,
}

struct PendingTable {
    sequence: RequestId,
    entries: FlatMap<RequestId, PendingRequest>,
}

struct ClientShared {
    pending: Mutex<PendingTable>,
    sending: Mutex<()>,
    transport: PacketConnection,
    ready: Flag,
    new_deadline: Queue<()>,
    cancelled_requests: Queue<RequestId>,
}

impl ClientShared {
    fn new_request_id(&self) -> RequestId {
        let mut pending = self.pending.lock();
        let id = pending.sequence;
        pending.sequence = pending.sequence.wrapping_add(1);
        id
    }

    /// Rejects and removes one pending entry; silent if already gone.
    fn abandon_request(&self, request_id: RequestId) {
        let removed = self.pending.lock().entries.remove(&request_id);
        if let Some(entry) = removed {
            entry.result.set_error(Error::cancelled("request cancelled"));
        }
    }

    /// Fulfils one pending entry; a response for an unknown id is
    /// discarded (the request was cancelled or timed out).
    fn set_response(&self, request_id: RequestId, response: Vec<u8>) {
        let removed = self.pending.lock().entries.remove(&request_id);
        match removed {
            Some(entry) => entry.result.set_value(response),
            None => tracing::trace!(request_id, "discarding response for unknown request"),
        }
    }

    /// Rejects every pending entry with `error`.
    fn broadcast_error(&self, error: &Error) {
        let drained: Vec<(RequestId, PendingRequest)> =
            self.pending.lock().entries.drain().collect();
        for (_, entry) in drained {
            entry.result.set_error(error.clone());
        }
    }

    /// Sends one packet under the sending mutex, maintaining the ready
    /// flag and tearing the transport down on failure.
    fn send(&self, data: &[u8]) -> Result<()> {
        let _guard = self.sending.lock();
        match self.transport.send(data) {
            Ok(()) => {
                self.ready.set();
                Ok(())
            }
            Err(e) => {
                self.ready.reset();
                self.transport.disconnect();
                Err(e)
            }
        }
    }

    fn send_request(&self, request_id: RequestId, data: &[u8]) -> Result<Future<Vec<u8>>> {
        let future = {
            let mut pending = self.pending.lock();
            let deadline = Context::current().deadline();
            let (promise, future) = pair()?;
            pending.entries.insert(
                request_id,
                PendingRequest {
                    deadline,
                    result: promise,
                },
            );
            if deadline.is_some() {
                // Best-effort wake; a full queue is fine because the
                // scavenger re-scans pending on its next pass.
                let _ = self.new_deadline.maybe_put(());
            }
            future
        };

        match self.send(data) {
            Ok(()) => Ok(future),
            Err(e) => {
                self.abandon_request(request_id);
                Err(e)
            }
        }
    }

    fn cancel_request(&self, request_id: RequestId) {
        self.abandon_request(request_id);
        let _ = self.cancelled_requests.maybe_put(request_id);
    }

    fn earliest_deadline(&self) -> Option<Instant> {
        self.pending
            .lock()
            .entries
            .values()
            .filter_map(|entry| entry.deadline)
            .min()
    }

    /// Sweeps pending entries whose deadline passed, rejecting each with
    /// `deadline_exceeded` and queueing a best-effort peer cancellation.
    fn sweep_deadlines(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut pending = self.pending.lock();
            let expired_ids: Vec<RequestId> = pending
                .entries
                .iter()
                .filter(|(_, entry)| entry.deadline.is_some_and(|d| d < now))
                .map(|(id, _)| *id)
                .collect();
            for id in expired_ids {
                if let Some(entry) = pending.entries.remove(&id) {
                    expired.push((id, entry));
                }
            }
        }
        if !expired.is_empty() {
            tracing::debug!(count = expired.len(), "requests timed out");
        }
        for (id, entry) in expired {
            entry
                .result
                .set_error(Error::deadline_exceeded("request timed out"));
            let _ = self.cancelled_requests.maybe_put(id);
        }
    }

    fn handle_packet(&self, packet: &[u8]) -> Result<()> {
        let mut r = WireReader::new(packet);
        let header = Header::decode(&mut r)?;
        match header.message_type {
            MessageType::Response => {
                self.set_response(header.request_id, r.rest().to_vec());
                Ok(())
            }
            _ => Err(Error::data_mismatch(format!(
                "unexpected {:?} envelope from server",
                header.message_type
            ))),
        }
    }

    fn receiver_loop(&self) -> Result<()> {
        loop {
            // Nothing to receive until a send has connected the transport.
            let _ = select((self.ready.async_wait(),))?;

            let failure = loop {
                match self.transport.receive() {
                    Ok(packet) => {
                        if let Err(e) = self.handle_packet(&packet) {
                            break e;
                        }
                    }
                    Err(e) => break e,
                }
            };

            // Hold the sending mutex so no request slips onto the dying
            // transport between reset and disconnect.
            let _guard = self.sending.lock();
            self.ready.reset();
            self.transport.disconnect();
            tracing::debug!(error = %failure, "transport failed; rejecting in-flight requests");
            self.broadcast_error(&failure);
        }
    }

    fn scavenger_loop(&self) -> Result<()> {
        loop {
            let deadline_timer = match self.earliest_deadline() {
                Some(when) => crate::awaitable::deadline_at(when),
                None => crate::awaitable::never(),
            };
            let (new_deadline, cancelled, deadline_fired) = select((
                self.new_deadline.async_get(),
                self.cancelled_requests.async_get(),
                deadline_timer,
            ))?;

            if deadline_fired.is_some() {
                self.sweep_deadlines();
            }

            if let Some(request_id) = cancelled {
                // Best-effort: the receiver handles transport failures.
                let envelope = message::encode_cancel(request_id);
                if let Err(e) = self.send(&envelope) {
                    tracing::debug!(request_id, error = %e, "cancel notice not delivered");
                }
            }

            // A new-deadline signal only forces the timer recomputation
            // at the top of the loop.
            let _ = new_deadline;
        }
    }
}

/// One client-side RPC connection.
///
/// Dropping the connection cancels its workers, disconnects the
/// transport, and joins the worker threads.
pub struct ClientConnection {
    shared: Arc<ClientShared>,
    receiver: Option<Worker>,
    scavenger: Option<Worker>,
    options: ClientOptions,
}

impl ClientConnection {
    /// Creates a connection that dials `endpoint` lazily on first use.
    ///
    /// # Errors
    ///
    /// `io_error` if workers or their plumbing cannot be created.
    pub fn new(endpoint: Endpoint, options: ClientOptions) -> Result<Self> {
        let shared = Arc::new(ClientShared {
            pending: Mutex::new(PendingTable {
                sequence: 0,
                entries: FlatMap::new(),
            }),
            sending: Mutex::new(()),
            transport: PacketConnection::new(endpoint, options.max_packet_size),
            ready: Flag::new()?,
            new_deadline: Queue::new(options.event_queue_depth)?,
            cancelled_requests: Queue::new(options.event_queue_depth)?,
        });

        let receiver_shared = Arc::clone(&shared);
        let receiver = Worker::spawn_daemon("rpc-client-receiver", move || {
            receiver_shared.receiver_loop()
        })?;
        let scavenger_shared = Arc::clone(&shared);
        let scavenger = Worker::spawn_daemon("rpc-client-scavenger", move || {
            scavenger_shared.scavenger_loop()
        })?;

        Ok(Self {
            shared,
            receiver: Some(receiver),
            scavenger: Some(scavenger),
            options,
        })
    }

    /// A handle to the remote object `name`, using this connection's
    /// default options.
    #[must_use]
    pub fn remote(&self, name: &str) -> RemoteObject {
        self.remote_with_options(name, self.options.clone())
    }

    /// A handle to the remote object `name` with per-object options.
    #[must_use]
    pub fn remote_with_options(&self, name: &str, options: ClientOptions) -> RemoteObject {
        RemoteObject {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
            options,
        }
    }

    /// Abandons a pending request locally and queues a best-effort
    /// CANCEL_REQUEST to the peer.
    pub fn cancel_request(&self, request_id: RequestId) {
        self.shared.cancel_request(request_id);
    }

    /// Number of in-flight requests.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.lock().entries.len()
    }

    /// Returns true while the transport is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.transport.is_connected()
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Some(mut receiver) = self.receiver.take() {
            receiver.context().cancel();
            self.shared.transport.disconnect();
            receiver.join();
        }
        if let Some(mut scavenger) = self.scavenger.take() {
            scavenger.context().cancel();
            scavenger.join();
        }
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("pending", &self.pending_requests())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A named object on the peer, reachable through a client connection.
#[derive(Clone)]
pub struct RemoteObject {
    shared: Arc<ClientShared>,
    name: String,
    options: ClientOptions,
}

impl RemoteObject {
    /// Starts a call and returns a handle to its eventual result.
    ///
    /// The request is encoded under a fresh call-scope context seeded
    /// with the configured request timeout, entered for the duration of
    /// this function so the envelope carries its deadline and data bag.
    ///
    /// # Errors
    ///
    /// Transport errors from the send, or allocation failures.
    pub fn async_call<Args, R>(
        &self,
        method: &MethodDescriptor,
        args: Args,
    ) -> Result<PendingCall<R>>
    where
        Args: Wire,
        R: Wire + Send + 'static,
    {
        let ctx = Context::child_of_current()?;
        if let Some(timeout) = self.options.request_timeout {
            ctx.set_timeout(timeout);
        }
        let _scope = ctx.enter();

        let request_id = self.shared.new_request_id();
        let data = message::encode_request(request_id, &self.name, method, &ctx, &args);
        tracing::trace!(object = %self.name, method = method.name, request_id, "calling");
        let future = self.shared.send_request(request_id, &data)?;
        let future = future.then(move |bytes| {
            let holder: ResultHolder<R> = wire::from_bytes(&bytes)?;
            holder.into_result()
        });
        Ok(PendingCall {
            future,
            request_id,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Calls a method and blocks for its result.
    ///
    /// # Errors
    ///
    /// The call's error; on `cancelled` the peer is notified before the
    /// error is re-raised.
    pub fn call<Args, R>(&self, method: &MethodDescriptor, args: Args) -> Result<R>
    where
        Args: Wire,
        R: Wire + Send + 'static,
    {
        self.async_call(method, args)?.wait()
    }

    /// The remote object's name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("name", &self.name)
            .finish()
    }
}

/// A started call whose result has not been consumed yet.
pub struct PendingCall<R> {
    future: Future<R>,
    request_id: RequestId,
    shared: Arc<ClientShared>,
}

impl<R: Wire + Send + 'static> PendingCall<R> {
    /// The request id this call travels under.
    #[must_use]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Abandons the call locally and queues a best-effort CANCEL_REQUEST.
    pub fn cancel(&self) {
        self.shared.cancel_request(self.request_id);
    }

    /// An awaitable for the decoded result.
    #[must_use]
    pub fn async_result(&mut self) -> crate::awaitable::Awaitable<'_, R> {
        self.future.async_get()
    }

    /// Takes the result if it is already available.
    ///
    /// # Errors
    ///
    /// `try_again` while the call is still in flight, otherwise the
    /// call's outcome.
    pub fn maybe_result(&mut self) -> Result<R> {
        self.future.maybe_get()
    }

    /// Blocks for the result.
    ///
    /// If the wait itself is cancelled through the caller's context, the
    /// peer is notified with a CANCEL_REQUEST before the error is
    /// re-raised.
    ///
    /// # Errors
    ///
    /// The call's outcome.
    pub fn wait(mut self) -> Result<R> {
        match self.future.get() {
            Err(e) if e.is_cancelled() => {
                self.shared.cancel_request(self.request_id);
                Err(e)
            }
            other => other,
        }
    }
}

impl<R> std::fmt::Debug for PendingCall<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("request_id", &self.request_id)
            .finish_non_exhaustive()
    }
}
