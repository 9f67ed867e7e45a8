//! Wirecall: a thread-based asynchronous RPC runtime over stream sockets.
//!
//! # Overview
//!
//! Wirecall multiplexes I/O readiness, timers, and cancellation onto plain
//! OS threads: a thread waits in [`select`](select::select) on a
//! heterogeneous set of [`Awaitable`](awaitable::Awaitable)s and runs their
//! reactions when they fire. There is no task scheduler; suspension only
//! happens at `select`, blocking channel I/O, blocking queue/future gets,
//! and worker joins.
//!
//! On top of that core, a [context tree](context::Context) propagates
//! deadlines, cancellation, and per-call metadata across local and remote
//! call boundaries, and a [client connection](rpc::ClientConnection) turns
//! typed method invocations into framed request/response packets over a
//! lazily reconnecting stream.
//!
//! # Core guarantees
//!
//! - **Cancellation reaches every wait**: cancelling a context fails every
//!   `select` running under it (and its descendants) with `cancelled`
//! - **Deadlines only tighten**: a child context never outlives its
//!   parent's deadline
//! - **Failure fan-out**: one transport failure rejects every in-flight
//!   call on that connection with the same error, exactly once
//! - **Reconnection is lazy**: the next use after a failure dials again;
//!   nothing retries automatically on a caller's behalf
//!
//! # Module structure
//!
//! - [`awaitable`]: wait triggers paired with reaction functions
//! - [`select`]: the readiness engine driving awaitables
//! - [`context`]: deadline/cancellation/metadata tree
//! - [`sync`]: flags, bounded queues, future/promise pairs
//! - [`net`]: endpoints, resolver, socket channels
//! - [`transport`]: packet framing and reconnecting connections
//! - [`rpc`]: envelopes, client engine, server dispatcher, proxy glue
//! - [`wire`]: the binary value codec
//! - [`config`]: client/server options
//! - [`worker`]: context-carrying worker threads
//! - [`error`]: the crate-wide error taxonomy
//! - [`util`]: small support containers

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

#[cfg(not(unix))]
compile_error!("wirecall requires a Unix platform: it waits on raw file descriptors");

pub mod awaitable;
pub mod config;
pub mod context;
pub mod error;
pub mod net;
pub mod rpc;
pub mod select;
pub mod sync;
pub mod transport;
pub mod util;
pub mod wire;
pub mod worker;

pub use awaitable::{always, deadline_at, never, polling, timeout, Awaitable, Trigger};
pub use config::{ClientOptions, ServerOptions};
pub use context::{Context, ScopeGuard};
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use net::{Address, AddressFamily, AddressList, Channel, Endpoint, Resolver, SocketKind};
pub use rpc::{ClientConnection, MethodDescriptor, PendingCall, RemoteObject, RequestId, Server};
pub use select::{select, SelectSet};
pub use sync::{pair, Flag, Future, Promise, Queue};
pub use transport::{PacketConnection, ReconnectingConnection, StreamConnection};
pub use util::FlatMap;
pub use wire::{register_context_type, ErrorEnvelope, Portable, ResultHolder, Wire, WireReader};
pub use worker::Worker;
