//! The RPC engine: envelopes, typed interface glue, the client
//! connection, and the server dispatcher.

pub mod client;
pub mod interface;
pub mod message;
pub mod server;

pub use client::{ClientConnection, PendingCall, RemoteObject};
pub use interface::MethodDescriptor;
pub use message::{MessageType, RequestId};
pub use server::Server;
