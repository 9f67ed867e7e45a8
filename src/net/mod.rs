//! Networking primitives: endpoints, addresses, resolver, and the
//! non-blocking socket channel.

pub mod addr;
pub mod channel;
pub mod resolve;

pub use addr::{Address, AddressFamily, AddressList, Endpoint, SocketKind};
pub use channel::Channel;
pub use resolve::Resolver;
