//! Select-friendly synchronization primitives: flags, bounded queues, and
//! single-shot futures. All expose fd-style readiness so they compose with
//! [`select`](crate::select::select).

pub mod flag;
pub mod future;
pub mod queue;

pub use flag::Flag;
pub use future::{pair, Future, Promise};
pub use queue::Queue;
