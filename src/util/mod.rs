//! Internal utilities.

pub mod flat_map;

pub use flat_map::FlatMap;
