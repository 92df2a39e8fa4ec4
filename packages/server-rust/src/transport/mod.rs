//! Transport implementations.

pub mod memory;

pub use memory::{ConnectOptions, MemoryBroker, MemoryConnection};
