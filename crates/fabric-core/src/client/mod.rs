//! Built-in fabric client implementations

pub mod memory;

pub use memory::{MemoryFabric, MemoryFabricFactory};
