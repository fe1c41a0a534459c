//! Concrete transport implementations.

pub mod memory;

pub use memory::InMemoryBackend;
