//! Test support for the rill workspace: an in-memory store backend that
//! honors the full persistence protocol, plus canonical graph fixtures.

pub mod fixtures;
pub mod memory;

pub use fixtures::*;
pub use memory::MemoryStore;
