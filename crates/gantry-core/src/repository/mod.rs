//! Repository trait definitions ("ports") and the in-memory reference store.
//!
//! The engine assumes these operations are durable and crash-consistent but
//! is agnostic to the storage format. `gantry-infra` provides the SQLite
//! implementation; [`memory::MemoryStore`] backs tests and embedded use.

pub mod job;
pub mod memory;
pub mod workflow;
