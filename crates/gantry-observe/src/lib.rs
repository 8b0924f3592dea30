//! Observability setup for Gantry.
//!
//! One entry point: [`tracing_setup::init_tracing`]. Engine crates emit
//! `tracing` events with structured fields; embedding binaries call this
//! once at startup to install the subscriber.

pub mod tracing_setup;
