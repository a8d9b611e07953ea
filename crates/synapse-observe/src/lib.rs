//! Observability setup for Synapse processes.

pub mod tracing_setup;
