//! Observability for Tessera: tracing subscriber setup and shutdown.

pub mod tracing_setup;

pub use tracing_setup::{TracingOptions, init_tracing, shutdown_tracing};
