//! Storage trait definitions (ports) and the in-memory store.
//!
//! These traits define the transactional storage interface that the
//! infrastructure layer (tessera-infra) implements. The engine never depends
//! on any specific storage technology.

pub mod execution;
pub mod memory;

pub use execution::{ExecutionStore, ExecutionTx};
pub use memory::InMemoryExecutionStore;
