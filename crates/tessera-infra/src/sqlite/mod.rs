//! SQLite storage layer.
//!
//! The execution store backed by SQLite with WAL mode and split read/write
//! connection pools.

pub mod execution;
pub mod pool;

pub use execution::{SqliteExecutionStore, SqliteTx};
pub use pool::{DatabasePool, default_database_url};
