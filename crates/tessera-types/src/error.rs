use thiserror::Error;

/// Errors from repository operations (used by trait definitions in tessera-core).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    /// The store could not take a lock in time (SQLITE_BUSY, lock contention).
    #[error("storage busy: {0}")]
    Busy(String),

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Whether retrying the whole operation may succeed.
    ///
    /// Lost connections and lock contention are transient. Everything else
    /// would fail the same way on every attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection | Self::Busy(_))
    }
}
