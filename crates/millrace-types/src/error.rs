use thiserror::Error;

/// Errors from repository operations (used by trait definitions in
/// millrace-core). Component-level errors (graph, engine, correlation,
/// expression) live beside their components in millrace-core.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    /// Unique-constraint violation. Callers persisting content-hashed rows
    /// must treat this as "someone else already inserted it, read it back".
    #[error("conflict: {0}")]
    Conflict(String),
}

impl RepositoryError {
    /// Whether this error is a unique-constraint conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}
