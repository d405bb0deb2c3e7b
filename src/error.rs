//! Error types for the sync engine.
//!
//! Configuration and store-integrity errors abort a sync run. Downstream
//! write failures are captured per record into [`RecordOutcome`] lists and
//! never abort a batch.
//!
//! [`RecordOutcome`]: crate::module::RecordOutcome

use thiserror::Error;

/// Result type alias for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A sync type configuration is incomplete, or a module name is missing
    /// from the field maps. Fatal, surfaces at registration.
    #[error("invalid sync configuration: {0}")]
    Configuration(String),

    /// More than one persisted row, or more than one in-memory record,
    /// claims the same identity. Never resolved heuristically.
    #[error("multiple {name} sync matches for identifier {identifier}")]
    MultipleMatches { name: String, identifier: String },

    /// A sync row has no data identifier for the requested entity.
    #[error("no data identifier recorded for entity {entity}")]
    EntityNotFound { entity: String },

    /// Sync store query or write failure.
    #[error("sync store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("sync store migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// A persisted native identifier failed to decode.
    #[error("corrupt native identifier: {0}")]
    Identifier(#[from] serde_json::Error),

    /// Downstream create/update failure in a module. Attributable to one
    /// record; callers report it in the aggregate outcome list.
    #[error("{module} sync write failed: {message}")]
    Module { module: String, message: String },

    /// Unexpected internal error (a bug, not an operational condition).
    #[error("internal sync error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn module(module: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Module {
            module: module.into(),
            message: message.into(),
        }
    }
}
