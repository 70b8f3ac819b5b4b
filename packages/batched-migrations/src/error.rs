//! Structured error types for batched background migrations.
//!
//! `MigrationError` gives deployment tooling pattern-matchable failures
//! instead of a generic `anyhow::Error`. Executor code is user-supplied and
//! keeps returning `anyhow::Result`; those errors are wrapped in
//! [`MigrationError::Executor`] together with the job class that failed.
//!
//! An empty table (or `min > max` after applying caller bounds) is never an
//! error: partitioning yields no ranges and scheduling reports
//! "nothing to migrate".

use thiserror::Error;
use uuid::Uuid;

use crate::store::MigrationStatus;

/// Result alias used throughout the crate.
pub type Result<T, E = MigrationError> = std::result::Result<T, E>;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum MigrationError {
    /// Invalid batch size, missing table/column, malformed cursor bounds.
    ///
    /// Raised synchronously at schedule time.
    #[error("invalid migration configuration: {0}")]
    Configuration(String),

    /// An identical configuration is already queued or active and the
    /// duplicate policy is `reject`.
    #[error(
        "batched background migration {job_class_name} on {table_name}.{column_name} is already {status}"
    )]
    DuplicateMigration {
        job_class_name: String,
        table_name: String,
        column_name: String,
        status: MigrationStatus,
    },

    /// No tracking record with this id.
    #[error("batched background migration {0} not found")]
    NotFound(Uuid),

    /// No batch with this index was recorded for the migration.
    #[error("batch {batch_index} of batched background migration {migration_id} not found")]
    BatchNotFound { migration_id: Uuid, batch_index: i64 },

    /// A status change outside the lifecycle
    /// `queued -> active -> {finished, failed, paused}`, `paused -> active`.
    #[error("cannot transition batched background migration from {from} to {to}")]
    InvalidTransition {
        from: MigrationStatus,
        to: MigrationStatus,
    },

    /// The tracking store rejected a write. Cursor state is unchanged.
    #[error("tracking store write failed: {source}")]
    TrackingStoreWrite {
        #[source]
        source: BoxError,
    },

    /// The job queue refused an enqueue.
    #[error("job queue rejected enqueue: {source}")]
    Queue {
        #[source]
        source: BoxError,
    },

    /// No executor is registered for the job class.
    #[error("no executor registered for job class {0}")]
    UnknownJobClass(String),

    /// An executor failed while running a batch inline.
    #[error("executor {job_class_name} failed on batch {batch_index}: {source}")]
    Executor {
        job_class_name: String,
        batch_index: i64,
        #[source]
        source: anyhow::Error,
    },

    /// The migration is in the terminal `failed` state.
    #[error("batched background migration {job_class_name} failed: {reason}")]
    MigrationFailed {
        job_class_name: String,
        reason: String,
    },

    /// A migration that was required to be finished is not.
    #[error("batched background migration {job_class_name} is {status}, expected finished")]
    NotFinished {
        job_class_name: String,
        status: MigrationStatus,
    },

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl MigrationError {
    /// Shorthand for [`MigrationError::Configuration`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn store_write(source: impl Into<BoxError>) -> Self {
        Self::TrackingStoreWrite {
            source: source.into(),
        }
    }

    pub fn queue(source: impl Into<BoxError>) -> Self {
        Self::Queue {
            source: source.into(),
        }
    }

    /// Whether the deploy step should halt on this error.
    ///
    /// Everything except a rejected duplicate is fatal to the deployment.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::DuplicateMigration { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_message_is_readable() {
        let err = MigrationError::config("batch_size must be positive, got 0");
        assert_eq!(
            err.to_string(),
            "invalid migration configuration: batch_size must be positive, got 0"
        );
    }

    #[test]
    fn duplicate_is_the_only_non_fatal_error() {
        let duplicate = MigrationError::DuplicateMigration {
            job_class_name: "BackfillNamespaceState".into(),
            table_name: "namespaces".into(),
            column_name: "id".into(),
            status: MigrationStatus::Active,
        };
        assert!(!duplicate.is_fatal());
        assert!(MigrationError::store_write("disk full").is_fatal());
        assert!(MigrationError::NotFound(Uuid::nil()).is_fatal());
    }

    #[test]
    fn store_write_keeps_its_source() {
        let err = MigrationError::store_write("connection reset");
        assert_eq!(err.to_string(), "tracking store write failed: connection reset");
        assert!(std::error::Error::source(&err).is_some());
    }
}
