//! Migration tracking store
//!
//! Durable bookkeeping of a migration's identity, configuration and
//! progress. One record exists per configuration tuple
//! `(job_class_name, table_name, column_name, job_arguments)`; the tuple is
//! hashed into a fingerprint so the Postgres backend can enforce uniqueness
//! with a plain unique index.
//!
//! Every write is atomic per call: a failed `advance` leaves the previous
//! cursor in place.

mod memory;
mod postgres;
mod record;

pub use memory::InMemoryTrackingStore;
pub use postgres::PostgresTrackingStore;
pub use record::{BatchRecord, BatchStatus, MigrationRecord, MigrationStatus, NewBatch};

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::config::DuplicatePolicy;
use crate::cursor::{Cursor, CursorRange};
use crate::error::{MigrationError, Result};
use crate::table::TableHandle;

pub const DEFAULT_BATCH_CLASS_NAME: &str = "PrimaryKeyBatchingStrategy";

// ============================================================================
// Identity
// ============================================================================

/// The tuple that uniquely identifies one migration configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MigrationIdentity {
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Vec<Value>,
}

impl MigrationIdentity {
    pub fn new(
        job_class_name: impl Into<String>,
        table_name: impl Into<String>,
        column_name: impl Into<String>,
        job_arguments: Vec<Value>,
    ) -> Self {
        Self {
            job_class_name: job_class_name.into(),
            table_name: table_name.into(),
            column_name: column_name.into(),
            job_arguments,
        }
    }

    /// Hex SHA-256 of the canonical JSON form of the tuple.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::json!([
            self.job_class_name,
            self.table_name,
            self.column_name,
            self.job_arguments,
        ]);
        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }
}

// ============================================================================
// Definition
// ============================================================================

/// Everything a caller supplies when queueing a migration.
#[derive(Debug, Clone, TypedBuilder)]
pub struct MigrationDefinition {
    #[builder(setter(into))]
    pub job_class_name: String,
    pub table: TableHandle,
    pub job_interval: Duration,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    /// Extra arguments passed through to the executor after the range.
    #[builder(default)]
    pub job_arguments: Vec<Value>,
    #[builder(default, setter(strip_option))]
    pub batch_min_value: Option<Cursor>,
    #[builder(default, setter(strip_option))]
    pub batch_max_value: Option<Cursor>,
    #[builder(default, setter(strip_option))]
    pub max_batch_size: Option<i64>,
    #[builder(default = DEFAULT_BATCH_CLASS_NAME.to_string(), setter(into))]
    pub batch_class_name: String,
}

impl MigrationDefinition {
    pub fn identity(&self) -> MigrationIdentity {
        MigrationIdentity {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table.table_name.clone(),
            column_name: self.table.column_name(),
            job_arguments: self.job_arguments.clone(),
        }
    }

    /// Check the configuration and return the effective job interval.
    ///
    /// Intervals shorter than `min_interval` are raised to it.
    pub fn validate(&self, min_interval: Duration) -> Result<Duration> {
        if self.job_class_name.trim().is_empty() {
            return Err(MigrationError::config("job class name is missing"));
        }
        if self.batch_class_name.trim().is_empty() {
            return Err(MigrationError::config("batch class name is missing"));
        }
        self.table.validate()?;

        if self.batch_size <= 0 {
            return Err(MigrationError::config(format!(
                "batch_size must be positive, got {}",
                self.batch_size
            )));
        }
        if self.sub_batch_size <= 0 {
            return Err(MigrationError::config(format!(
                "sub_batch_size must be positive, got {}",
                self.sub_batch_size
            )));
        }
        if self.sub_batch_size > self.batch_size {
            return Err(MigrationError::config(format!(
                "sub_batch_size {} exceeds batch_size {}",
                self.sub_batch_size, self.batch_size
            )));
        }
        if let Some(max) = self.max_batch_size {
            if max < self.batch_size {
                return Err(MigrationError::config(format!(
                    "max_batch_size {} is below batch_size {}",
                    max, self.batch_size
                )));
            }
        }
        for bound in self.batch_min_value.iter().chain(self.batch_max_value.iter()) {
            self.table.validate_cursor(bound)?;
        }

        if self.job_interval.is_zero() {
            return Err(MigrationError::config("job_interval must be positive"));
        }
        if i64::try_from(self.job_interval.as_secs()).is_err() {
            return Err(MigrationError::config(format!(
                "job_interval of {}s is too large",
                self.job_interval.as_secs()
            )));
        }
        if self.job_interval < min_interval {
            warn!(
                job_class_name = %self.job_class_name,
                requested_secs = self.job_interval.as_secs(),
                min_secs = min_interval.as_secs(),
                "job interval below minimum, using minimum"
            );
            return Ok(min_interval);
        }

        Ok(self.job_interval)
    }
}

/// Result of `create_or_get`.
#[derive(Debug, Clone)]
pub enum CreateOutcome {
    /// A new record was persisted.
    Created(MigrationRecord),
    /// A record for the same configuration already existed.
    Existing(MigrationRecord),
}

impl CreateOutcome {
    pub fn record(&self) -> &MigrationRecord {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn into_record(self) -> MigrationRecord {
        match self {
            CreateOutcome::Created(r) | CreateOutcome::Existing(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, CreateOutcome::Created(_))
    }
}

/// Fields of a record about to be created.
#[derive(Debug, Clone)]
pub struct NewMigration<'a> {
    pub definition: &'a MigrationDefinition,
    pub interval: Duration,
    pub domain: CursorRange,
    pub total_tuple_count: Option<i64>,
}

impl NewMigration<'_> {
    /// The interval as stored in `interval_secs`.
    pub fn interval_secs(&self) -> Result<i64> {
        i64::try_from(self.interval.as_secs()).map_err(|_| {
            MigrationError::config(format!(
                "job_interval of {}s is too large",
                self.interval.as_secs()
            ))
        })
    }
}

// ============================================================================
// Trait
// ============================================================================

/// Durable migration and batch bookkeeping.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    /// Persist a new `queued` record, or return the one that exists for the
    /// same configuration.
    ///
    /// With [`DuplicatePolicy::Reject`] an existing in-flight record is a
    /// [`MigrationError::DuplicateMigration`].
    async fn create_or_get(
        &self,
        new: NewMigration<'_>,
        policy: DuplicatePolicy,
    ) -> Result<CreateOutcome>;

    async fn find(&self, identity: &MigrationIdentity) -> Result<Option<MigrationRecord>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<MigrationRecord>>;

    async fn list(&self) -> Result<Vec<MigrationRecord>>;

    /// Move the cursor forward.
    ///
    /// Returns `false` without writing when `cursor` is not strictly beyond
    /// the stored one or the record is terminal.
    async fn advance(&self, id: Uuid, cursor: &Cursor) -> Result<bool>;

    /// Change status, rejecting moves outside the lifecycle.
    ///
    /// Moving to the current status returns the record unchanged.
    async fn transition(
        &self,
        id: Uuid,
        to: MigrationStatus,
        reason: Option<&str>,
    ) -> Result<MigrationRecord>;

    /// Remove a record and its batches. Absent records are a no-op.
    async fn delete(&self, identity: &MigrationIdentity) -> Result<bool>;

    /// Insert or replace the batch at `(migration_id, batch_index)`.
    async fn record_batch(&self, batch: NewBatch) -> Result<BatchRecord>;

    async fn complete_batch(
        &self,
        migration_id: Uuid,
        batch_index: i64,
        duration: Duration,
    ) -> Result<BatchRecord>;

    /// Count a failed attempt. The batch becomes `failed` once `attempts`
    /// reaches `max_attempts`, otherwise it stays `pending`.
    async fn fail_batch(
        &self,
        migration_id: Uuid,
        batch_index: i64,
        error: &str,
        max_attempts: i32,
    ) -> Result<BatchRecord>;

    /// Batches in index order, optionally restricted to one status.
    async fn batches(
        &self,
        migration_id: Uuid,
        status: Option<BatchStatus>,
    ) -> Result<Vec<BatchRecord>>;

    /// Remove batches in any of `statuses`; an empty slice removes all.
    async fn delete_batches(&self, migration_id: Uuid, statuses: &[BatchStatus]) -> Result<u64>;

    async fn mark_active(&self, id: Uuid) -> Result<MigrationRecord> {
        self.transition(id, MigrationStatus::Active, None).await
    }

    async fn pause(&self, id: Uuid) -> Result<MigrationRecord> {
        self.transition(id, MigrationStatus::Paused, None).await
    }

    async fn resume(&self, id: Uuid) -> Result<MigrationRecord> {
        self.transition(id, MigrationStatus::Active, None).await
    }

    async fn mark_finished(&self, id: Uuid) -> Result<MigrationRecord> {
        self.transition(id, MigrationStatus::Finished, None).await
    }

    async fn mark_failed(&self, id: Uuid, reason: &str) -> Result<MigrationRecord> {
        self.transition(id, MigrationStatus::Failed, Some(reason)).await
    }
}
