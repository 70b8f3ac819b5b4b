//! Tracking records for migrations and their dispatched batches.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::MigrationIdentity;
use crate::cursor::{Cursor, CursorRange};
use crate::table::{KeyColumn, TableHandle};

// ============================================================================
// Enums
// ============================================================================

/// Lifecycle of one migration.
///
/// ```text
/// queued ─► active ─┬─► finished
///             ▲     ├─► failed
///             │     └─► paused ─┐
///             └─────────────────┘
/// ```
///
/// `finished` and `failed` are terminal. `queued` and `paused` may also move
/// to `failed` when the store reports a fatal error before dispatch resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "batched_migration_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Queued,
    Active,
    Paused,
    Finished,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }

    /// Queued, active or paused: the configuration is still in flight.
    pub fn is_in_flight(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, to: MigrationStatus) -> bool {
        use MigrationStatus::*;

        matches!(
            (self, to),
            (Queued, Active)
                | (Queued, Failed)
                | (Active, Finished)
                | (Active, Failed)
                | (Active, Paused)
                | (Paused, Active)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of one dispatched batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "batched_migration_job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Succeeded,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Migration Record
// ============================================================================

/// Persistent progress of one migration configuration.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MigrationRecord {
    pub id: Uuid,

    // Identity
    pub job_class_name: String,
    pub table_name: String,
    pub column_name: String,
    pub job_arguments: Json<Vec<Value>>,
    pub fingerprint: String,

    // How the table is walked
    pub key_columns: Json<Vec<KeyColumn>>,
    pub batch_filter: Option<String>,
    pub batch_class_name: String,

    // Progress
    pub status: MigrationStatus,
    pub min_cursor: Json<Cursor>,
    pub max_cursor: Json<Cursor>,
    /// Max of the last dispatched batch. `None` before the first dispatch.
    pub cursor: Option<Json<Cursor>>,
    pub total_tuple_count: Option<i64>,
    pub failure_reason: Option<String>,

    // Configuration
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub max_batch_size: Option<i64>,
    pub interval_secs: i64,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl MigrationRecord {
    pub fn identity(&self) -> MigrationIdentity {
        MigrationIdentity {
            job_class_name: self.job_class_name.clone(),
            table_name: self.table_name.clone(),
            column_name: self.column_name.clone(),
            job_arguments: self.job_arguments.0.clone(),
        }
    }

    pub fn table(&self) -> TableHandle {
        TableHandle {
            table_name: self.table_name.clone(),
            key_columns: self.key_columns.0.clone(),
            filter: self.batch_filter.clone(),
        }
    }

    /// The domain recorded when the migration was queued.
    pub fn domain(&self) -> CursorRange {
        CursorRange {
            min: self.min_cursor.0.clone(),
            max: self.max_cursor.0.clone(),
        }
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref().map(|c| &c.0)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(0) as u64)
    }

    /// Every range up to the recorded max has been handed out.
    pub fn is_fully_dispatched(&self) -> bool {
        self.cursor().is_some_and(|c| c >= &self.max_cursor.0)
    }
}

// ============================================================================
// Batch Record
// ============================================================================

/// One dispatched batch and what became of it.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BatchRecord {
    pub id: Uuid,
    pub migration_id: Uuid,
    pub batch_index: i64,
    pub min_cursor: Json<Cursor>,
    pub max_cursor: Json<Cursor>,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub status: BatchStatus,
    pub attempts: i32,
    pub job_handle: Option<Uuid>,
    pub duration_ms: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BatchRecord {
    pub fn range(&self) -> CursorRange {
        CursorRange {
            min: self.min_cursor.0.clone(),
            max: self.max_cursor.0.clone(),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms
            .map(|ms| Duration::from_millis(ms.max(0) as u64))
    }
}

/// A batch about to be recorded.
#[derive(Debug, Clone)]
pub struct NewBatch {
    pub migration_id: Uuid,
    pub batch_index: i64,
    pub range: CursorRange,
    pub batch_size: i64,
    pub sub_batch_size: i64,
    pub job_handle: Option<Uuid>,
}
