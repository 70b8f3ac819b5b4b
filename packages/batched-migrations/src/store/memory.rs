//! In-memory tracking store for tests and dry runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::types::Json;
use uuid::Uuid;

use super::{
    BatchRecord, BatchStatus, CreateOutcome, MigrationIdentity, MigrationRecord, MigrationStatus,
    NewBatch, NewMigration, TrackingStore,
};
use crate::config::DuplicatePolicy;
use crate::cursor::Cursor;
use crate::error::{MigrationError, Result};

#[derive(Default)]
struct State {
    migrations: HashMap<Uuid, MigrationRecord>,
    batches: BTreeMap<(Uuid, i64), BatchRecord>,
}

impl State {
    fn by_fingerprint(&self, fingerprint: &str) -> Option<&MigrationRecord> {
        self.migrations
            .values()
            .find(|r| r.fingerprint == fingerprint)
    }

    fn batch_mut(&mut self, migration_id: Uuid, batch_index: i64) -> Result<&mut BatchRecord> {
        self.batches
            .get_mut(&(migration_id, batch_index))
            .ok_or(MigrationError::BatchNotFound {
                migration_id,
                batch_index,
            })
    }
}

/// Tracking store held in process memory.
///
/// Writes can be made to fail to exercise error propagation.
#[derive(Default)]
pub struct InMemoryTrackingStore {
    state: RwLock<State>,
    fail_writes: RwLock<bool>,
    fail_next_advance: RwLock<bool>,
}

impl InMemoryTrackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        *self.fail_writes.write().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// Make only the next `advance` fail.
    pub fn fail_next_advance(&self) {
        *self
            .fail_next_advance
            .write()
            .unwrap_or_else(|e| e.into_inner()) = true;
    }

    pub fn migrations(&self) -> Vec<MigrationRecord> {
        let mut records: Vec<_> = self
            .state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .migrations
            .values()
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    fn check_write(&self) -> Result<()> {
        if *self.fail_writes.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(MigrationError::store_write("simulated tracking store failure"));
        }
        Ok(())
    }

    fn check_advance(&self) -> Result<()> {
        self.check_write()?;
        let mut fail = self
            .fail_next_advance
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if *fail {
            *fail = false;
            return Err(MigrationError::store_write("simulated advance failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl TrackingStore for InMemoryTrackingStore {
    async fn create_or_get(
        &self,
        new: NewMigration<'_>,
        policy: DuplicatePolicy,
    ) -> Result<CreateOutcome> {
        self.check_write()?;

        let def = new.definition;
        let identity = def.identity();
        let fingerprint = identity.fingerprint();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        if let Some(existing) = state.by_fingerprint(&fingerprint) {
            if policy == DuplicatePolicy::Reject && existing.status.is_in_flight() {
                return Err(MigrationError::DuplicateMigration {
                    job_class_name: identity.job_class_name,
                    table_name: identity.table_name,
                    column_name: identity.column_name,
                    status: existing.status,
                });
            }
            return Ok(CreateOutcome::Existing(existing.clone()));
        }

        let now = Utc::now();
        let record = MigrationRecord {
            id: Uuid::now_v7(),
            job_class_name: identity.job_class_name,
            table_name: identity.table_name,
            column_name: identity.column_name,
            job_arguments: Json(identity.job_arguments),
            fingerprint,
            key_columns: Json(def.table.key_columns.clone()),
            batch_filter: def.table.filter.clone(),
            batch_class_name: def.batch_class_name.clone(),
            status: MigrationStatus::Queued,
            min_cursor: Json(new.domain.min.clone()),
            max_cursor: Json(new.domain.max.clone()),
            cursor: None,
            total_tuple_count: new.total_tuple_count,
            failure_reason: None,
            batch_size: def.batch_size,
            sub_batch_size: def.sub_batch_size,
            max_batch_size: def.max_batch_size,
            interval_secs: new.interval_secs()?,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        };
        state.migrations.insert(record.id, record.clone());

        Ok(CreateOutcome::Created(record))
    }

    async fn find(&self, identity: &MigrationIdentity) -> Result<Option<MigrationRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.by_fingerprint(&identity.fingerprint()).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<MigrationRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state.migrations.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<MigrationRecord>> {
        Ok(self.migrations())
    }

    async fn advance(&self, id: Uuid, cursor: &Cursor) -> Result<bool> {
        self.check_advance()?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let record = state
            .migrations
            .get_mut(&id)
            .ok_or(MigrationError::NotFound(id))?;

        if record.status.is_terminal() {
            return Ok(false);
        }
        if record.cursor().is_some_and(|current| cursor <= current) {
            return Ok(false);
        }

        record.cursor = Some(Json(cursor.clone()));
        record.updated_at = Utc::now();
        Ok(true)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: MigrationStatus,
        reason: Option<&str>,
    ) -> Result<MigrationRecord> {
        self.check_write()?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let record = state
            .migrations
            .get_mut(&id)
            .ok_or(MigrationError::NotFound(id))?;

        if record.status == to {
            return Ok(record.clone());
        }
        if !record.status.can_transition_to(to) {
            return Err(MigrationError::InvalidTransition {
                from: record.status,
                to,
            });
        }

        let now = Utc::now();
        record.status = to;
        record.updated_at = now;
        match to {
            MigrationStatus::Active if record.started_at.is_none() => {
                record.started_at = Some(now);
            }
            MigrationStatus::Finished => record.finished_at = Some(now),
            MigrationStatus::Failed => {
                record.finished_at = Some(now);
                record.failure_reason = reason.map(str::to_string);
            }
            _ => {}
        }

        Ok(record.clone())
    }

    async fn delete(&self, identity: &MigrationIdentity) -> Result<bool> {
        self.check_write()?;

        let fingerprint = identity.fingerprint();
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let Some(id) = state.by_fingerprint(&fingerprint).map(|r| r.id) else {
            return Ok(false);
        };

        state.migrations.remove(&id);
        state.batches.retain(|(migration_id, _), _| *migration_id != id);
        Ok(true)
    }

    async fn record_batch(&self, batch: NewBatch) -> Result<BatchRecord> {
        self.check_write()?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.migrations.contains_key(&batch.migration_id) {
            return Err(MigrationError::NotFound(batch.migration_id));
        }

        let now = Utc::now();
        let key = (batch.migration_id, batch.batch_index);
        let record = BatchRecord {
            id: state
                .batches
                .get(&key)
                .map(|b| b.id)
                .unwrap_or_else(Uuid::now_v7),
            migration_id: batch.migration_id,
            batch_index: batch.batch_index,
            min_cursor: Json(batch.range.min),
            max_cursor: Json(batch.range.max),
            batch_size: batch.batch_size,
            sub_batch_size: batch.sub_batch_size,
            status: BatchStatus::Pending,
            attempts: 0,
            job_handle: batch.job_handle,
            duration_ms: None,
            error_message: None,
            created_at: state.batches.get(&key).map(|b| b.created_at).unwrap_or(now),
            updated_at: now,
        };
        state.batches.insert(key, record.clone());

        Ok(record)
    }

    async fn complete_batch(
        &self,
        migration_id: Uuid,
        batch_index: i64,
        duration: Duration,
    ) -> Result<BatchRecord> {
        self.check_write()?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let batch = state.batch_mut(migration_id, batch_index)?;
        batch.status = BatchStatus::Succeeded;
        batch.attempts += 1;
        batch.duration_ms = Some(duration.as_millis() as i64);
        batch.error_message = None;
        batch.updated_at = Utc::now();

        Ok(batch.clone())
    }

    async fn fail_batch(
        &self,
        migration_id: Uuid,
        batch_index: i64,
        error: &str,
        max_attempts: i32,
    ) -> Result<BatchRecord> {
        self.check_write()?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let batch = state.batch_mut(migration_id, batch_index)?;
        batch.attempts += 1;
        batch.error_message = Some(error.to_string());
        batch.status = if batch.attempts >= max_attempts {
            BatchStatus::Failed
        } else {
            BatchStatus::Pending
        };
        batch.updated_at = Utc::now();

        Ok(batch.clone())
    }

    async fn batches(
        &self,
        migration_id: Uuid,
        status: Option<BatchStatus>,
    ) -> Result<Vec<BatchRecord>> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .batches
            .range((migration_id, i64::MIN)..=(migration_id, i64::MAX))
            .map(|(_, b)| b)
            .filter(|b| status.map_or(true, |s| b.status == s))
            .cloned()
            .collect())
    }

    async fn delete_batches(&self, migration_id: Uuid, statuses: &[BatchStatus]) -> Result<u64> {
        self.check_write()?;

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let before = state.batches.len();
        state.batches.retain(|(id, _), b| {
            *id != migration_id || !(statuses.is_empty() || statuses.contains(&b.status))
        });

        Ok((before - state.batches.len()) as u64)
    }
}
