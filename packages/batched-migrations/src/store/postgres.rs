//! PostgreSQL tracking store.
//!
//! Reads surface as [`MigrationError::Database`]; every write failure is
//! reported as [`MigrationError::TrackingStoreWrite`] so deploy tooling can
//! tell "could not persist progress" apart from lookup errors.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::{
    BatchRecord, BatchStatus, CreateOutcome, MigrationIdentity, MigrationRecord, MigrationStatus,
    NewBatch, NewMigration, TrackingStore,
};
use crate::config::DuplicatePolicy;
use crate::cursor::Cursor;
use crate::error::{MigrationError, Result};

const MIGRATION_COLUMNS: &str = r#"
    id, job_class_name, table_name, column_name, job_arguments, fingerprint,
    key_columns, batch_filter, batch_class_name,
    status, min_cursor, max_cursor, cursor, total_tuple_count, failure_reason,
    batch_size, sub_batch_size, max_batch_size, interval_secs,
    created_at, updated_at, started_at, finished_at
"#;

const BATCH_COLUMNS: &str = r#"
    id, migration_id, batch_index, min_cursor, max_cursor, batch_size, sub_batch_size,
    status, attempts, job_handle, duration_ms, error_message, created_at, updated_at
"#;

/// Tracking store backed by the `batched_background_migrations` and
/// `batched_background_migration_jobs` tables.
#[derive(Clone)]
pub struct PostgresTrackingStore {
    pool: PgPool,
}

impl PostgresTrackingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("batched migration schema is up to date");
        Ok(())
    }

    async fn find_by_fingerprint(&self, fingerprint: &str) -> Result<Option<MigrationRecord>> {
        let record = sqlx::query_as::<_, MigrationRecord>(&format!(
            "SELECT {} FROM batched_background_migrations WHERE fingerprint = $1",
            MIGRATION_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

#[async_trait]
impl TrackingStore for PostgresTrackingStore {
    async fn create_or_get(
        &self,
        new: NewMigration<'_>,
        policy: DuplicatePolicy,
    ) -> Result<CreateOutcome> {
        let def = new.definition;
        let identity = def.identity();
        let fingerprint = identity.fingerprint();

        if let Some(existing) = self.find_by_fingerprint(&fingerprint).await? {
            if policy == DuplicatePolicy::Reject && existing.status.is_in_flight() {
                return Err(MigrationError::DuplicateMigration {
                    job_class_name: identity.job_class_name,
                    table_name: identity.table_name,
                    column_name: identity.column_name,
                    status: existing.status,
                });
            }
            return Ok(CreateOutcome::Existing(existing));
        }

        let inserted = sqlx::query_as::<_, MigrationRecord>(&format!(
            r#"
            INSERT INTO batched_background_migrations (
                id, job_class_name, table_name, column_name, job_arguments, fingerprint,
                key_columns, batch_filter, batch_class_name,
                status, min_cursor, max_cursor, total_tuple_count,
                batch_size, sub_batch_size, max_batch_size, interval_secs
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'queued', $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (fingerprint) DO NOTHING
            RETURNING {}
            "#,
            MIGRATION_COLUMNS
        ))
        .bind(Uuid::now_v7())
        .bind(&identity.job_class_name)
        .bind(&identity.table_name)
        .bind(&identity.column_name)
        .bind(Json(&identity.job_arguments))
        .bind(&fingerprint)
        .bind(Json(&def.table.key_columns))
        .bind(&def.table.filter)
        .bind(&def.batch_class_name)
        .bind(Json(&new.domain.min))
        .bind(Json(&new.domain.max))
        .bind(new.total_tuple_count)
        .bind(def.batch_size)
        .bind(def.sub_batch_size)
        .bind(def.max_batch_size)
        .bind(new.interval_secs()?)
        .fetch_optional(&self.pool)
        .await
        .map_err(MigrationError::store_write)?;

        match inserted {
            Some(record) => Ok(CreateOutcome::Created(record)),
            // Lost a race with a concurrent insert of the same configuration.
            None => self
                .find_by_fingerprint(&fingerprint)
                .await?
                .map(CreateOutcome::Existing)
                .ok_or_else(|| {
                    MigrationError::store_write(format!(
                        "record {} vanished after conflicting insert",
                        fingerprint
                    ))
                }),
        }
    }

    async fn find(&self, identity: &MigrationIdentity) -> Result<Option<MigrationRecord>> {
        self.find_by_fingerprint(&identity.fingerprint()).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<MigrationRecord>> {
        let record = sqlx::query_as::<_, MigrationRecord>(&format!(
            "SELECT {} FROM batched_background_migrations WHERE id = $1",
            MIGRATION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list(&self) -> Result<Vec<MigrationRecord>> {
        let records = sqlx::query_as::<_, MigrationRecord>(&format!(
            "SELECT {} FROM batched_background_migrations ORDER BY created_at, id",
            MIGRATION_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn advance(&self, id: Uuid, cursor: &Cursor) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(MigrationError::store_write)?;

        let row: Option<(MigrationStatus, Option<Json<Cursor>>)> = sqlx::query_as(
            r#"
            SELECT status, cursor
            FROM batched_background_migrations
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(MigrationError::store_write)?;

        let Some((status, current)) = row else {
            return Err(MigrationError::NotFound(id));
        };
        // jsonb ordering differs from cursor ordering; compare under the row lock.
        if status.is_terminal() || current.is_some_and(|c| cursor <= &c.0) {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE batched_background_migrations
            SET cursor = $2,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(Json(cursor))
        .execute(&mut *tx)
        .await
        .map_err(MigrationError::store_write)?;

        tx.commit().await.map_err(MigrationError::store_write)?;

        Ok(true)
    }

    async fn transition(
        &self,
        id: Uuid,
        to: MigrationStatus,
        reason: Option<&str>,
    ) -> Result<MigrationRecord> {
        let mut tx = self.pool.begin().await.map_err(MigrationError::store_write)?;

        let current: Option<MigrationStatus> = sqlx::query_scalar(
            "SELECT status FROM batched_background_migrations WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(MigrationError::store_write)?;

        let from = current.ok_or(MigrationError::NotFound(id))?;
        if from != to && !from.can_transition_to(to) {
            return Err(MigrationError::InvalidTransition { from, to });
        }

        let record = if from == to {
            sqlx::query_as::<_, MigrationRecord>(&format!(
                "SELECT {} FROM batched_background_migrations WHERE id = $1",
                MIGRATION_COLUMNS
            ))
            .bind(id)
            .fetch_one(&mut *tx)
            .await
            .map_err(MigrationError::store_write)?
        } else {
            sqlx::query_as::<_, MigrationRecord>(&format!(
                r#"
                UPDATE batched_background_migrations
                SET status = $2,
                    updated_at = NOW(),
                    started_at = CASE
                        WHEN $2 = 'active' AND started_at IS NULL THEN NOW()
                        ELSE started_at
                    END,
                    finished_at = CASE
                        WHEN $2 IN ('finished', 'failed') THEN NOW()
                        ELSE finished_at
                    END,
                    failure_reason = CASE WHEN $2 = 'failed' THEN $3 ELSE failure_reason END
                WHERE id = $1
                RETURNING {}
                "#,
                MIGRATION_COLUMNS
            ))
            .bind(id)
            .bind(to)
            .bind(reason)
            .fetch_one(&mut *tx)
            .await
            .map_err(MigrationError::store_write)?
        };

        tx.commit().await.map_err(MigrationError::store_write)?;

        Ok(record)
    }

    async fn delete(&self, identity: &MigrationIdentity) -> Result<bool> {
        // Batch rows go with it through ON DELETE CASCADE.
        let result =
            sqlx::query("DELETE FROM batched_background_migrations WHERE fingerprint = $1")
                .bind(identity.fingerprint())
                .execute(&self.pool)
                .await
                .map_err(MigrationError::store_write)?;

        Ok(result.rows_affected() > 0)
    }

    async fn record_batch(&self, batch: NewBatch) -> Result<BatchRecord> {
        let record = sqlx::query_as::<_, BatchRecord>(&format!(
            r#"
            INSERT INTO batched_background_migration_jobs (
                id, migration_id, batch_index, min_cursor, max_cursor,
                batch_size, sub_batch_size, status, attempts, job_handle
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', 0, $8)
            ON CONFLICT (migration_id, batch_index) DO UPDATE
            SET min_cursor = EXCLUDED.min_cursor,
                max_cursor = EXCLUDED.max_cursor,
                batch_size = EXCLUDED.batch_size,
                sub_batch_size = EXCLUDED.sub_batch_size,
                status = 'pending',
                attempts = 0,
                job_handle = EXCLUDED.job_handle,
                duration_ms = NULL,
                error_message = NULL,
                updated_at = NOW()
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(Uuid::now_v7())
        .bind(batch.migration_id)
        .bind(batch.batch_index)
        .bind(Json(&batch.range.min))
        .bind(Json(&batch.range.max))
        .bind(batch.batch_size)
        .bind(batch.sub_batch_size)
        .bind(batch.job_handle)
        .fetch_one(&self.pool)
        .await
        .map_err(MigrationError::store_write)?;

        Ok(record)
    }

    async fn complete_batch(
        &self,
        migration_id: Uuid,
        batch_index: i64,
        duration: Duration,
    ) -> Result<BatchRecord> {
        sqlx::query_as::<_, BatchRecord>(&format!(
            r#"
            UPDATE batched_background_migration_jobs
            SET status = 'succeeded',
                attempts = attempts + 1,
                duration_ms = $3,
                error_message = NULL,
                updated_at = NOW()
            WHERE migration_id = $1 AND batch_index = $2
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(migration_id)
        .bind(batch_index)
        .bind(duration.as_millis() as i64)
        .fetch_optional(&self.pool)
        .await
        .map_err(MigrationError::store_write)?
        .ok_or(MigrationError::BatchNotFound {
            migration_id,
            batch_index,
        })
    }

    async fn fail_batch(
        &self,
        migration_id: Uuid,
        batch_index: i64,
        error: &str,
        max_attempts: i32,
    ) -> Result<BatchRecord> {
        sqlx::query_as::<_, BatchRecord>(&format!(
            r#"
            UPDATE batched_background_migration_jobs
            SET attempts = attempts + 1,
                error_message = $3,
                status = CASE
                    WHEN attempts + 1 >= $4 THEN 'failed'::batched_migration_job_status
                    ELSE 'pending'::batched_migration_job_status
                END,
                updated_at = NOW()
            WHERE migration_id = $1 AND batch_index = $2
            RETURNING {}
            "#,
            BATCH_COLUMNS
        ))
        .bind(migration_id)
        .bind(batch_index)
        .bind(error)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(MigrationError::store_write)?
        .ok_or(MigrationError::BatchNotFound {
            migration_id,
            batch_index,
        })
    }

    async fn batches(
        &self,
        migration_id: Uuid,
        status: Option<BatchStatus>,
    ) -> Result<Vec<BatchRecord>> {
        let records = sqlx::query_as::<_, BatchRecord>(&format!(
            r#"
            SELECT {}
            FROM batched_background_migration_jobs
            WHERE migration_id = $1
              AND ($2::batched_migration_job_status IS NULL OR status = $2)
            ORDER BY batch_index
            "#,
            BATCH_COLUMNS
        ))
        .bind(migration_id)
        .bind(status)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn delete_batches(&self, migration_id: Uuid, statuses: &[BatchStatus]) -> Result<u64> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();

        let result = sqlx::query(
            r#"
            DELETE FROM batched_background_migration_jobs
            WHERE migration_id = $1
              AND (cardinality($2::text[]) = 0 OR status::text = ANY($2))
            "#,
        )
        .bind(migration_id)
        .bind(&statuses)
        .execute(&self.pool)
        .await
        .map_err(MigrationError::store_write)?;

        Ok(result.rows_affected())
    }
}
