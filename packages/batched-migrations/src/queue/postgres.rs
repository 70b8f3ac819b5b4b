//! PostgreSQL delayed-job queue.
//!
//! Jobs land in `background_jobs` with `run_at = now + delay`. Workers poll
//! that table; this crate only writes to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::debug;
use uuid::Uuid;

use super::{JobHandle, JobQueue, ScheduledJob};
use crate::error::{MigrationError, Result};

/// A row of `background_jobs`.
#[derive(Debug, Clone, FromRow)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub job_class_name: String,
    pub args: Json<Vec<Value>>,
    pub migration_id: Option<Uuid>,
    pub batch_index: Option<i64>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PostgresJobQueue {
    pool: PgPool,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Jobs enqueued for one migration, in batch order.
    pub async fn jobs_for_migration(&self, migration_id: Uuid) -> Result<Vec<BackgroundJob>> {
        let jobs = sqlx::query_as::<_, BackgroundJob>(
            r#"
            SELECT id, job_class_name, args, migration_id, batch_index, run_at, created_at
            FROM background_jobs
            WHERE migration_id = $1
            ORDER BY batch_index, created_at
            "#,
        )
        .bind(migration_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }
}

fn run_at(job: &ScheduledJob, now: DateTime<Utc>) -> DateTime<Utc> {
    now + chrono::Duration::milliseconds(job.delay.as_millis() as i64)
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job: &ScheduledJob) -> Result<JobHandle> {
        let id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO background_jobs (id, job_class_name, args, migration_id, batch_index, run_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(id)
        .bind(&job.job_class_name)
        .bind(Json(job.args()))
        .bind(job.migration_id)
        .bind(job.batch_index)
        .bind(run_at(job, Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(MigrationError::queue)?;

        Ok(JobHandle(id))
    }

    async fn enqueue_bulk(&self, jobs: &[ScheduledJob]) -> Result<Vec<JobHandle>> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let ids: Vec<Uuid> = jobs.iter().map(|_| Uuid::now_v7()).collect();

        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO background_jobs (id, job_class_name, args, migration_id, batch_index, run_at) ",
        );
        qb.push_values(jobs.iter().zip(&ids), |mut row, (job, id)| {
            row.push_bind(*id)
                .push_bind(job.job_class_name.clone())
                .push_bind(Json(job.args()))
                .push_bind(job.migration_id)
                .push_bind(job.batch_index)
                .push_bind(run_at(job, now));
        });

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(MigrationError::queue)?;

        debug!(count = jobs.len(), "bulk enqueued background jobs");

        Ok(ids.into_iter().map(JobHandle).collect())
    }
}
