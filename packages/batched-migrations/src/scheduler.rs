//! Batch scheduler and throttler
//!
//! Drives the partitioner and the tracking store to hand a rate-limited
//! stream of [`ScheduledJob`]s to the job queue.
//!
//! # Flow
//!
//! ```text
//! schedule(definition)
//!     │
//!     ├─► validate, clamp interval
//!     ├─► existing record? ─► finished/paused/failed: skip
//!     │                    └► queued/active: continue from cursor
//!     ├─► resolve [min, max] ─► empty: nothing to migrate
//!     ├─► create_or_get ─► queued ─► active
//!     │
//!     └─► for each range k = 0, 1, ...
//!             delay = initial_delay + k * interval
//!             enqueue ─► record_batch ─► advance(range.max)
//! ```
//!
//! Any queue or store error stops dispatch immediately and is returned.
//! Batches already enqueued stay enqueued; the cursor reflects the last
//! range whose advance was persisted, so a later `schedule` call resumes
//! from there.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::config::{DuplicatePolicy, SchedulerConfig};
use crate::cursor::Cursor;
use crate::error::{MigrationError, Result};
use crate::executor::ExecutorRegistry;
use crate::optimizer;
use crate::partition::{resolve_domain, KeySource, Partitioner};
use crate::queue::{JobQueue, ScheduledJob};
use crate::store::{
    BatchRecord, BatchStatus, MigrationDefinition, MigrationRecord, MigrationStatus, NewBatch,
    NewMigration, TrackingStore,
};

// ============================================================================
// Outcomes
// ============================================================================

/// Why `schedule` left an existing migration alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    AlreadyFinished,
    Paused,
    Failed,
}

#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    /// Batches were handed to the queue (possibly zero, when a resumed
    /// migration had nothing left to dispatch).
    Dispatched {
        record: MigrationRecord,
        batches: usize,
        final_delay: Duration,
    },
    /// The table (or the requested sub-domain) holds no rows.
    NothingToMigrate,
    Skipped {
        record: MigrationRecord,
        reason: SkipReason,
    },
}

impl ScheduleOutcome {
    /// Delay of the last dispatched batch, zero when nothing was dispatched.
    pub fn final_delay(&self) -> Duration {
        match self {
            ScheduleOutcome::Dispatched { final_delay, .. } => *final_delay,
            _ => Duration::ZERO,
        }
    }

    pub fn batches_dispatched(&self) -> usize {
        match self {
            ScheduleOutcome::Dispatched { batches, .. } => *batches,
            _ => 0,
        }
    }

    pub fn record(&self) -> Option<&MigrationRecord> {
        match self {
            ScheduleOutcome::Dispatched { record, .. } | ScheduleOutcome::Skipped { record, .. } => {
                Some(record)
            }
            ScheduleOutcome::NothingToMigrate => None,
        }
    }
}

/// What a worker reports after running one batch.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Succeeded { duration: Duration },
    Failed { error: String },
}

// ============================================================================
// Scheduler
// ============================================================================

/// Schedules, tracks and, when asked to, steals batched migrations.
///
/// Single-threaded: one call enumerates ranges and submits them
/// in order. Spacing between batches is expressed only through the delay
/// handed to the queue.
#[derive(TypedBuilder)]
pub struct BatchScheduler {
    keys: Arc<dyn KeySource>,
    store: Arc<dyn TrackingStore>,
    queue: Arc<dyn JobQueue>,
    #[builder(default)]
    executors: ExecutorRegistry,
    #[builder(default)]
    config: SchedulerConfig,
}

impl BatchScheduler {
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn TrackingStore> {
        &self.store
    }

    pub fn executors(&self) -> &ExecutorRegistry {
        &self.executors
    }

    /// Queue a migration and dispatch its batches.
    ///
    /// Re-running with the same configuration never re-dispatches ranges
    /// whose advance was persisted.
    #[instrument(
        skip(self, definition),
        fields(
            job_class_name = %definition.job_class_name,
            table_name = %definition.table.table_name,
        )
    )]
    pub async fn schedule(&self, definition: &MigrationDefinition) -> Result<ScheduleOutcome> {
        let interval = definition.validate(self.config.min_job_interval)?;

        if let Some(existing) = self.store.find(&definition.identity()).await? {
            return self.schedule_existing(existing).await;
        }

        let Some(domain) = resolve_domain(
            self.keys.as_ref(),
            &definition.table,
            definition.batch_min_value.clone(),
            definition.batch_max_value.clone(),
        )
        .await?
        else {
            info!("no rows in range, nothing to migrate");
            return Ok(ScheduleOutcome::NothingToMigrate);
        };

        let total_tuple_count = self.keys.estimate_count(&definition.table).await?;
        let created = self
            .store
            .create_or_get(
                NewMigration {
                    definition,
                    interval,
                    domain,
                    total_tuple_count,
                },
                self.config.duplicate_policy,
            )
            .await?;

        if !created.is_created() {
            return self.schedule_existing(created.into_record()).await;
        }

        let record = created.into_record();
        info!(
            migration_id = %record.id,
            min = %record.min_cursor.0,
            max = %record.max_cursor.0,
            interval_secs = record.interval_secs,
            "queued batched background migration"
        );

        self.dispatch(record, None).await
    }

    async fn schedule_existing(&self, record: MigrationRecord) -> Result<ScheduleOutcome> {
        match record.status {
            MigrationStatus::Finished => {
                info!(migration_id = %record.id, "migration already finished, nothing to do");
                Ok(ScheduleOutcome::Skipped {
                    record,
                    reason: SkipReason::AlreadyFinished,
                })
            }
            MigrationStatus::Paused => {
                info!(migration_id = %record.id, "migration is paused, not dispatching");
                Ok(ScheduleOutcome::Skipped {
                    record,
                    reason: SkipReason::Paused,
                })
            }
            MigrationStatus::Failed => {
                warn!(
                    migration_id = %record.id,
                    reason = record.failure_reason.as_deref().unwrap_or("unknown"),
                    "migration failed; delete it before queueing again"
                );
                Ok(ScheduleOutcome::Skipped {
                    record,
                    reason: SkipReason::Failed,
                })
            }
            MigrationStatus::Queued | MigrationStatus::Active => {
                if self.config.duplicate_policy == DuplicatePolicy::Reject {
                    return Err(MigrationError::DuplicateMigration {
                        job_class_name: record.job_class_name,
                        table_name: record.table_name,
                        column_name: record.column_name,
                        status: record.status,
                    });
                }
                debug!(migration_id = %record.id, "migration already queued, continuing from cursor");
                self.dispatch(record, None).await
            }
        }
    }

    /// Enqueue every range after the record's cursor up to `upper` (the
    /// recorded max by default).
    async fn dispatch(
        &self,
        record: MigrationRecord,
        upper: Option<Cursor>,
    ) -> Result<ScheduleOutcome> {
        let record = match record.status {
            MigrationStatus::Queued => self.store.mark_active(record.id).await?,
            _ => record,
        };

        let interval = record.interval();
        let upper = upper.unwrap_or_else(|| record.max_cursor.0.clone());
        let batch_size = self.next_batch_size(&record).await?;
        let mut partitioner = Partitioner::resume(
            self.keys.as_ref(),
            &record.table(),
            batch_size,
            record.cursor().cloned(),
            record.min_cursor.0.clone(),
            upper.clone(),
        )?;
        let first_index = self.next_batch_index(&record).await?;

        let mut dispatched = 0usize;
        let mut final_delay = Duration::ZERO;

        while let Some(range) = partitioner.next_range().await? {
            let batch_index = first_index + dispatched as i64;
            let delay = batch_delay(self.config.initial_delay, interval, dispatched);
            let job = ScheduledJob {
                job_class_name: record.job_class_name.clone(),
                range,
                job_arguments: record.job_arguments.0.clone(),
                sub_batch_size: record.sub_batch_size,
                migration_id: record.id,
                batch_index,
                delay,
            };

            let handle = self.queue.enqueue(&job).await?;
            self.store
                .record_batch(NewBatch {
                    migration_id: record.id,
                    batch_index,
                    range: job.range.clone(),
                    batch_size: partitioner.batch_size(),
                    sub_batch_size: record.sub_batch_size,
                    job_handle: Some(handle.0),
                })
                .await?;
            self.store.advance(record.id, &job.range.max).await?;

            debug!(
                migration_id = %record.id,
                batch_index,
                range = %job.range,
                delay_secs = delay.as_secs(),
                job_handle = %handle,
                "dispatched batch"
            );

            final_delay = delay;
            dispatched += 1;
        }

        // Keys between the last range and `upper` may be gone; the domain is
        // still fully handed out.
        self.store.advance(record.id, &upper).await?;

        info!(
            migration_id = %record.id,
            batches = dispatched,
            final_delay_secs = final_delay.as_secs(),
            "dispatched batched background migration"
        );

        let mut record = self.find(record.id).await?;
        if dispatched == 0
            && record.status == MigrationStatus::Active
            && self.all_batches_done(&record).await?
        {
            info!(migration_id = %record.id, "every batch already succeeded, migration finished");
            record = self.store.mark_finished(record.id).await?;
        }

        Ok(ScheduleOutcome::Dispatched {
            record,
            batches: dispatched,
            final_delay,
        })
    }

    /// Record a worker's result for one batch.
    ///
    /// The migration finishes once every range has been dispatched and
    /// every batch has succeeded. A batch that fails `max_batch_attempts`
    /// times fails the whole migration.
    #[instrument(skip(self, outcome), fields(migration_id = %migration_id))]
    pub async fn acknowledge_batch(
        &self,
        migration_id: Uuid,
        batch_index: i64,
        outcome: BatchOutcome,
    ) -> Result<MigrationRecord> {
        let record = self.find(migration_id).await?;

        match outcome {
            BatchOutcome::Succeeded { duration } => {
                self.store
                    .complete_batch(migration_id, batch_index, duration)
                    .await?;

                if record.status == MigrationStatus::Active && self.all_batches_done(&record).await?
                {
                    info!(migration_id = %migration_id, "all batches succeeded, migration finished");
                    return self.store.mark_finished(migration_id).await;
                }
            }
            BatchOutcome::Failed { error } => {
                let batch = self
                    .store
                    .fail_batch(
                        migration_id,
                        batch_index,
                        &error,
                        self.config.max_batch_attempts,
                    )
                    .await?;

                if batch.status == BatchStatus::Failed && !record.status.is_terminal() {
                    let reason = format!(
                        "batch {} {} failed after {} attempts: {}",
                        batch_index,
                        batch.range(),
                        batch.attempts,
                        error
                    );
                    error!(migration_id = %migration_id, reason = %reason, "marking migration failed");
                    return self.store.mark_failed(migration_id, &reason).await;
                }

                warn!(
                    migration_id = %migration_id,
                    attempts = batch.attempts,
                    error = %error,
                    "batch failed, left pending for retry"
                );
            }
        }

        self.find(migration_id).await
    }

    /// Re-enqueue every pending batch, `job_buffer_size` jobs per bulk call.
    ///
    /// Group `g` is delayed by `initial_delay + g * interval`. Returns the
    /// delay of the last group, zero when nothing was pending.
    #[instrument(skip(self), fields(migration_id = %migration_id))]
    pub async fn requeue_pending(
        &self,
        migration_id: Uuid,
        interval: Option<Duration>,
    ) -> Result<Duration> {
        let record = self.find(migration_id).await?;
        if record.status.is_terminal() {
            warn!(status = %record.status, "not requeueing batches of a terminal migration");
            return Ok(Duration::ZERO);
        }

        let pending = self
            .store
            .batches(migration_id, Some(BatchStatus::Pending))
            .await?;
        if pending.is_empty() {
            return Ok(Duration::ZERO);
        }

        let interval = interval
            .unwrap_or_else(|| record.interval())
            .max(self.config.min_job_interval);
        let group_size = self.config.job_buffer_size.max(1);

        let mut final_delay = Duration::ZERO;
        for (group_index, group) in pending.chunks(group_size).enumerate() {
            let delay = batch_delay(self.config.initial_delay, interval, group_index);
            let jobs: Vec<ScheduledJob> = group
                .iter()
                .map(|batch| job_for_batch(&record, batch, delay))
                .collect();

            self.queue.enqueue_bulk(&jobs).await?;
            final_delay = delay;
        }

        info!(
            batches = pending.len(),
            final_delay_secs = final_delay.as_secs(),
            "requeued pending batches"
        );

        Ok(final_delay)
    }

    #[instrument(skip(self), fields(migration_id = %migration_id))]
    pub async fn pause(&self, migration_id: Uuid) -> Result<MigrationRecord> {
        let record = self.store.pause(migration_id).await?;
        info!("paused batched background migration");
        Ok(record)
    }

    /// Return a paused migration to `active` and dispatch what remains.
    ///
    /// With `repartition`, rows inserted beyond the recorded max are
    /// included.
    #[instrument(skip(self), fields(migration_id = %migration_id))]
    pub async fn resume(&self, migration_id: Uuid, repartition: bool) -> Result<ScheduleOutcome> {
        let record = self.store.resume(migration_id).await?;
        info!("resumed batched background migration");

        let upper = if repartition {
            let live_max = self
                .keys
                .key_bounds(&record.table())
                .await?
                .map(|(_, max)| max);
            live_max.filter(|max| max > &record.max_cursor.0)
        } else {
            None
        };

        self.dispatch(record, upper).await
    }

    /// Steal: run every remaining batch inline until the cursor reaches the
    /// recorded max, then mark the migration finished.
    ///
    /// The migration is paused while this runs so queued workers and this
    /// call do not both dispatch. Pending batches that were already
    /// enqueued run first; queued copies of them will run again later and
    /// must be no-ops.
    #[instrument(skip(self), fields(migration_id = %migration_id))]
    pub async fn drain_remaining(&self, migration_id: Uuid) -> Result<MigrationRecord> {
        let record = self.find(migration_id).await?;
        match record.status {
            MigrationStatus::Finished => return Ok(record),
            MigrationStatus::Failed => {
                return Err(MigrationError::MigrationFailed {
                    job_class_name: record.job_class_name,
                    reason: record
                        .failure_reason
                        .unwrap_or_else(|| "unknown".to_string()),
                })
            }
            _ => {}
        }
        self.executors.get(&record.job_class_name)?;

        if record.status == MigrationStatus::Queued {
            self.store.mark_active(migration_id).await?;
        }
        let record = self.store.pause(migration_id).await?;
        info!(
            job_class_name = %record.job_class_name,
            cursor = ?record.cursor().map(ToString::to_string),
            "stealing remaining batches"
        );

        let interval = record.interval();
        let mut timings = Vec::new();

        for batch in self
            .store
            .batches(migration_id, Some(BatchStatus::Pending))
            .await?
        {
            let job = job_for_batch(&record, &batch, Duration::ZERO);
            timings.push(self.run_inline(&record, &job).await?);
        }

        let batch_size = self.next_batch_size(&record).await?;
        let mut partitioner = Partitioner::resume(
            self.keys.as_ref(),
            &record.table(),
            batch_size,
            record.cursor().cloned(),
            record.min_cursor.0.clone(),
            record.max_cursor.0.clone(),
        )?;
        let mut batch_index = self.next_batch_index(&record).await?;

        while let Some(range) = partitioner.next_range().await? {
            let job = ScheduledJob {
                job_class_name: record.job_class_name.clone(),
                range,
                job_arguments: record.job_arguments.0.clone(),
                sub_batch_size: record.sub_batch_size,
                migration_id,
                batch_index,
                delay: Duration::ZERO,
            };

            self.store
                .record_batch(NewBatch {
                    migration_id,
                    batch_index,
                    range: job.range.clone(),
                    batch_size: partitioner.batch_size(),
                    sub_batch_size: record.sub_batch_size,
                    job_handle: None,
                })
                .await?;
            timings.push(self.run_inline(&record, &job).await?);
            self.store.advance(migration_id, &job.range.max).await?;

            let next = optimizer::next_batch_size(
                partitioner.batch_size(),
                record.max_batch_size,
                &timings,
                interval,
            );
            if next != partitioner.batch_size() {
                debug!(from = partitioner.batch_size(), to = next, "growing batch size");
                partitioner.set_batch_size(next)?;
            }
            batch_index += 1;
        }

        self.store.advance(migration_id, &record.max_cursor.0).await?;
        self.store.resume(migration_id).await?;
        let record = self.store.mark_finished(migration_id).await?;

        info!(batches = timings.len(), "stole remaining batches, migration finished");
        Ok(record)
    }

    async fn run_inline(&self, record: &MigrationRecord, job: &ScheduledJob) -> Result<Duration> {
        let started = Instant::now();

        match self.executors.execute(job).await {
            Ok(()) => {
                let elapsed = started.elapsed();
                self.store
                    .complete_batch(record.id, job.batch_index, elapsed)
                    .await?;
                Ok(elapsed)
            }
            Err(err) => {
                let message = err.to_string();
                self.store
                    .fail_batch(record.id, job.batch_index, &message, 1)
                    .await?;
                let reason = format!(
                    "batch {} {} failed while running inline: {}",
                    job.batch_index, job.range, message
                );
                error!(migration_id = %record.id, reason = %reason, "steal failed");
                self.store.mark_failed(record.id, &reason).await?;
                Err(err)
            }
        }
    }

    async fn find(&self, migration_id: Uuid) -> Result<MigrationRecord> {
        self.store
            .find_by_id(migration_id)
            .await?
            .ok_or(MigrationError::NotFound(migration_id))
    }

    async fn all_batches_done(&self, record: &MigrationRecord) -> Result<bool> {
        if !record.is_fully_dispatched() {
            return Ok(false);
        }
        let batches = self.store.batches(record.id, None).await?;
        Ok(batches.iter().all(|b| b.status == BatchStatus::Succeeded))
    }

    /// Index for the next dispatched range.
    ///
    /// Batches recorded beyond the persisted cursor were enqueued but never
    /// advanced past; they are re-dispatched under their old index.
    async fn next_batch_index(&self, record: &MigrationRecord) -> Result<i64> {
        let batches = self.store.batches(record.id, None).await?;
        let cursor = record.cursor();

        let index = batches
            .iter()
            .find(|b| cursor.map_or(true, |c| &b.min_cursor.0 > c))
            .map(|b| b.batch_index)
            .unwrap_or_else(|| batches.last().map_or(0, |b| b.batch_index + 1));

        Ok(index)
    }

    /// Batch size for the next dispatch, grown from acknowledged timings
    /// when `max_batch_size` allows.
    async fn next_batch_size(&self, record: &MigrationRecord) -> Result<i64> {
        if record.max_batch_size.is_none() {
            return Ok(record.batch_size);
        }

        let batches = self.store.batches(record.id, None).await?;
        let current = batches
            .last()
            .map_or(record.batch_size, |b| b.batch_size.max(record.batch_size));
        let timings: Vec<Duration> = batches
            .iter()
            .filter(|b| b.status == BatchStatus::Succeeded)
            .filter_map(BatchRecord::duration)
            .collect();

        Ok(optimizer::next_batch_size(
            current,
            record.max_batch_size,
            &timings,
            record.interval(),
        ))
    }
}

/// `initial_delay + index * interval`, saturating instead of overflowing.
fn batch_delay(initial_delay: Duration, interval: Duration, index: usize) -> Duration {
    let index = u32::try_from(index).unwrap_or(u32::MAX);
    initial_delay.saturating_add(interval.saturating_mul(index))
}

fn job_for_batch(record: &MigrationRecord, batch: &BatchRecord, delay: Duration) -> ScheduledJob {
    ScheduledJob {
        job_class_name: record.job_class_name.clone(),
        range: batch.range(),
        job_arguments: record.job_arguments.0.clone(),
        sub_batch_size: batch.sub_batch_size,
        migration_id: record.id,
        batch_index: batch.batch_index,
        delay,
    }
}
