//! Helpers called from deploy-time schema migrations.
//!
//! ```ignore
//! let helpers = MigrationHelpers::new(scheduler);
//!
//! // up
//! helpers
//!     .queue_batched_background_migration(
//!         &MigrationDefinition::builder()
//!             .job_class_name("BackfillNamespaceTraversalIds")
//!             .table(TableHandle::new("namespaces", "id"))
//!             .job_interval(Duration::from_secs(120))
//!             .batch_size(1_000)
//!             .sub_batch_size(100)
//!             .build(),
//!     )
//!     .await?;
//!
//! // a later migration that adds a NOT NULL constraint
//! helpers
//!     .ensure_batched_background_migration_is_finished(&identity, true)
//!     .await?;
//! ```

use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::error::{MigrationError, Result};
use crate::scheduler::{BatchScheduler, ScheduleOutcome};
use crate::store::{MigrationDefinition, MigrationIdentity, MigrationStatus};

#[derive(Clone)]
pub struct MigrationHelpers {
    scheduler: Arc<BatchScheduler>,
}

impl MigrationHelpers {
    pub fn new(scheduler: Arc<BatchScheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &BatchScheduler {
        &self.scheduler
    }

    /// Queue a tracked migration. Safe to call again with the same
    /// configuration.
    pub async fn queue_batched_background_migration(
        &self,
        definition: &MigrationDefinition,
    ) -> Result<ScheduleOutcome> {
        self.scheduler.schedule(definition).await
    }

    /// Remove tracking state so nothing more is dispatched.
    ///
    /// Jobs already in the queue are not retracted. Absent records are a
    /// no-op.
    #[instrument(skip(self), fields(job_class_name = %identity.job_class_name))]
    pub async fn delete_batched_background_migration(
        &self,
        identity: &MigrationIdentity,
    ) -> Result<bool> {
        let deleted = self.scheduler.store().delete(identity).await?;
        if deleted {
            info!(table_name = %identity.table_name, "deleted batched background migration");
        }
        Ok(deleted)
    }

    /// Make sure a migration has completed, stealing its remaining batches
    /// inline when it has not.
    ///
    /// A missing record counts as finished. A failed migration is an error:
    /// the schema change that depends on it must not proceed. With
    /// `finalize`, per-batch tracking rows are removed once finished.
    #[instrument(skip(self), fields(job_class_name = %identity.job_class_name))]
    pub async fn ensure_batched_background_migration_is_finished(
        &self,
        identity: &MigrationIdentity,
        finalize: bool,
    ) -> Result<()> {
        let store = self.scheduler.store();
        let Some(record) = store.find(identity).await? else {
            info!(
                table_name = %identity.table_name,
                column_name = %identity.column_name,
                "no tracking record, treating migration as finished"
            );
            return Ok(());
        };

        let record = match record.status {
            MigrationStatus::Finished => record,
            MigrationStatus::Failed => {
                return Err(MigrationError::MigrationFailed {
                    job_class_name: record.job_class_name,
                    reason: record
                        .failure_reason
                        .unwrap_or_else(|| "unknown".to_string()),
                });
            }
            status => {
                warn!(
                    migration_id = %record.id,
                    status = %status,
                    "migration not finished, running remaining batches inline"
                );
                self.scheduler.drain_remaining(record.id).await?
            }
        };

        if record.status != MigrationStatus::Finished {
            return Err(MigrationError::NotFinished {
                job_class_name: record.job_class_name,
                status: record.status,
            });
        }

        if finalize {
            let removed = store.delete_batches(record.id, &[]).await?;
            info!(migration_id = %record.id, removed, "finalized batched background migration");
        }

        Ok(())
    }

    /// Delete any existing record for the configuration, then queue it
    /// afresh. This is how a failed migration is retried.
    #[instrument(skip(self, definition), fields(job_class_name = %definition.job_class_name))]
    pub async fn requeue_batched_background_migration(
        &self,
        definition: &MigrationDefinition,
    ) -> Result<ScheduleOutcome> {
        self.delete_batched_background_migration(&definition.identity())
            .await?;
        self.scheduler.schedule(definition).await
    }
}
