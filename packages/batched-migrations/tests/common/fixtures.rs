//! In-memory scheduler wiring and migration definitions for tests.

use std::sync::Arc;
use std::time::Duration;

use batched_migrations::{
    BatchScheduler, ExecutorRegistry, InMemoryKeySource, InMemoryTrackingStore,
    MigrationDefinition, MigrationHelpers, SchedulerConfig, TableHandle, TestJobQueue,
};

/// Scheduler over in-memory adapters, with handles kept for inspection.
pub struct MemoryHarness {
    pub keys: Arc<InMemoryKeySource>,
    pub store: Arc<InMemoryTrackingStore>,
    pub queue: Arc<TestJobQueue>,
    pub scheduler: Arc<BatchScheduler>,
}

impl MemoryHarness {
    pub fn new() -> Self {
        Self::with(SchedulerConfig::default(), ExecutorRegistry::new())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self::with(config, ExecutorRegistry::new())
    }

    pub fn with_executors(executors: ExecutorRegistry) -> Self {
        Self::with(SchedulerConfig::default(), executors)
    }

    pub fn with(config: SchedulerConfig, executors: ExecutorRegistry) -> Self {
        let keys = Arc::new(InMemoryKeySource::new());
        let store = Arc::new(InMemoryTrackingStore::new());
        let queue = Arc::new(TestJobQueue::new());

        let scheduler = Arc::new(
            BatchScheduler::builder()
                .keys(keys.clone())
                .store(store.clone())
                .queue(queue.clone())
                .executors(executors)
                .config(config)
                .build(),
        );

        Self {
            keys,
            store,
            queue,
            scheduler,
        }
    }

    pub fn helpers(&self) -> MigrationHelpers {
        MigrationHelpers::new(self.scheduler.clone())
    }
}

/// `BackfillProjectSettings` over `projects.id`, 120s apart, sub-batches of
/// at most 100.
pub fn projects_definition(batch_size: i64) -> MigrationDefinition {
    MigrationDefinition::builder()
        .job_class_name("BackfillProjectSettings")
        .table(TableHandle::new("projects", "id"))
        .job_interval(Duration::from_secs(120))
        .batch_size(batch_size)
        .sub_batch_size(batch_size.min(100))
        .build()
}
