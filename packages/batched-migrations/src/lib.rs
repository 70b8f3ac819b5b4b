//! # Batched background migrations
//!
//! Data migrations over large tables, split into cursor ranges and handed to
//! a delayed job queue at a throttled rate, with durable progress tracking.
//!
//! ## Core Concepts
//!
//! - [`TableHandle`] names the table and its cursor column(s)
//! - [`Partitioner`] walks the key domain in ranges of at most `batch_size`
//! - [`TrackingStore`] persists one [`MigrationRecord`] per configuration
//!   and the cursor up to which ranges have been dispatched
//! - [`JobQueue`] accepts one [`ScheduledJob`] per range with a delay
//! - [`BatchScheduler`] ties them together; [`MigrationHelpers`] is the
//!   surface called from deploy-time schema migrations
//!
//! ## Architecture
//!
//! ```text
//! MigrationHelpers::queue_batched_background_migration()
//!     │
//!     ▼
//! BatchScheduler::schedule()
//!     │
//!     ├─► TrackingStore::find / create_or_get
//!     │
//!     ├─► Partitioner ──► KeySource::next_batch()
//!     │
//!     └─► for each range k
//!             ├─► JobQueue::enqueue(delay = initial_delay + k * interval)
//!             ├─► TrackingStore::record_batch()
//!             └─► TrackingStore::advance(range.max)
//!
//! worker ──► ExecutorRegistry::execute() ──► BatchScheduler::acknowledge_batch()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Ranges cover the domain** - contiguous, non-overlapping, inclusive
//! 2. **Cursor is monotonic** - it only moves forward, and only after enqueue
//! 3. **One record per configuration** - re-scheduling never re-dispatches
//! 4. **Batches are spaced** - never closer than the minimum interval
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use batched_migrations::*;
//!
//! let scheduler = Arc::new(
//!     BatchScheduler::builder()
//!         .keys(Arc::new(PgKeySource::new(pool.clone())))
//!         .store(Arc::new(PostgresTrackingStore::new(pool.clone())))
//!         .queue(Arc::new(PostgresJobQueue::new(pool.clone())))
//!         .build(),
//! );
//!
//! let outcome = MigrationHelpers::new(scheduler)
//!     .queue_batched_background_migration(
//!         &MigrationDefinition::builder()
//!             .job_class_name("BackfillProjectNamespaces")
//!             .table(TableHandle::new("projects", "id"))
//!             .job_interval(Duration::from_secs(120))
//!             .batch_size(1_000)
//!             .sub_batch_size(100)
//!             .build(),
//!     )
//!     .await?;
//! ```

pub mod config;
pub mod cursor;
pub mod error;
pub mod executor;
pub mod helpers;
pub mod optimizer;
pub mod partition;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod table;

pub use config::{Config, DuplicatePolicy, SchedulerConfig};
pub use cursor::{Cursor, CursorRange, CursorValue};
pub use error::{MigrationError, Result};
pub use executor::{BatchExecutor, ExecutorRegistry};
pub use helpers::MigrationHelpers;
pub use partition::{partition, InMemoryKeySource, KeySource, Partitioner, PgKeySource};
pub use queue::{JobHandle, JobQueue, PostgresJobQueue, ScheduledJob, TestJobQueue};
pub use scheduler::{BatchOutcome, BatchScheduler, ScheduleOutcome, SkipReason};
pub use store::{
    BatchRecord, BatchStatus, InMemoryTrackingStore, MigrationDefinition, MigrationIdentity,
    MigrationRecord, MigrationStatus, PostgresTrackingStore, TrackingStore,
};
pub use table::{KeyColumn, KeyKind, TableHandle};
