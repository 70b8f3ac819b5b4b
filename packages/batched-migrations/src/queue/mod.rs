//! Job queue adapter
//!
//! The scheduler never runs batches itself. It hands a [`ScheduledJob`] per
//! range to a [`JobQueue`], which promises at-least-once execution after the
//! job's delay. Whatever worker picks the job up resolves `job_class_name`
//! to an executor and reports back through
//! [`BatchScheduler::acknowledge_batch`](crate::scheduler::BatchScheduler::acknowledge_batch).

mod memory;
mod postgres;

pub use memory::{EnqueuedJob, TestJobQueue};
pub use postgres::{BackgroundJob, PostgresJobQueue};

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::cursor::CursorRange;
use crate::error::Result;

/// Opaque id returned by the queue for one enqueued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct JobHandle(pub Uuid);

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One batch ready to be handed to the queue.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledJob {
    pub job_class_name: String,
    pub range: CursorRange,
    pub job_arguments: Vec<Value>,
    pub sub_batch_size: i64,
    pub migration_id: Uuid,
    pub batch_index: i64,
    #[serde(with = "duration_secs")]
    pub delay: Duration,
}

impl ScheduledJob {
    /// Positional arguments for the executor:
    /// `[range.min, range.max, job_arguments..., sub_batch_size]`.
    pub fn args(&self) -> Vec<Value> {
        let [min, max] = self.range.to_job_arguments();
        let mut args = Vec::with_capacity(self.job_arguments.len() + 3);
        args.push(min);
        args.push(max);
        args.extend(self.job_arguments.iter().cloned());
        args.push(Value::from(self.sub_batch_size));
        args
    }
}

/// Delayed job submission.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: &ScheduledJob) -> Result<JobHandle>;

    /// Submit several jobs in one round trip.
    ///
    /// Handles are returned in input order.
    async fn enqueue_bulk(&self, jobs: &[ScheduledJob]) -> Result<Vec<JobHandle>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for job in jobs {
            handles.push(self.enqueue(job).await?);
        }
        Ok(handles)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(delay: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(delay.as_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn args_wrap_extra_arguments_with_range_and_sub_batch_size() {
        let job = ScheduledJob {
            job_class_name: "CopyColumnUsingBackgroundMigrationJob".into(),
            range: CursorRange::new(1i64, 1000i64).unwrap(),
            job_arguments: vec![json!("id"), json!("id_convert_to_bigint")],
            sub_batch_size: 100,
            migration_id: Uuid::nil(),
            batch_index: 0,
            delay: Duration::ZERO,
        };

        assert_eq!(
            job.args(),
            vec![
                json!(1),
                json!(1000),
                json!("id"),
                json!("id_convert_to_bigint"),
                json!(100)
            ]
        );
    }

    #[test]
    fn composite_ranges_pass_arrays() {
        let job = ScheduledJob {
            job_class_name: "BackfillProjectAuthorizations".into(),
            range: CursorRange::new((1i64, 5i64), (2i64, 3i64)).unwrap(),
            job_arguments: vec![],
            sub_batch_size: 10,
            migration_id: Uuid::nil(),
            batch_index: 0,
            delay: Duration::ZERO,
        };

        assert_eq!(job.args(), vec![json!([1, 5]), json!([2, 3]), json!(10)]);
    }
}
