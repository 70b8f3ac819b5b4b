//! Recording job queue for tests.

use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use super::{JobHandle, JobQueue, ScheduledJob};
use crate::error::{MigrationError, Result};

/// A job as the queue received it.
#[derive(Debug, Clone)]
pub struct EnqueuedJob {
    pub handle: JobHandle,
    pub job: ScheduledJob,
    /// Whether it arrived through `enqueue_bulk`.
    pub bulk: bool,
}

/// In-memory queue that records every submission.
///
/// Nothing is executed; tests inspect [`TestJobQueue::jobs`] and drive
/// completions through the scheduler themselves.
#[derive(Default)]
pub struct TestJobQueue {
    jobs: RwLock<Vec<EnqueuedJob>>,
    bulk_calls: RwLock<usize>,
    should_fail: RwLock<bool>,
}

impl TestJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent enqueues fail.
    pub fn set_should_fail(&self, fail: bool) {
        *self.should_fail.write().unwrap_or_else(|e| e.into_inner()) = fail;
    }

    /// All recorded jobs in submission order.
    pub fn jobs(&self) -> Vec<EnqueuedJob> {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn jobs_for(&self, job_class_name: &str) -> Vec<EnqueuedJob> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|j| j.job.job_class_name == job_class_name)
            .cloned()
            .collect()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|j| j.job.delay)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn bulk_calls(&self) -> usize {
        *self.bulk_calls.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn clear(&self) {
        self.jobs.write().unwrap_or_else(|e| e.into_inner()).clear();
        *self.bulk_calls.write().unwrap_or_else(|e| e.into_inner()) = 0;
    }

    fn check(&self) -> Result<()> {
        if *self.should_fail.read().unwrap_or_else(|e| e.into_inner()) {
            return Err(MigrationError::queue("simulated queue failure"));
        }
        Ok(())
    }

    fn push(&self, job: &ScheduledJob, bulk: bool) -> JobHandle {
        let handle = JobHandle(Uuid::new_v4());
        self.jobs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(EnqueuedJob {
                handle,
                job: job.clone(),
                bulk,
            });
        handle
    }
}

#[async_trait]
impl JobQueue for TestJobQueue {
    async fn enqueue(&self, job: &ScheduledJob) -> Result<JobHandle> {
        self.check()?;
        Ok(self.push(job, false))
    }

    async fn enqueue_bulk(&self, jobs: &[ScheduledJob]) -> Result<Vec<JobHandle>> {
        self.check()?;
        *self.bulk_calls.write().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(jobs.iter().map(|job| self.push(job, true)).collect())
    }
}
