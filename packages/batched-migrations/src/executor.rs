//! Executor lookup by job class name.
//!
//! The scheduler only carries job class names. Code that actually performs
//! a batch is registered here, and is only needed for inline execution
//! (stealing) and by workers draining the job queue.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{MigrationError, Result};
use crate::queue::ScheduledJob;

/// Performs one batch of a migration.
///
/// Implementations must be idempotent and scoped to `job.range`: the same
/// range may run more than once, and neighbouring ranges may run
/// concurrently.
#[async_trait]
pub trait BatchExecutor: Send + Sync {
    async fn perform(&self, job: &ScheduledJob) -> anyhow::Result<()>;
}

type BoxedFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;

type BoxedFn = Box<dyn Fn(ScheduledJob) -> BoxedFuture + Send + Sync>;

struct FnExecutor {
    f: BoxedFn,
}

#[async_trait]
impl BatchExecutor for FnExecutor {
    async fn perform(&self, job: &ScheduledJob) -> anyhow::Result<()> {
        (self.f)(job.clone()).await
    }
}

/// Maps job class names to executors.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn BatchExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        job_class_name: impl Into<String>,
        executor: impl BatchExecutor + 'static,
    ) -> &mut Self {
        self.executors
            .insert(job_class_name.into(), Arc::new(executor));
        self
    }

    /// Register an async closure as an executor.
    ///
    /// ```ignore
    /// registry.register_fn("BackfillNamespaceState", |job| async move {
    ///     let [min, max] = job.range.to_job_arguments();
    ///     backfill(min, max, job.sub_batch_size).await
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, job_class_name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ScheduledJob) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let f: BoxedFn = Box::new(move |job| -> BoxedFuture { Box::pin(f(job)) });
        self.register(job_class_name, FnExecutor { f })
    }

    pub fn contains(&self, job_class_name: &str) -> bool {
        self.executors.contains_key(job_class_name)
    }

    pub fn get(&self, job_class_name: &str) -> Result<Arc<dyn BatchExecutor>> {
        self.executors
            .get(job_class_name)
            .cloned()
            .ok_or_else(|| MigrationError::UnknownJobClass(job_class_name.to_string()))
    }

    /// Run `job` with the executor registered for its class.
    pub async fn execute(&self, job: &ScheduledJob) -> Result<()> {
        let executor = self.get(&job.job_class_name)?;
        executor
            .perform(job)
            .await
            .map_err(|source| MigrationError::Executor {
                job_class_name: job.job_class_name.clone(),
                batch_index: job.batch_index,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::time::Duration;

    use anyhow::anyhow;
    use uuid::Uuid;

    use crate::cursor::CursorRange;

    fn job(class: &str) -> ScheduledJob {
        ScheduledJob {
            job_class_name: class.into(),
            range: CursorRange::new(1i64, 10i64).unwrap(),
            job_arguments: vec![],
            sub_batch_size: 5,
            migration_id: Uuid::nil(),
            batch_index: 3,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn executes_registered_closure() {
        let seen = Arc::new(AtomicI64::new(0));
        let counter = seen.clone();

        let mut registry = ExecutorRegistry::new();
        registry.register_fn("CountRows", move |job| {
            let counter = counter.clone();
            async move {
                let min = job.range.min.as_i64().unwrap_or(0);
                let max = job.range.max.as_i64().unwrap_or(0);
                counter.fetch_add(max - min + 1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            }
        });

        registry.execute(&job("CountRows")).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn unknown_class_is_an_error() {
        let registry = ExecutorRegistry::new();

        let err = registry.execute(&job("Missing")).await.unwrap_err();
        assert!(matches!(err, MigrationError::UnknownJobClass(name) if name == "Missing"));
    }

    #[tokio::test]
    async fn executor_errors_carry_class_and_batch() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("Broken", |_job| async {
            Err::<(), _>(anyhow!("deadlock detected"))
        });

        let err = registry.execute(&job("Broken")).await.unwrap_err();
        match err {
            MigrationError::Executor {
                job_class_name,
                batch_index,
                source,
            } => {
                assert_eq!(job_class_name, "Broken");
                assert_eq!(batch_index, 3);
                assert_eq!(source.to_string(), "deadlock detected");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
