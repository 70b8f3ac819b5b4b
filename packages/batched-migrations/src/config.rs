use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use typed_builder::TypedBuilder;

/// What `create_or_get` does when an identical configuration is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Return the existing record.
    #[default]
    Idempotent,
    /// Fail with `DuplicateMigration`.
    Reject,
}

impl FromStr for DuplicatePolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "idempotent" => Ok(Self::Idempotent),
            "reject" => Ok(Self::Reject),
            other => Err(anyhow!(
                "unknown duplicate policy {:?} (expected idempotent or reject)",
                other
            )),
        }
    }
}

/// Scheduler tuning knobs.
#[derive(Debug, Clone, TypedBuilder)]
pub struct SchedulerConfig {
    /// Intervals below this are raised to it.
    #[builder(default = Duration::from_secs(120))]
    pub min_job_interval: Duration,
    /// Added to every batch delay.
    #[builder(default = Duration::ZERO)]
    pub initial_delay: Duration,
    #[builder(default)]
    pub duplicate_policy: DuplicatePolicy,
    /// Failed attempts before a batch (and its migration) is marked failed.
    #[builder(default = 3)]
    pub max_batch_attempts: i32,
    /// Jobs per bulk enqueue when requeueing pending batches.
    #[builder(default = 1000)]
    pub job_buffer_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();

        let min_interval_secs: u64 = env::var("BATCHED_MIGRATION_MIN_INTERVAL_SECS")
            .unwrap_or_else(|_| "120".to_string())
            .parse()
            .context("BATCHED_MIGRATION_MIN_INTERVAL_SECS must be a valid number")?;

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            max_connections: env::var("BATCHED_MIGRATION_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("BATCHED_MIGRATION_MAX_CONNECTIONS must be a valid number")?,
            scheduler: SchedulerConfig::builder()
                .min_job_interval(Duration::from_secs(min_interval_secs))
                .duplicate_policy(
                    env::var("BATCHED_MIGRATION_DUPLICATE_POLICY")
                        .unwrap_or_else(|_| "idempotent".to_string())
                        .parse()?,
                )
                .max_batch_attempts(
                    env::var("BATCHED_MIGRATION_MAX_BATCH_ATTEMPTS")
                        .unwrap_or_else(|_| "3".to_string())
                        .parse()
                        .context("BATCHED_MIGRATION_MAX_BATCH_ATTEMPTS must be a valid number")?,
                )
                .job_buffer_size(
                    env::var("BATCHED_MIGRATION_JOB_BUFFER_SIZE")
                        .unwrap_or_else(|_| "1000".to_string())
                        .parse()
                        .context("BATCHED_MIGRATION_JOB_BUFFER_SIZE must be a valid number")?,
                )
                .build(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheduler_defaults() {
        let config = SchedulerConfig::default();

        assert_eq!(config.min_job_interval, Duration::from_secs(120));
        assert_eq!(config.initial_delay, Duration::ZERO);
        assert_eq!(config.duplicate_policy, DuplicatePolicy::Idempotent);
        assert_eq!(config.max_batch_attempts, 3);
        assert_eq!(config.job_buffer_size, 1000);
    }

    #[test]
    fn parses_duplicate_policy() {
        assert_eq!(
            "reject".parse::<DuplicatePolicy>().unwrap(),
            DuplicatePolicy::Reject
        );
        assert!("sometimes".parse::<DuplicatePolicy>().is_err());
    }
}
