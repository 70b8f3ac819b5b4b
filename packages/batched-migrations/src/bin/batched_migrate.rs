//! CLI for inspecting and operating batched background migrations
//!
//! Prints one JSON object per invocation on stdout for tooling to parse.
//! Logs go to stderr.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use batched_migrations::{
    BatchRecord, BatchScheduler, Config, MigrationError, MigrationRecord, PgKeySource,
    PostgresJobQueue, PostgresTrackingStore, ScheduleOutcome, TrackingStore,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "batched_migrate")]
#[command(about = "Operate batched background migrations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the tracking and job tables
    Setup,

    /// List every tracked migration
    List,

    /// Show one migration
    Status { id: Uuid },

    /// Stop dispatching a migration
    Pause { id: Uuid },

    /// Resume a paused migration and dispatch what remains
    Resume {
        id: Uuid,
        /// Include rows inserted beyond the recorded max
        #[arg(long)]
        repartition: bool,
    },

    /// Delete a migration's tracking state
    Delete { id: Uuid },

    /// Re-enqueue every pending batch
    Requeue {
        id: Uuid,
        #[arg(long)]
        interval_secs: Option<u64>,
    },

    /// List a migration's batches
    Batches { id: Uuid },
}

// ============================================================================
// JSON Response Types
// ============================================================================

#[derive(Serialize, Default)]
struct Response {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migrations: Option<Vec<MigrationRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    migration: Option<MigrationRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batches: Option<Vec<BatchRecord>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    final_delay_secs: Option<u64>,
}

impl Response {
    fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

fn output(resp: Response) -> Result<()> {
    println!("{}", serde_json::to_string(&resp)?);
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,batched_migrations=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true),
        )
        .init();

    let cli = Cli::parse();
    let ctx = connect().await?;

    let resp = match cli.command {
        Commands::Setup => cmd_setup(&ctx).await,
        Commands::List => cmd_list(&ctx).await,
        Commands::Status { id } => cmd_status(&ctx, id).await,
        Commands::Pause { id } => cmd_pause(&ctx, id).await,
        Commands::Resume { id, repartition } => cmd_resume(&ctx, id, repartition).await,
        Commands::Delete { id } => cmd_delete(&ctx, id).await,
        Commands::Requeue { id, interval_secs } => {
            cmd_requeue(&ctx, id, interval_secs.map(Duration::from_secs)).await
        }
        Commands::Batches { id } => cmd_batches(&ctx, id).await,
    };

    match resp {
        Ok(resp) => output(resp),
        Err(e) => output(Response::failed(e.to_string())),
    }
}

struct Ctx {
    scheduler: BatchScheduler,
    store: Arc<PostgresTrackingStore>,
}

async fn connect() -> Result<Ctx> {
    let config = Config::from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresTrackingStore::new(pool.clone()));
    let scheduler = BatchScheduler::builder()
        .keys(Arc::new(PgKeySource::new(pool.clone())))
        .store(store.clone())
        .queue(Arc::new(PostgresJobQueue::new(pool)))
        .config(config.scheduler)
        .build();

    Ok(Ctx { scheduler, store })
}

async fn find(ctx: &Ctx, id: Uuid) -> Result<MigrationRecord, MigrationError> {
    ctx.store
        .find_by_id(id)
        .await?
        .ok_or(MigrationError::NotFound(id))
}

// ============================================================================
// Commands
// ============================================================================

async fn cmd_setup(ctx: &Ctx) -> Result<Response> {
    ctx.store.migrate().await?;
    Ok(Response::ok().with_message("Tracking tables are up to date"))
}

async fn cmd_list(ctx: &Ctx) -> Result<Response> {
    Ok(Response {
        migrations: Some(ctx.store.list().await?),
        ..Response::ok()
    })
}

async fn cmd_status(ctx: &Ctx, id: Uuid) -> Result<Response> {
    Ok(Response {
        migration: Some(find(ctx, id).await?),
        ..Response::ok()
    })
}

async fn cmd_pause(ctx: &Ctx, id: Uuid) -> Result<Response> {
    let record = ctx.scheduler.pause(id).await?;
    Ok(Response {
        migration: Some(record),
        ..Response::ok().with_message("Migration paused")
    })
}

async fn cmd_resume(ctx: &Ctx, id: Uuid, repartition: bool) -> Result<Response> {
    let outcome = ctx.scheduler.resume(id, repartition).await?;
    let message = format!(
        "Migration resumed, {} batches dispatched",
        outcome.batches_dispatched()
    );
    let final_delay_secs = outcome.final_delay().as_secs();
    let migration = match outcome {
        ScheduleOutcome::Dispatched { record, .. } | ScheduleOutcome::Skipped { record, .. } => {
            Some(record)
        }
        ScheduleOutcome::NothingToMigrate => None,
    };

    Ok(Response {
        migration,
        final_delay_secs: Some(final_delay_secs),
        ..Response::ok().with_message(message)
    })
}

async fn cmd_delete(ctx: &Ctx, id: Uuid) -> Result<Response> {
    let record = find(ctx, id).await?;
    let deleted = ctx.store.delete(&record.identity()).await?;

    Ok(if deleted {
        Response::ok().with_message(format!("Deleted migration {}", record.job_class_name))
    } else {
        Response::ok().with_message("Migration was already gone")
    })
}

async fn cmd_requeue(ctx: &Ctx, id: Uuid, interval: Option<Duration>) -> Result<Response> {
    let final_delay = ctx.scheduler.requeue_pending(id, interval).await?;
    Ok(Response {
        final_delay_secs: Some(final_delay.as_secs()),
        ..Response::ok().with_message("Pending batches requeued")
    })
}

async fn cmd_batches(ctx: &Ctx, id: Uuid) -> Result<Response> {
    find(ctx, id).await?;
    Ok(Response {
        batches: Some(ctx.store.batches(id, None).await?),
        ..Response::ok()
    })
}
