//! Test harness with testcontainers for Postgres integration testing.
//!
//! One container is shared by every test in the binary. The tracking and
//! job tables are created once; each test gets its own pool and should use
//! its own table and job class names.

use std::sync::Arc;

use anyhow::{Context, Result};
use batched_migrations::{
    BatchScheduler, PgKeySource, PostgresJobQueue, PostgresTrackingStore, SchedulerConfig,
};
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

struct SharedTestInfra {
    db_url: String,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let pg_host = postgres.get_host().await?;
        let pg_port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!(
            "postgresql://postgres:postgres@{}:{}/postgres",
            pg_host, pg_port
        );

        let pool = PgPool::connect(&db_url)
            .await
            .context("Failed to connect to Postgres for migrations")?;
        PostgresTrackingStore::new(pool)
            .migrate()
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            db_url,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }
}

/// Postgres-backed scheduler for one test.
///
/// ```ignore
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let table = ctx.create_table(1..=100).await;
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
    pub store: Arc<PostgresTrackingStore>,
    pub queue: Arc<PostgresJobQueue>,
    pub scheduler: Arc<BatchScheduler>,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;

        let db_pool = PgPool::connect(&infra.db_url)
            .await
            .context("Failed to connect to test database")?;

        let store = Arc::new(PostgresTrackingStore::new(db_pool.clone()));
        let queue = Arc::new(PostgresJobQueue::new(db_pool.clone()));
        let scheduler = Arc::new(
            BatchScheduler::builder()
                .keys(Arc::new(PgKeySource::new(db_pool.clone())))
                .store(store.clone())
                .queue(queue.clone())
                .config(SchedulerConfig::default())
                .build(),
        );

        Ok(Self {
            db_pool,
            store,
            queue,
            scheduler,
        })
    }

    /// Create a uniquely named table holding `ids` and return its name.
    pub async fn create_table(&self, ids: impl IntoIterator<Item = i64>) -> String {
        let name = format!("items_{}", Uuid::new_v4().simple());

        sqlx::query(&format!(
            "CREATE TABLE {name} (id bigint PRIMARY KEY, state text)"
        ))
        .execute(&self.db_pool)
        .await
        .expect("Failed to create test table");

        let ids: Vec<i64> = ids.into_iter().collect();
        sqlx::query(&format!(
            "INSERT INTO {name} (id) SELECT unnest($1::bigint[])"
        ))
        .bind(&ids)
        .execute(&self.db_pool)
        .await
        .expect("Failed to insert test rows");

        name
    }

    /// Create a uniquely named `(table_name, column_name)` table under an ICU
    /// locale collation and return its name.
    pub async fn create_columns_table(&self, rows: &[(&str, &str)]) -> String {
        let name = format!("columns_{}", Uuid::new_v4().simple());

        sqlx::query(&format!(
            "CREATE TABLE {name} (\
                table_name text COLLATE \"und-x-icu\" NOT NULL, \
                column_name text COLLATE \"und-x-icu\" NOT NULL, \
                PRIMARY KEY (table_name, column_name))"
        ))
        .execute(&self.db_pool)
        .await
        .expect("Failed to create test table");

        let (tables, columns): (Vec<String>, Vec<String>) = rows
            .iter()
            .map(|(t, c)| (t.to_string(), c.to_string()))
            .unzip();
        sqlx::query(&format!(
            "INSERT INTO {name} (table_name, column_name) \
             SELECT * FROM unnest($1::text[], $2::text[])"
        ))
        .bind(&tables)
        .bind(&columns)
        .execute(&self.db_pool)
        .await
        .expect("Failed to insert test rows");

        name
    }
}
