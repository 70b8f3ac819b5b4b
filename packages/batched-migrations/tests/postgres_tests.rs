//! Integration tests against a real Postgres via testcontainers.
//!
//! Run with: cargo test --test postgres_tests -- --ignored

mod common;

use std::time::Duration;

use batched_migrations::{
    BatchOutcome, BatchStatus, Cursor, KeyColumn, MigrationDefinition, MigrationStatus,
    ScheduleOutcome, TableHandle, TrackingStore,
};
use test_context::test_context;
use uuid::Uuid;

use crate::common::TestHarness;

fn definition(table: &str, batch_size: i64) -> MigrationDefinition {
    MigrationDefinition::builder()
        .job_class_name(format!("Backfill{}", Uuid::new_v4().simple()))
        .table(TableHandle::new(table, "id"))
        .job_interval(Duration::from_secs(120))
        .batch_size(batch_size)
        .sub_batch_size(batch_size.min(100))
        .build()
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn schedules_batches_into_background_jobs(ctx: &TestHarness) {
    let table = ctx.create_table(1..=2500).await;
    let definition = definition(&table, 1000);

    let outcome = ctx.scheduler.schedule(&definition).await.unwrap();
    let record = outcome.record().unwrap().clone();

    assert_eq!(outcome.batches_dispatched(), 3);
    assert_eq!(record.status, MigrationStatus::Active);
    assert_eq!(record.cursor(), Some(&Cursor::int(2500)));

    let jobs = ctx.queue.jobs_for_migration(record.id).await.unwrap();
    assert_eq!(jobs.len(), 3);
    assert_eq!(jobs[0].args.0[0], serde_json::json!(1));
    assert_eq!(jobs[0].args.0[1], serde_json::json!(1000));
    assert_eq!(jobs[2].args.0[1], serde_json::json!(2500));

    // Later batches run later.
    assert!(jobs[1].run_at - jobs[0].run_at >= chrono::Duration::seconds(119));
    assert!(jobs[2].run_at - jobs[1].run_at >= chrono::Duration::seconds(119));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn rescheduling_reuses_the_tracking_record(ctx: &TestHarness) {
    let table = ctx.create_table(1..=500).await;
    let definition = definition(&table, 100);

    let first = ctx.scheduler.schedule(&definition).await.unwrap();
    let second = ctx.scheduler.schedule(&definition).await.unwrap();

    assert_eq!(first.record().unwrap().id, second.record().unwrap().id);
    assert_eq!(second.batches_dispatched(), 0);

    let jobs = ctx
        .queue
        .jobs_for_migration(first.record().unwrap().id)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 5);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn empty_table_creates_no_record(ctx: &TestHarness) {
    let table = ctx.create_table([]).await;
    let definition = definition(&table, 100);

    let outcome = ctx.scheduler.schedule(&definition).await.unwrap();

    assert!(matches!(outcome, ScheduleOutcome::NothingToMigrate));
    assert!(ctx
        .store
        .find(&definition.identity())
        .await
        .unwrap()
        .is_none());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn acknowledged_batches_finish_the_migration(ctx: &TestHarness) {
    let table = ctx.create_table(1..=250).await;
    let definition = definition(&table, 100);

    let id = ctx
        .scheduler
        .schedule(&definition)
        .await
        .unwrap()
        .record()
        .unwrap()
        .id;

    for index in 0..3 {
        ctx.scheduler
            .acknowledge_batch(
                id,
                index,
                BatchOutcome::Succeeded {
                    duration: Duration::from_millis(1500),
                },
            )
            .await
            .unwrap();
    }

    let record = ctx.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.status, MigrationStatus::Finished);

    let batches = ctx.store.batches(id, Some(BatchStatus::Succeeded)).await.unwrap();
    assert_eq!(batches.len(), 3);
    assert_eq!(batches[0].duration(), Some(Duration::from_millis(1500)));

    let removed = ctx.store.delete_batches(id, &[]).await.unwrap();
    assert_eq!(removed, 3);
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn advance_never_moves_the_cursor_backwards(ctx: &TestHarness) {
    let table = ctx.create_table(1..=300).await;
    let definition = definition(&table, 100);

    let id = ctx
        .scheduler
        .schedule(&definition)
        .await
        .unwrap()
        .record()
        .unwrap()
        .id;

    assert!(!ctx.store.advance(id, &Cursor::int(100)).await.unwrap());
    let record = ctx.store.find_by_id(id).await.unwrap().unwrap();
    assert_eq!(record.cursor(), Some(&Cursor::int(300)));
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn delete_cascades_to_batches(ctx: &TestHarness) {
    let table = ctx.create_table(1..=300).await;
    let definition = definition(&table, 100);

    let id = ctx
        .scheduler
        .schedule(&definition)
        .await
        .unwrap()
        .record()
        .unwrap()
        .id;

    assert!(ctx.store.delete(&definition.identity()).await.unwrap());
    assert!(ctx.store.find_by_id(id).await.unwrap().is_none());
    assert!(ctx.store.batches(id, None).await.unwrap().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
#[ignore = "requires docker"]
async fn text_keys_partition_in_byte_order_under_a_locale_collation(ctx: &TestHarness) {
    // Locale order would put "B" between "a" and "c" and "_x" first.
    let table = ctx
        .create_columns_table(&[
            ("a", "id"),
            ("B", "id"),
            ("c", "id"),
            ("_x", "id"),
            ("Z_y", "id"),
            ("a", "Name"),
            ("a", "_name"),
        ])
        .await;
    let definition = MigrationDefinition::builder()
        .job_class_name(format!("Backfill{}", Uuid::new_v4().simple()))
        .table(TableHandle::composite(
            &table,
            vec![KeyColumn::text("table_name"), KeyColumn::text("column_name")],
        ))
        .job_interval(Duration::from_secs(120))
        .batch_size(2)
        .sub_batch_size(1)
        .build();

    let outcome = ctx.scheduler.schedule(&definition).await.unwrap();
    let record = outcome.record().unwrap().clone();

    assert_eq!(outcome.batches_dispatched(), 4);
    assert_eq!(record.cursor(), Some(&Cursor::from(("c", "id"))));

    let jobs = ctx.queue.jobs_for_migration(record.id).await.unwrap();
    let ranges: Vec<(serde_json::Value, serde_json::Value)> = jobs
        .iter()
        .map(|j| (j.args.0[0].clone(), j.args.0[1].clone()))
        .collect();
    assert_eq!(
        ranges,
        vec![
            (serde_json::json!(["B", "id"]), serde_json::json!(["Z_y", "id"])),
            (serde_json::json!(["_x", "id"]), serde_json::json!(["a", "Name"])),
            (serde_json::json!(["a", "_name"]), serde_json::json!(["a", "id"])),
            (serde_json::json!(["c", "id"]), serde_json::json!(["c", "id"])),
        ]
    );
}
