//! Cursor range partitioning
//!
//! Splits a table's key domain into consecutive inclusive ranges of at most
//! `batch_size` rows. Each range starts at the first key after the previous
//! range and ends at the key `batch_size - 1` rows further on, so ranges are
//! contiguous, never overlap and together cover every key present in
//! `[min, max]` at partition time.
//!
//! # Architecture
//!
//! ```text
//! Partitioner::new(source, table, batch_size, min?, max?)
//!     │
//!     ├─► KeySource::key_bounds()      (only for bounds not supplied)
//!     │
//!     └─► next_range() loop
//!             └─► KeySource::next_batch(start, upper, batch_size)
//! ```
//!
//! Ranges are produced lazily, one probe per call, and are never recomputed.
//! Resuming after a pause starts a new partitioner after the stored cursor.

mod memory;
mod postgres;

pub use memory::InMemoryKeySource;
pub use postgres::PgKeySource;

use async_trait::async_trait;
use futures::stream::{self, Stream};

use crate::cursor::{Cursor, CursorRange};
use crate::error::{MigrationError, Result};
use crate::table::TableHandle;

/// Where the next batch begins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStart {
    /// First key `>=` this cursor.
    Inclusive(Cursor),
    /// First key `>` this cursor.
    After(Cursor),
}

impl BatchStart {
    pub fn cursor(&self) -> &Cursor {
        match self {
            BatchStart::Inclusive(c) | BatchStart::After(c) => c,
        }
    }
}

/// Read access to a table's ordered key domain.
///
/// Implementations probe the index; they never load whole batches.
#[async_trait]
pub trait KeySource: Send + Sync {
    /// Smallest and largest key matching the table's filter, or `None` when
    /// no row matches.
    async fn key_bounds(&self, table: &TableHandle) -> Result<Option<(Cursor, Cursor)>>;

    /// `[first, last]` of the next at most `limit` keys starting at `start`
    /// and not beyond `upper`. `None` when no key remains.
    async fn next_batch(
        &self,
        table: &TableHandle,
        start: &BatchStart,
        upper: &Cursor,
        limit: i64,
    ) -> Result<Option<CursorRange>>;

    /// Approximate row count for progress reporting, when cheaply known.
    async fn estimate_count(&self, _table: &TableHandle) -> Result<Option<i64>> {
        Ok(None)
    }
}

/// Lazily walks a table's key domain in bounded batches.
pub struct Partitioner<'a, S: KeySource + ?Sized> {
    source: &'a S,
    table: TableHandle,
    batch_size: i64,
    next_start: Option<BatchStart>,
    upper: Option<Cursor>,
}

impl<'a, S: KeySource + ?Sized> Partitioner<'a, S> {
    /// Partition `[min, max]`, defaulting each bound to the key actually
    /// present in the table.
    ///
    /// An empty table, or `min > max`, yields a partitioner that produces no
    /// ranges.
    pub async fn new(
        source: &'a S,
        table: &TableHandle,
        batch_size: i64,
        min_value: Option<Cursor>,
        max_value: Option<Cursor>,
    ) -> Result<Self> {
        validate_batch_size(batch_size)?;

        let (next_start, upper) = match resolve_domain(source, table, min_value, max_value).await? {
            Some(domain) => (Some(BatchStart::Inclusive(domain.min)), Some(domain.max)),
            None => (None, None),
        };

        Ok(Self {
            source,
            table: table.clone(),
            batch_size,
            next_start,
            upper,
        })
    }

    /// Continue strictly after `after`, up to and including `max`.
    pub fn resume(
        source: &'a S,
        table: &TableHandle,
        batch_size: i64,
        after: Option<Cursor>,
        min: Cursor,
        max: Cursor,
    ) -> Result<Self> {
        validate_batch_size(batch_size)?;
        table.validate()?;
        table.validate_cursor(&min)?;
        table.validate_cursor(&max)?;

        let next_start = match after {
            Some(after) if after >= max => None,
            Some(after) => Some(BatchStart::After(after)),
            None if min <= max => Some(BatchStart::Inclusive(min)),
            None => None,
        };

        Ok(Self {
            source,
            table: table.clone(),
            batch_size,
            next_start,
            upper: Some(max),
        })
    }

    /// Produce the next range, or `None` once the domain is exhausted.
    pub async fn next_range(&mut self) -> Result<Option<CursorRange>> {
        let (start, upper) = match (&self.next_start, &self.upper) {
            (Some(start), Some(upper)) => (start, upper),
            _ => return Ok(None),
        };

        let range = self
            .source
            .next_batch(&self.table, start, upper, self.batch_size)
            .await?;

        self.next_start = match &range {
            Some(range) if &range.max < upper => Some(BatchStart::After(range.max.clone())),
            _ => None,
        };

        Ok(range)
    }

    pub fn batch_size(&self) -> i64 {
        self.batch_size
    }

    /// Change the size of batches produced from now on.
    pub fn set_batch_size(&mut self, batch_size: i64) -> Result<()> {
        validate_batch_size(batch_size)?;
        self.batch_size = batch_size;
        Ok(())
    }

    pub fn is_exhausted(&self) -> bool {
        self.next_start.is_none()
    }

    pub async fn collect_ranges(mut self) -> Result<Vec<CursorRange>> {
        let mut ranges = Vec::new();
        while let Some(range) = self.next_range().await? {
            ranges.push(range);
        }
        Ok(ranges)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<CursorRange>> + 'a
    where
        S: 'a,
    {
        stream::try_unfold(self, |mut partitioner| async move {
            let next = partitioner.next_range().await?;
            Ok::<_, MigrationError>(next.map(|range| (range, partitioner)))
        })
    }
}

/// The `[min, max]` a partitioner would walk, each bound defaulting to the
/// key actually present in the table.
///
/// `None` for an empty table or when `min > max`.
pub async fn resolve_domain<S: KeySource + ?Sized>(
    source: &S,
    table: &TableHandle,
    min_value: Option<Cursor>,
    max_value: Option<Cursor>,
) -> Result<Option<CursorRange>> {
    table.validate()?;
    for bound in min_value.iter().chain(max_value.iter()) {
        table.validate_cursor(bound)?;
    }

    // Probed even with both bounds given: an empty table never has a domain.
    let Some((actual_min, actual_max)) = source.key_bounds(table).await? else {
        return Ok(None);
    };
    let min = min_value.unwrap_or(actual_min);
    let max = max_value.unwrap_or(actual_max);

    Ok((min <= max).then_some(CursorRange { min, max }))
}

/// Partition a table's key domain.
///
/// See [`Partitioner::new`].
pub async fn partition<'a, S: KeySource + ?Sized>(
    source: &'a S,
    table: &TableHandle,
    batch_size: i64,
    min_value: Option<Cursor>,
    max_value: Option<Cursor>,
) -> Result<Partitioner<'a, S>> {
    Partitioner::new(source, table, batch_size, min_value, max_value).await
}

fn validate_batch_size(batch_size: i64) -> Result<()> {
    if batch_size <= 0 {
        return Err(MigrationError::config(format!(
            "batch_size must be positive, got {}",
            batch_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::KeyColumn;
    use futures::TryStreamExt;

    fn users(ids: impl IntoIterator<Item = i64>) -> (InMemoryKeySource, TableHandle) {
        let source = InMemoryKeySource::new();
        source.insert_ids("users", ids);
        (source, TableHandle::new("users", "id"))
    }

    fn range(min: i64, max: i64) -> CursorRange {
        CursorRange::new(min, max).unwrap()
    }

    #[tokio::test]
    async fn splits_dense_ids_into_bounded_batches() {
        let (source, table) = users(1..=2500);

        let ranges = partition(&source, &table, 1000, None, None)
            .await
            .unwrap()
            .collect_ranges()
            .await
            .unwrap();

        assert_eq!(
            ranges,
            vec![range(1, 1000), range(1001, 2000), range(2001, 2500)]
        );
    }

    #[tokio::test]
    async fn ranges_follow_actual_keys_across_gaps() {
        let (source, table) = users([3, 4, 10, 11, 12, 40]);

        let ranges = partition(&source, &table, 2, None, None)
            .await
            .unwrap()
            .collect_ranges()
            .await
            .unwrap();

        assert_eq!(ranges, vec![range(3, 4), range(10, 11), range(12, 40)]);
    }

    #[tokio::test]
    async fn empty_table_yields_nothing() {
        let (source, table) = users([]);

        let mut partitioner = partition(&source, &table, 10, None, None).await.unwrap();

        assert!(partitioner.is_exhausted());
        assert_eq!(partitioner.next_range().await.unwrap(), None);
    }

    #[tokio::test]
    async fn caller_bounds_limit_the_domain() {
        let (source, table) = users(1..=100);

        let ranges = partition(
            &source,
            &table,
            25,
            Some(Cursor::int(30)),
            Some(Cursor::int(70)),
        )
        .await
        .unwrap()
        .collect_ranges()
        .await
        .unwrap();

        assert_eq!(ranges, vec![range(30, 54), range(55, 70)]);
    }

    #[tokio::test]
    async fn min_above_max_is_nothing_to_do() {
        let (source, table) = users(1..=100);

        let partitioner = partition(
            &source,
            &table,
            25,
            Some(Cursor::int(80)),
            Some(Cursor::int(20)),
        )
        .await
        .unwrap();

        assert!(partitioner.is_exhausted());
    }

    #[tokio::test]
    async fn rejects_non_positive_batch_size() {
        let (source, table) = users(1..=10);

        let err = partition(&source, &table, 0, None, None).await.err().unwrap();
        assert!(matches!(err, MigrationError::Configuration(_)));
    }

    #[tokio::test]
    async fn rejects_bounds_of_the_wrong_shape() {
        let (source, table) = users(1..=10);

        let err = partition(&source, &table, 5, Some(Cursor::text("a")), None)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, MigrationError::Configuration(_)));
    }

    #[tokio::test]
    async fn composite_cursors_walk_in_tuple_order() {
        let source = InMemoryKeySource::new();
        source.insert_keys(
            "project_authorizations",
            [(1i64, 5i64), (1, 9), (2, 1), (2, 3), (3, 2)]
                .into_iter()
                .map(Cursor::from),
        );
        let table = TableHandle::composite(
            "project_authorizations",
            vec![KeyColumn::integer("user_id"), KeyColumn::integer("project_id")],
        );

        let ranges = partition(&source, &table, 2, None, None)
            .await
            .unwrap()
            .collect_ranges()
            .await
            .unwrap();

        assert_eq!(
            ranges,
            vec![
                CursorRange::new((1i64, 5i64), (1i64, 9i64)).unwrap(),
                CursorRange::new((2i64, 1i64), (2i64, 3i64)).unwrap(),
                CursorRange::new((3i64, 2i64), (3i64, 2i64)).unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn resume_continues_after_cursor() {
        let (source, table) = users(1..=50);

        let ranges = Partitioner::resume(
            &source,
            &table,
            20,
            Some(Cursor::int(20)),
            Cursor::int(1),
            Cursor::int(50),
        )
        .unwrap()
        .collect_ranges()
        .await
        .unwrap();

        assert_eq!(ranges, vec![range(21, 40), range(41, 50)]);
    }

    #[tokio::test]
    async fn resume_at_max_is_exhausted() {
        let (source, table) = users(1..=50);

        let partitioner = Partitioner::resume(
            &source,
            &table,
            20,
            Some(Cursor::int(50)),
            Cursor::int(1),
            Cursor::int(50),
        )
        .unwrap();

        assert!(partitioner.is_exhausted());
    }

    #[tokio::test]
    async fn batch_size_changes_apply_to_later_ranges() {
        let (source, table) = users(1..=100);
        let mut partitioner = partition(&source, &table, 10, None, None).await.unwrap();

        assert_eq!(partitioner.next_range().await.unwrap(), Some(range(1, 10)));
        partitioner.set_batch_size(30).unwrap();
        assert_eq!(partitioner.next_range().await.unwrap(), Some(range(11, 40)));
    }

    #[tokio::test]
    async fn resolve_domain_mixes_caller_and_actual_bounds() {
        let (source, table) = users(5..=90);

        let domain = resolve_domain(&source, &table, Some(Cursor::int(10)), None)
            .await
            .unwrap();
        assert_eq!(domain, Some(range(10, 90)));

        let empty = resolve_domain(&source, &table, Some(Cursor::int(95)), None)
            .await
            .unwrap();
        assert_eq!(empty, None);
    }

    #[tokio::test]
    async fn empty_table_has_no_domain_even_with_bounds() {
        let (source, table) = users([]);

        let domain = resolve_domain(
            &source,
            &table,
            Some(Cursor::int(1)),
            Some(Cursor::int(100)),
        )
        .await
        .unwrap();

        assert_eq!(domain, None);
    }

    #[test]
    fn stream_yields_the_same_ranges() {
        let (source, table) = users(1..=30);

        let ranges: Vec<CursorRange> = tokio_test::block_on(async {
            partition(&source, &table, 12, None, None)
                .await
                .unwrap()
                .into_stream()
                .try_collect()
                .await
                .unwrap()
        });

        assert_eq!(ranges, vec![range(1, 12), range(13, 24), range(25, 30)]);
    }
}
