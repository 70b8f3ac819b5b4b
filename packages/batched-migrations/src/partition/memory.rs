//! In-memory key source.
//!
//! Holds an ordered key set per table name. Row filters are not evaluated;
//! register only the keys the filter would match.

use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::RwLock;

use async_trait::async_trait;

use super::{BatchStart, KeySource};
use crate::cursor::{Cursor, CursorRange};
use crate::error::Result;
use crate::table::TableHandle;

#[derive(Default)]
pub struct InMemoryKeySource {
    tables: RwLock<HashMap<String, BTreeSet<Cursor>>>,
}

impl InMemoryKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add rows keyed by a single integer column.
    pub fn insert_ids(&self, table: &str, ids: impl IntoIterator<Item = i64>) {
        self.insert_keys(table, ids.into_iter().map(Cursor::int));
    }

    pub fn insert_keys(&self, table: &str, keys: impl IntoIterator<Item = Cursor>) {
        self.tables
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(table.to_string())
            .or_default()
            .extend(keys);
    }

    pub fn len(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(table)
            .map(BTreeSet::len)
            .unwrap_or(0)
    }

    pub fn is_empty(&self, table: &str) -> bool {
        self.len(table) == 0
    }
}

#[async_trait]
impl KeySource for InMemoryKeySource {
    async fn key_bounds(&self, table: &TableHandle) -> Result<Option<(Cursor, Cursor)>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let bounds = tables.get(&table.table_name).and_then(|keys| {
            match (keys.first(), keys.last()) {
                (Some(min), Some(max)) => Some((min.clone(), max.clone())),
                _ => None,
            }
        });
        Ok(bounds)
    }

    async fn next_batch(
        &self,
        table: &TableHandle,
        start: &BatchStart,
        upper: &Cursor,
        limit: i64,
    ) -> Result<Option<CursorRange>> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let Some(keys) = tables.get(&table.table_name) else {
            return Ok(None);
        };

        let lower = match start {
            BatchStart::Inclusive(c) => Bound::Included(c),
            BatchStart::After(c) => Bound::Excluded(c),
        };
        if start.cursor() > upper {
            return Ok(None);
        }

        let mut batch = keys
            .range::<Cursor, _>((lower, Bound::Included(upper)))
            .take(limit.max(0) as usize);

        let Some(first) = batch.next() else {
            return Ok(None);
        };
        let last = batch.last().unwrap_or(first);

        Ok(Some(CursorRange {
            min: first.clone(),
            max: last.clone(),
        }))
    }

    async fn estimate_count(&self, table: &TableHandle) -> Result<Option<i64>> {
        Ok(Some(self.len(&table.table_name) as i64))
    }
}
