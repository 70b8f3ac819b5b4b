//! PostgreSQL key source.
//!
//! Every probe is an index-ordered `LIMIT 1` lookup using row-value
//! comparison, so a batch boundary costs one index descent plus an
//! `OFFSET batch_size - 1` walk. Integer columns are read as `bigint` and
//! text columns as `text` regardless of their declared width.
//!
//! Text keys are compared and ordered under `COLLATE "C"`, the byte order
//! `Cursor` uses. Under a locale collation `'B'` sorts between `'a'` and
//! `'c'`, and ranges computed here would disagree with cursor comparisons
//! made everywhere else.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use super::{BatchStart, KeySource};
use crate::cursor::{Cursor, CursorRange, CursorValue};
use crate::error::Result;
use crate::table::{KeyKind, TableHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Asc,
    Desc,
}

impl Direction {
    fn as_sql(&self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

/// Key source reading directly from the application's tables.
#[derive(Clone)]
pub struct PgKeySource {
    pool: PgPool,
}

impl PgKeySource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// `SELECT <keys> FROM <table> WHERE <filter> AND <lower> AND <upper>
    ///  ORDER BY <keys> <dir> OFFSET <offset> LIMIT 1`
    async fn probe(
        &self,
        table: &TableHandle,
        lower: Option<(&Cursor, bool)>,
        upper: Option<&Cursor>,
        direction: Direction,
        offset: i64,
    ) -> Result<Option<Cursor>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT ");
        let select_list = table
            .key_columns
            .iter()
            .map(|c| match c.kind {
                KeyKind::Integer => format!("\"{}\"::bigint", c.name),
                KeyKind::Text => format!("\"{}\"::text", c.name),
            })
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(select_list);
        qb.push(" FROM ");
        qb.push(table.quoted_table());
        qb.push(" WHERE TRUE");

        if let Some(filter) = &table.filter {
            qb.push(" AND (");
            qb.push(filter.as_str());
            qb.push(")");
        }

        let columns = key_expressions(table).join(", ");
        if let Some((cursor, inclusive)) = lower {
            qb.push(" AND (");
            qb.push(columns.as_str());
            qb.push(if inclusive { ") >= " } else { ") > " });
            push_cursor(&mut qb, cursor);
        }
        if let Some(cursor) = upper {
            qb.push(" AND (");
            qb.push(columns.as_str());
            qb.push(") <= ");
            push_cursor(&mut qb, cursor);
        }

        let order_by = key_expressions(table)
            .into_iter()
            .map(|expr| format!("{} {}", expr, direction.as_sql()))
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(" ORDER BY ");
        qb.push(order_by);
        qb.push(" OFFSET ");
        qb.push_bind(offset);
        qb.push(" LIMIT 1");

        let row = qb.build().fetch_optional(&self.pool).await?;
        row.map(|row| decode_cursor(&row, table)).transpose()
    }
}

#[async_trait]
impl KeySource for PgKeySource {
    async fn key_bounds(&self, table: &TableHandle) -> Result<Option<(Cursor, Cursor)>> {
        let min = self.probe(table, None, None, Direction::Asc, 0).await?;
        let max = self.probe(table, None, None, Direction::Desc, 0).await?;

        Ok(min.zip(max))
    }

    async fn next_batch(
        &self,
        table: &TableHandle,
        start: &BatchStart,
        upper: &Cursor,
        limit: i64,
    ) -> Result<Option<CursorRange>> {
        let lower = match start {
            BatchStart::Inclusive(c) => (c, true),
            BatchStart::After(c) => (c, false),
        };

        let Some(first) = self
            .probe(table, Some(lower), Some(upper), Direction::Asc, 0)
            .await?
        else {
            return Ok(None);
        };

        let last = match self
            .probe(
                table,
                Some((&first, true)),
                Some(upper),
                Direction::Asc,
                limit.max(1) - 1,
            )
            .await?
        {
            Some(last) => last,
            // Fewer than `limit` keys remain: the batch ends at the last one.
            None => self
                .probe(table, Some((&first, true)), Some(upper), Direction::Desc, 0)
                .await?
                .unwrap_or_else(|| first.clone()),
        };

        Ok(Some(CursorRange {
            min: first,
            max: last,
        }))
    }

    /// Planner estimate from `pg_class.reltuples`; `None` before the first
    /// ANALYZE.
    async fn estimate_count(&self, table: &TableHandle) -> Result<Option<i64>> {
        let estimate: Option<i64> = sqlx::query_scalar(
            "SELECT reltuples::bigint FROM pg_class WHERE oid = to_regclass($1)",
        )
        .bind(table.quoted_table())
        .fetch_optional(&self.pool)
        .await?;

        Ok(estimate.filter(|n| *n >= 0))
    }
}

/// Key columns as they appear in comparisons and `ORDER BY`.
fn key_expressions(table: &TableHandle) -> Vec<String> {
    table
        .key_columns
        .iter()
        .map(|c| match c.kind {
            KeyKind::Integer => format!("\"{}\"", c.name),
            KeyKind::Text => format!("\"{}\" COLLATE \"C\"", c.name),
        })
        .collect()
}

fn push_cursor(qb: &mut QueryBuilder<Postgres>, cursor: &Cursor) {
    qb.push("(");
    let mut separated = qb.separated(", ");
    for value in cursor.values() {
        match value {
            CursorValue::Int(v) => {
                separated.push_bind(*v);
            }
            CursorValue::Text(v) => {
                separated.push_bind(v.clone());
            }
        }
    }
    separated.push_unseparated(")");
}

fn decode_cursor(row: &PgRow, table: &TableHandle) -> Result<Cursor> {
    let mut values = Vec::with_capacity(table.key_columns.len());
    for (i, column) in table.key_columns.iter().enumerate() {
        let value = match column.kind {
            KeyKind::Integer => CursorValue::Int(row.try_get::<i64, _>(i)?),
            KeyKind::Text => CursorValue::Text(row.try_get::<String, _>(i)?),
        };
        values.push(value);
    }
    Ok(Cursor::new(values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::KeyColumn;

    #[test]
    fn text_keys_compare_in_byte_order() {
        let table = TableHandle::composite(
            "columns",
            vec![KeyColumn::text("table_name"), KeyColumn::integer("position")],
        );

        assert_eq!(
            key_expressions(&table),
            vec![
                "\"table_name\" COLLATE \"C\"".to_string(),
                "\"position\"".to_string()
            ]
        );
    }
}
