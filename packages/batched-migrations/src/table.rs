//! Table handles: which rows a migration walks and in what key order.
//!
//! A migration never defines its own row model. It passes a `TableHandle`
//! naming the table, the cursor column(s) and an optional row filter.

use serde::{Deserialize, Serialize};

use crate::cursor::Cursor;
use crate::error::{MigrationError, Result};

/// Column types that can drive a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    Integer,
    Text,
}

/// A cursor column and its type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyColumn {
    pub name: String,
    pub kind: KeyKind,
}

impl KeyColumn {
    pub fn integer(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KeyKind::Integer,
        }
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: KeyKind::Text,
        }
    }
}

/// Table name, cursor columns and an optional SQL predicate.
///
/// The predicate is a trusted SQL fragment written by the migration author,
/// e.g. `"archived = true"`. It is ANDed into every key probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableHandle {
    pub table_name: String,
    pub key_columns: Vec<KeyColumn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl TableHandle {
    /// Table keyed by a single integer column.
    pub fn new(table_name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            key_columns: vec![KeyColumn::integer(column)],
            filter: None,
        }
    }

    /// Table keyed by a composite cursor, compared lexicographically.
    pub fn composite(table_name: impl Into<String>, key_columns: Vec<KeyColumn>) -> Self {
        Self {
            table_name: table_name.into(),
            key_columns,
            filter: None,
        }
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// The tracking column as it appears in a migration's identity.
    ///
    /// Composite cursors join their columns with `,`.
    pub fn column_name(&self) -> String {
        self.key_columns
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }

    pub fn kinds(&self) -> Vec<KeyKind> {
        self.key_columns.iter().map(|c| c.kind).collect()
    }

    /// Check table and column names, rejecting anything that is not a plain
    /// (optionally schema-qualified) identifier.
    pub fn validate(&self) -> Result<()> {
        if self.table_name.is_empty() {
            return Err(MigrationError::config("table name is missing"));
        }
        let mut parts = self.table_name.split('.');
        let valid_table = match (parts.next(), parts.next(), parts.next()) {
            (Some(table), None, None) => is_identifier(table),
            (Some(schema), Some(table), None) => is_identifier(schema) && is_identifier(table),
            _ => false,
        };
        if !valid_table {
            return Err(MigrationError::config(format!(
                "invalid table name {:?}",
                self.table_name
            )));
        }
        if self.key_columns.is_empty() {
            return Err(MigrationError::config(format!(
                "table {} has no cursor column",
                self.table_name
            )));
        }
        for column in &self.key_columns {
            if !is_identifier(&column.name) {
                return Err(MigrationError::config(format!(
                    "invalid column name {:?} on table {}",
                    column.name, self.table_name
                )));
            }
        }
        Ok(())
    }

    /// Check that a cursor has one value per key column, of the right kind.
    pub fn validate_cursor(&self, cursor: &Cursor) -> Result<()> {
        if cursor.kinds() != self.kinds() {
            return Err(MigrationError::config(format!(
                "cursor {} does not match columns ({}) of {}",
                cursor,
                self.column_name(),
                self.table_name
            )));
        }
        Ok(())
    }

    /// `"schema"."table"` form for SQL.
    pub fn quoted_table(&self) -> String {
        self.table_name
            .split('.')
            .map(quote_ident)
            .collect::<Vec<_>>()
            .join(".")
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorValue;

    #[test]
    fn composite_column_name_joins_columns() {
        let table = TableHandle::composite(
            "project_authorizations",
            vec![KeyColumn::integer("user_id"), KeyColumn::integer("project_id")],
        );
        assert_eq!(table.column_name(), "user_id,project_id");
    }

    #[test]
    fn schema_qualified_tables_are_quoted_per_part() {
        let table = TableHandle::new("gitlab_partitions_dynamic.ci_builds", "id");
        assert!(table.validate().is_ok());
        assert_eq!(
            table.quoted_table(),
            "\"gitlab_partitions_dynamic\".\"ci_builds\""
        );
    }

    #[test]
    fn rejects_malformed_identifiers() {
        assert!(TableHandle::new("", "id").validate().is_err());
        assert!(TableHandle::new("users; DROP TABLE users", "id").validate().is_err());
        assert!(TableHandle::new("users", "1id").validate().is_err());
        assert!(TableHandle::new("a.b.c", "id").validate().is_err());
        assert!(TableHandle::composite("users", vec![]).validate().is_err());
    }

    #[test]
    fn cursor_must_match_column_kinds() {
        let table = TableHandle::composite(
            "container_expiration_policies",
            vec![KeyColumn::integer("project_id"), KeyColumn::text("name_regex")],
        );
        let good = Cursor::new(vec![CursorValue::Int(1), CursorValue::from("x")]);
        assert!(table.validate_cursor(&good).is_ok());
        assert!(table.validate_cursor(&Cursor::int(1)).is_err());
        assert!(table.validate_cursor(&Cursor::from((1i64, 2i64))).is_err());
    }
}
