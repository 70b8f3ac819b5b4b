//! Cursor positions and the inclusive ranges built from them.
//!
//! A cursor is a tuple of key values. Single-column cursors are the common
//! case (`id`); composite cursors such as `(user_id, project_id)` or
//! `(table_name, column_name)` compare lexicographically.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MigrationError, Result};
use crate::table::KeyKind;

/// One component of a cursor.
///
/// Only integer and text columns can drive a batched migration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CursorValue {
    Int(i64),
    Text(String),
}

impl CursorValue {
    pub fn kind(&self) -> KeyKind {
        match self {
            CursorValue::Int(_) => KeyKind::Integer,
            CursorValue::Text(_) => KeyKind::Text,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            CursorValue::Int(v) => Value::from(*v),
            CursorValue::Text(v) => Value::from(v.as_str()),
        }
    }
}

impl fmt::Display for CursorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorValue::Int(v) => write!(f, "{}", v),
            CursorValue::Text(v) => write!(f, "{:?}", v),
        }
    }
}

impl From<i64> for CursorValue {
    fn from(v: i64) -> Self {
        CursorValue::Int(v)
    }
}

impl From<&str> for CursorValue {
    fn from(v: &str) -> Self {
        CursorValue::Text(v.to_string())
    }
}

impl From<String> for CursorValue {
    fn from(v: String) -> Self {
        CursorValue::Text(v)
    }
}

/// A position in a table's key domain.
///
/// Ordering is lexicographic over the components, which is what the
/// row-value comparison `(a, b) > ($1, $2)` does in Postgres.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Vec<CursorValue>);

impl Cursor {
    pub fn new(values: Vec<CursorValue>) -> Self {
        Self(values)
    }

    /// Single integer cursor.
    pub fn int(v: i64) -> Self {
        Self(vec![CursorValue::Int(v)])
    }

    /// Single text cursor.
    pub fn text(v: impl Into<String>) -> Self {
        Self(vec![CursorValue::Text(v.into())])
    }

    pub fn values(&self) -> &[CursorValue] {
        &self.0
    }

    pub fn arity(&self) -> usize {
        self.0.len()
    }

    pub fn kinds(&self) -> Vec<KeyKind> {
        self.0.iter().map(CursorValue::kind).collect()
    }

    /// The integer value of a single-column integer cursor.
    pub fn as_i64(&self) -> Option<i64> {
        match self.0.as_slice() {
            [CursorValue::Int(v)] => Some(*v),
            _ => None,
        }
    }

    /// JSON form handed to executors: a scalar for single-column cursors,
    /// an array for composite ones.
    pub fn to_job_argument(&self) -> Value {
        match self.0.as_slice() {
            [single] => single.to_json(),
            many => Value::Array(many.iter().map(CursorValue::to_json).collect()),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{}", single),
            many => {
                write!(f, "(")?;
                for (i, v) in many.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<i64> for Cursor {
    fn from(v: i64) -> Self {
        Cursor::int(v)
    }
}

impl From<&str> for Cursor {
    fn from(v: &str) -> Self {
        Cursor::text(v)
    }
}

impl From<(i64, i64)> for Cursor {
    fn from((a, b): (i64, i64)) -> Self {
        Cursor(vec![CursorValue::Int(a), CursorValue::Int(b)])
    }
}

impl From<(&str, &str)> for Cursor {
    fn from((a, b): (&str, &str)) -> Self {
        Cursor(vec![a.into(), b.into()])
    }
}

/// Inclusive `[min, max]` bounds of one batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorRange {
    pub min: Cursor,
    pub max: Cursor,
}

impl CursorRange {
    pub fn new(min: impl Into<Cursor>, max: impl Into<Cursor>) -> Result<Self> {
        let (min, max) = (min.into(), max.into());
        if min.arity() != max.arity() {
            return Err(MigrationError::config(format!(
                "cursor range bounds have different arity: {} vs {}",
                min, max
            )));
        }
        if min > max {
            return Err(MigrationError::config(format!(
                "cursor range min {} is greater than max {}",
                min, max
            )));
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, cursor: &Cursor) -> bool {
        &self.min <= cursor && cursor <= &self.max
    }

    /// `[min, max]` as executor arguments.
    pub fn to_job_arguments(&self) -> [Value; 2] {
        [self.min.to_job_argument(), self.max.to_job_argument()]
    }
}

impl fmt::Display for CursorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}
