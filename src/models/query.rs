//! Query-related data models.
//!
//! This module defines bind parameters and statement results.

use serde::Serialize;
use serde_json::Value as JsonValue;

/// A decoded row: column name to JSON value.
pub type JsonRow = serde_json::Map<String, JsonValue>;

/// A parameter value for parameterized queries.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryParam {
    /// NULL value
    Null,
    /// Boolean value
    Bool(bool),
    /// Integer value (stored as i64 for maximum range)
    Int(i64),
    /// Floating point value
    Float(f64),
    /// String value
    String(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// JSON document (stored as text on SQLite)
    Json(JsonValue),
}

impl QueryParam {
    /// Check if this parameter is null.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get the type name of this parameter for debugging.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::String(_) => "string",
            Self::Bytes(_) => "bytes",
            Self::Json(_) => "json",
        }
    }
}

impl From<bool> for QueryParam {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for QueryParam {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<i64> for QueryParam {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<f64> for QueryParam {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for QueryParam {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for QueryParam {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Vec<u8>> for QueryParam {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<JsonValue> for QueryParam {
    fn from(v: JsonValue) -> Self {
        Self::Json(v)
    }
}

impl<T: Into<QueryParam>> From<Option<T>> for QueryParam {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Self::Null)
    }
}

/// Outcome of a single executed statement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Generated key, where the backend reports one (MySQL, SQLite).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_insert_id: Option<i64>,
}
