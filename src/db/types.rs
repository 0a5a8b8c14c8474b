//! Row decoding.
//!
//! Rows fetched through `Database::fetch_all` and `ModelQuery::select` are
//! turned into JSON maps. `TypeCategory` classifies each column's declared
//! type, then a backend-specific decoder extracts the value.

use crate::models::{DatabaseType, JsonRow};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, ColumnIndex, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Text,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked first: "numeric" would otherwise never reach the float arm
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores REAL or INTEGER
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }

    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }

    // varchar, text, char, date, time, uuid, ...
    TypeCategory::Text
}

/// DECIMAL/NUMERIC value kept in its exact textual form.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Binary column values are returned base64 encoded.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    JsonValue::String(STANDARD.encode(bytes))
}

/// Converts driver rows to JSON maps keyed by column name.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decoder:path) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> JsonRow {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let category = categorize_type(type_name, $db);
                        let value = $decoder(self, idx, type_name, category)
                            .unwrap_or(JsonValue::Null);
                        (col.name().to_string(), value)
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, DatabaseType::MySQL, mysql::decode_column);
impl_row_to_json!(PgRow, DatabaseType::PostgreSQL, postgres::decode_column);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, sqlite::decode_column);

/// Non-null value of column `idx` as `T`, or `None` for NULL and type mismatch.
fn column<R, T>(row: &R, idx: usize) -> Option<T>
where
    R: Row,
    usize: ColumnIndex<R>,
    T: for<'r> Decode<'r, R::Database> + Type<R::Database>,
{
    row.try_get::<Option<T>, _>(idx).ok().flatten()
}

fn float(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Text columns whose declared type mentions JSON are parsed when possible.
fn text(v: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

mod mysql {
    use super::*;

    pub fn decode_column(
        row: &MySqlRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Option<JsonValue> {
        match category {
            TypeCategory::Decimal => column::<_, RawDecimal>(row, idx).map(|d| JsonValue::String(d.0)),
            TypeCategory::Integer => column::<_, i64>(row, idx)
                .map(JsonValue::from)
                .or_else(|| column::<_, u64>(row, idx).map(JsonValue::from)),
            TypeCategory::Boolean => column::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Float => column::<_, f64>(row, idx)
                .or_else(|| column::<_, f32>(row, idx).map(f64::from))
                .map(float),
            TypeCategory::Binary => column::<_, Vec<u8>>(row, idx)
                .map(|bytes| encode_binary_value(&bytes)),
            TypeCategory::Json => column::<_, JsonValue>(row, idx),
            TypeCategory::Text => column::<_, String>(row, idx).map(|v| text(v, type_name)),
        }
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(
        row: &PgRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Option<JsonValue> {
        match category {
            TypeCategory::Decimal => column::<_, RawDecimal>(row, idx).map(|d| JsonValue::String(d.0)),
            // INT2/INT4/INT8 only decode as their exact width
            TypeCategory::Integer => column::<_, i64>(row, idx)
                .or_else(|| column::<_, i32>(row, idx).map(i64::from))
                .or_else(|| column::<_, i16>(row, idx).map(i64::from))
                .map(JsonValue::from),
            TypeCategory::Boolean => column::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Float => column::<_, f64>(row, idx)
                .or_else(|| column::<_, f32>(row, idx).map(f64::from))
                .map(float),
            TypeCategory::Binary => column::<_, Vec<u8>>(row, idx)
                .map(|bytes| encode_binary_value(&bytes)),
            TypeCategory::Json => column::<_, JsonValue>(row, idx),
            TypeCategory::Text => column::<_, String>(row, idx).map(|v| text(v, type_name)),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(
        row: &SqliteRow,
        idx: usize,
        type_name: &str,
        category: TypeCategory,
    ) -> Option<JsonValue> {
        use sqlx::ValueRef;

        // Expression columns (COUNT(*), COALESCE(...)) have no declared type
        let category = if type_name.is_empty() || type_name.eq_ignore_ascii_case("null") {
            let raw = row.try_get_raw(idx).ok()?;
            if raw.is_null() {
                return None;
            }
            categorize_type(raw.type_info().name(), DatabaseType::SQLite)
        } else {
            category
        };

        match category {
            TypeCategory::Integer => column::<_, i64>(row, idx).map(JsonValue::from),
            TypeCategory::Boolean => column::<_, bool>(row, idx).map(JsonValue::Bool),
            TypeCategory::Float | TypeCategory::Decimal => column::<_, f64>(row, idx).map(float),
            TypeCategory::Binary => column::<_, Vec<u8>>(row, idx)
                .map(|bytes| encode_binary_value(&bytes)),
            TypeCategory::Json | TypeCategory::Text => {
                column::<_, String>(row, idx).map(|v| text(v, type_name))
            }
        }
    }
}
