//! Statement construction from SQL text and [`QueryParam`] lists.
//!
//! Parameters bind in order, one per placeholder. JSON documents are sent as
//! text on SQLite.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use sqlx::types::Json;
use sqlx::{MySql, Postgres, Sqlite};

pub(crate) type MySqlQuery<'q> = Query<'q, MySql, MySqlArguments>;
pub(crate) type PgQuery<'q> = Query<'q, Postgres, PgArguments>;
pub(crate) type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

pub(crate) fn mysql_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> MySqlQuery<'q> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    })
}

pub(crate) fn postgres_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> PgQuery<'q> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(Json(v)),
    })
}

pub(crate) fn sqlite_query<'q>(sql: &'q str, params: &'q [QueryParam]) -> SqliteQuery<'q> {
    params.iter().fold(sqlx::query(sql), |query, param| match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Json(v) => query.bind(v.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn test_sqlite_query_binds_in_order() {
        let pool = sqlx::SqlitePool::connect("sqlite::memory:").await.unwrap();
        let params = [
            QueryParam::Int(7),
            QueryParam::from("seven"),
            QueryParam::Null,
            QueryParam::Json(serde_json::json!({"n": 7})),
            QueryParam::Bytes(vec![1, 2]),
        ];

        let row = sqlite_query("SELECT ?, ?, ?, ?, ?", &params)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.get::<i64, _>(0), 7);
        assert_eq!(row.get::<String, _>(1), "seven");
        assert_eq!(row.get::<Option<String>, _>(2), None);
        assert_eq!(row.get::<String, _>(3), r#"{"n":7}"#);
        assert_eq!(row.get::<Vec<u8>, _>(4), vec![1, 2]);
    }
}
