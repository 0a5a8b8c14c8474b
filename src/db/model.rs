//! Model query builder.
//!
//! [`ModelQuery`] builds simple single-statement queries over one or more
//! table descriptors. Clauses use `?` placeholders on every backend; they are
//! rewritten to `$n` for PostgreSQL before the statement is sent.
//!
//! The route (pool or ambient transaction) is captured from the context when
//! the query is created by `Database::model_query`.

use crate::context::Context;
use crate::db::handle::Database;
use crate::db::hook::Route;
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, ExecResult, JsonRow, QueryParam};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

/// A type stored in a table.
pub trait Model {
    const TABLE: &'static str;
}

/// A table reference in a query, optionally aliased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    name: String,
    alias: Option<String>,
}

impl TableRef {
    pub fn of<M: Model>() -> Self {
        Self::named(M::TABLE)
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
        }
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn to_sql(&self) -> String {
        match &self.alias {
            Some(alias) => format!("{} AS {}", self.name, alias),
            None => self.name.clone(),
        }
    }
}

/// A query under construction. Builder methods consume and return the query;
/// terminal methods borrow it and can be called repeatedly.
#[derive(Debug, Clone)]
pub struct ModelQuery {
    db: Database,
    ctx: Context,
    tables: Vec<TableRef>,
    columns: Vec<String>,
    filters: Vec<String>,
    params: Vec<QueryParam>,
    order_by: Vec<String>,
    limit: Option<u64>,
    offset: Option<u64>,
}

impl ModelQuery {
    pub(crate) fn new(db: Database, ctx: Context, tables: Vec<TableRef>) -> Self {
        Self {
            db,
            ctx,
            tables,
            columns: Vec::new(),
            filters: Vec::new(),
            params: Vec::new(),
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// Select these columns instead of `*`.
    pub fn columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns.extend(columns.into_iter().map(Into::into));
        self
    }

    /// Add a `WHERE` clause. Clauses are joined with `AND`; `params` bind the
    /// clause's `?` placeholders in order. Every bare `?` counts as a
    /// placeholder, so PostgreSQL's jsonb `?` operators are not usable here.
    pub fn filter<I>(mut self, clause: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<QueryParam>,
    {
        self.filters.push(clause.into());
        self.params.extend(params.into_iter().map(Into::into));
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>) -> Self {
        self.order_by.push(expr.into());
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Where this query's statements run.
    pub fn route(&self) -> Route {
        Route::of(&self.ctx)
    }

    /// The `SELECT` statement, with backend placeholders.
    pub fn to_select_sql(&self) -> DbResult<String> {
        let (sql, _) = self.prepare(self.select_sql(self.projection())?)?;
        Ok(sql)
    }

    pub async fn select(&self) -> DbResult<Vec<JsonRow>> {
        let (sql, params) = self.prepare(self.select_sql(self.projection())?)?;
        self.db
            .fetch_all_as(&self.ctx, "select", &sql, &params)
            .await
    }

    /// Select and deserialize each row into `T`.
    pub async fn select_as<T: DeserializeOwned>(&self) -> DbResult<Vec<T>> {
        self.select().await?.into_iter().map(deserialize_row).collect()
    }

    /// First row of the selection, if any.
    pub async fn first_as<T: DeserializeOwned>(&self) -> DbResult<Option<T>> {
        let query = self.clone().limit(1);
        let row = query.select().await?.into_iter().next();
        row.map(deserialize_row).transpose()
    }

    /// Number of rows matching the filters. Ordering and paging are ignored.
    pub async fn count(&self) -> DbResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {}{}",
            self.from_clause()?,
            self.where_clause()
        );
        let (sql, params) = self.prepare(sql)?;
        let count = self.db.fetch_i64(&self.ctx, "count", &sql, &params).await?;
        Ok(count.unwrap_or(0))
    }

    pub async fn exists(&self) -> DbResult<bool> {
        Ok(self.count().await? > 0)
    }

    /// Insert one row into the query's single table.
    pub async fn insert<'a, I>(&self, values: I) -> DbResult<ExecResult>
    where
        I: IntoIterator<Item = (&'a str, QueryParam)>,
    {
        let table = self.single_table("insert")?;
        let (columns, params): (Vec<&str>, Vec<QueryParam>) = values.into_iter().unzip();
        if columns.is_empty() {
            return Err(DbError::invalid_input("insert requires at least one column"));
        }

        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            table,
            columns.join(", "),
            placeholders
        );
        let (sql, _) = rewrite_placeholders(&sql, self.db.database_type());
        self.db.exec(&self.ctx, &sql, &params).await
    }

    /// Update rows matching the filters.
    pub async fn update<'a, I>(&self, values: I) -> DbResult<ExecResult>
    where
        I: IntoIterator<Item = (&'a str, QueryParam)>,
    {
        let table = self.single_table("update")?;
        let (columns, mut params): (Vec<&str>, Vec<QueryParam>) = values.into_iter().unzip();
        if columns.is_empty() {
            return Err(DbError::invalid_input("update requires at least one column"));
        }

        let assignments = columns
            .iter()
            .map(|column| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!("UPDATE {} SET {}{}", table, assignments, self.where_clause());
        params.extend(self.params.iter().cloned());
        let (sql, _) = self.checked(&sql, params.len())?;
        self.db.exec(&self.ctx, &sql, &params).await
    }

    /// Delete rows matching the filters.
    pub async fn delete(&self) -> DbResult<ExecResult> {
        let table = self.single_table("delete")?;
        let sql = format!("DELETE FROM {}{}", table, self.where_clause());
        let (sql, params) = self.prepare(sql)?;
        self.db.exec(&self.ctx, &sql, &params).await
    }

    fn projection(&self) -> String {
        if self.columns.is_empty() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        }
    }

    fn select_sql(&self, projection: String) -> DbResult<String> {
        let mut sql = format!(
            "SELECT {} FROM {}{}",
            projection,
            self.from_clause()?,
            self.where_clause()
        );
        if !self.order_by.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.order_by.join(", "));
        }
        match (self.limit, self.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            // SQLite and MySQL reject OFFSET without LIMIT
            (None, Some(offset)) => match self.db.database_type() {
                DatabaseType::PostgreSQL => sql.push_str(&format!(" OFFSET {offset}")),
                DatabaseType::SQLite => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
                DatabaseType::MySQL => {
                    sql.push_str(&format!(" LIMIT 18446744073709551615 OFFSET {offset}"))
                }
            },
            (None, None) => {}
        }
        Ok(sql)
    }

    fn from_clause(&self) -> DbResult<String> {
        if self.tables.is_empty() {
            return Err(DbError::invalid_input("query has no tables"));
        }
        Ok(self
            .tables
            .iter()
            .map(TableRef::to_sql)
            .collect::<Vec<_>>()
            .join(", "))
    }

    fn where_clause(&self) -> String {
        if self.filters.is_empty() {
            return String::new();
        }
        let clauses = self
            .filters
            .iter()
            .map(|clause| format!("({clause})"))
            .collect::<Vec<_>>()
            .join(" AND ");
        format!(" WHERE {clauses}")
    }

    fn single_table(&self, operation: &str) -> DbResult<&str> {
        match self.tables.as_slice() {
            [table] => Ok(table.name()),
            [] => Err(DbError::invalid_input("query has no tables")),
            _ => Err(DbError::invalid_input(format!(
                "{operation} requires exactly one table"
            ))),
        }
    }

    fn prepare(&self, sql: String) -> DbResult<(String, Vec<QueryParam>)> {
        let (sql, _) = self.checked(&sql, self.params.len())?;
        Ok((sql, self.params.clone()))
    }

    fn checked(&self, sql: &str, param_count: usize) -> DbResult<(String, usize)> {
        let (rewritten, placeholders) = rewrite_placeholders(sql, self.db.database_type());
        if placeholders != param_count {
            return Err(DbError::invalid_input(format!(
                "query has {placeholders} placeholders but {param_count} parameters"
            )));
        }
        Ok((rewritten, placeholders))
    }
}

fn deserialize_row<T: DeserializeOwned>(row: JsonRow) -> DbResult<T> {
    serde_json::from_value(JsonValue::Object(row))
        .map_err(|e| DbError::internal(format!("Failed to deserialize row: {e}")))
}

/// Rewrite `?` placeholders to the backend's form. Returns the statement and
/// the number of placeholders found.
///
/// Question marks inside string literals, quoted identifiers and comments are
/// left alone. Every other `?` is a placeholder, so PostgreSQL's jsonb `?`,
/// `?|` and `?&` operators cannot appear in filters; use
/// `jsonb_exists(col, key)` and friends instead.
pub(crate) fn rewrite_placeholders(sql: &str, db_type: DatabaseType) -> (String, usize) {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        Literal,
        Identifier,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(sql.len() + 8);
    let mut count = 0;
    let mut state = State::Code;
    let mut chars = sql.chars().peekable();

    while let Some(ch) = chars.next() {
        match (state, ch) {
            (State::Code, '?') => {
                count += 1;
                out.push_str(&db_type.placeholder(count));
                continue;
            }
            (State::Code, '\'') => state = State::Literal,
            (State::Code, '"') => state = State::Identifier,
            (State::Code, '-') if chars.peek() == Some(&'-') => state = State::LineComment,
            (State::Code, '/') if chars.peek() == Some(&'*') => {
                out.push(ch);
                out.extend(chars.next());
                state = State::BlockComment;
                continue;
            }
            // A doubled quote re-enters the literal on the next character
            (State::Literal, '\'') | (State::Identifier, '"') => state = State::Code,
            (State::LineComment, '\n') => state = State::Code,
            (State::BlockComment, '*') if chars.peek() == Some(&'/') => {
                out.push(ch);
                out.extend(chars.next());
                state = State::Code;
                continue;
            }
            _ => {}
        }
        out.push(ch);
    }
    (out, count)
}
