//! SQL query builder for mapped entities.
//!
//! Builds parameterized SELECT statements with filtering, grouping, sorting
//! and pagination, using `?N` placeholders so values bind in declaration
//! order regardless of clause composition.

use sqlx::SqlitePool;

use super::model::{Model, SqlValue, row_to_json};
use crate::graph::pagination::Connection;

/// A query builder for database entities.
pub struct SelectQuery<E: Model> {
    _phantom: std::marker::PhantomData<E>,
    select_override: Option<String>,
    joins: Vec<String>,
    where_clauses: Vec<String>,
    group_by: Vec<String>,
    values: Vec<SqlValue>,
    order_by: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
    param_counter: usize,
}

impl<E: Model> SelectQuery<E> {
    /// Create a new query builder for the entity type.
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
            select_override: None,
            joins: Vec::new(),
            where_clauses: Vec::new(),
            group_by: Vec::new(),
            values: Vec::new(),
            order_by: None,
            limit: None,
            offset: None,
            param_counter: 0,
        }
    }

    /// Replace the SELECT list (aggregate queries select expressions, not
    /// entity columns).
    pub fn select(mut self, parts: &[String]) -> Self {
        self.select_override = Some(parts.join(", "));
        self
    }

    /// Append a raw JOIN clause.
    pub fn join(mut self, clause: &str) -> Self {
        self.joins.push(clause.to_string());
        self
    }

    /// Add an equality condition. A Null value compiles to IS NULL.
    pub fn where_eq(mut self, column: &str, value: SqlValue) -> Self {
        match value {
            SqlValue::Null => {
                self.where_clauses.push(format!("{} IS NULL", column));
            }
            value => {
                self.param_counter += 1;
                self.where_clauses
                    .push(format!("{} = ?{}", column, self.param_counter));
                self.values.push(value);
            }
        }
        self
    }

    /// Add a set-membership condition. An empty list can never match.
    pub fn where_in(mut self, column: &str, values: Vec<SqlValue>) -> Self {
        if values.is_empty() {
            self.where_clauses.push("1 = 0".to_string());
            return self;
        }

        let mut placeholders = Vec::with_capacity(values.len());
        for _ in &values {
            self.param_counter += 1;
            placeholders.push(format!("?{}", self.param_counter));
        }
        self.where_clauses
            .push(format!("{} IN ({})", column, placeholders.join(", ")));
        self.values.extend(values);
        self
    }

    /// Add a raw WHERE condition with `?` placeholders for `values`.
    pub fn where_raw(mut self, condition: &str, values: Vec<SqlValue>) -> Self {
        let rewritten = self.rewrite_params(condition, values.len());
        self.where_clauses.push(rewritten);
        self.values.extend(values);
        self
    }

    /// Add a GROUP BY column.
    pub fn group_by(mut self, column: &str) -> Self {
        self.group_by.push(column.to_string());
        self
    }

    /// Set the ORDER BY clause.
    pub fn order_by(mut self, column: &str, direction: &str) -> Self {
        self.order_by = Some(format!("{} {}", column, direction));
        self
    }

    /// Add default sorting if no order is specified.
    pub fn default_order(mut self) -> Self {
        if self.order_by.is_none() {
            self.order_by = Some(format!("{} {}", E::DEFAULT_SORT, E::DEFAULT_SORT_DIR));
        }
        self
    }

    /// Set limit directly.
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Set offset directly.
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Rewrite bare `?` placeholders to sequential `?N` indices.
    fn rewrite_params(&mut self, condition: &str, num_new_params: usize) -> String {
        let mut result = condition.to_string();
        for _ in 0..num_new_params {
            self.param_counter += 1;
            let mut search_from = 0;
            while let Some(rel) = result[search_from..].find('?') {
                let pos = search_from + rel;
                // Skip placeholders that are already numbered (e.g. ?1)
                let next_char = result[pos + 1..].chars().next();
                if next_char.is_some_and(|c| c.is_ascii_digit()) {
                    search_from = pos + 1;
                    continue;
                }
                result = format!(
                    "{}?{}{}",
                    &result[..pos],
                    self.param_counter,
                    &result[pos + 1..]
                );
                break;
            }
        }
        result
    }

    /// Build the SQL query string.
    fn build_sql(&self) -> String {
        let mut sql = match &self.select_override {
            Some(select) => format!("SELECT {} FROM {}", select, E::TABLE),
            None => E::select_sql(),
        };

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }

        if !self.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clauses.join(" AND "));
        }

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
        }

        if let Some(ref order) = self.order_by {
            sql.push_str(" ORDER BY ");
            sql.push_str(order);
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }

        if let Some(offset) = self.offset {
            if offset > 0 {
                sql.push_str(&format!(" OFFSET {}", offset));
            }
        }

        sql
    }

    /// Build a COUNT query string. Limit and offset are intentionally absent.
    fn build_count_sql(&self) -> String {
        let mut sql = format!("SELECT COUNT(*) FROM {}", E::TABLE);

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(join);
        }

        if !self.where_clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clauses.join(" AND "));
        }

        sql
    }

    /// Execute the query and return all matching entities.
    pub async fn fetch_all(self, pool: &SqlitePool) -> Result<Vec<E>, sqlx::Error> {
        let sql = self.build_sql();
        tracing::debug!(sql = %sql, "Executing entity query");

        let mut query = sqlx::query(&sql);
        for value in &self.values {
            query = value.bind_to_query(query);
        }

        let rows = query.fetch_all(pool).await?;
        rows.iter().map(E::from_row).collect()
    }

    /// Execute the query and return a single entity.
    pub async fn fetch_one(self, pool: &SqlitePool) -> Result<Option<E>, sqlx::Error> {
        let sql = self.build_sql();
        tracing::debug!(sql = %sql, "Executing entity query (one)");

        let mut query = sqlx::query(&sql);
        for value in &self.values {
            query = value.bind_to_query(query);
        }

        match query.fetch_optional(pool).await? {
            Some(row) => Ok(Some(E::from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Execute a COUNT query reflecting the predicates but not the page.
    pub async fn count(&self, pool: &SqlitePool) -> Result<i64, sqlx::Error> {
        let sql = self.build_count_sql();
        tracing::debug!(sql = %sql, "Executing count query");

        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for value in &self.values {
            // Re-bind values for the count query
            query = match value {
                SqlValue::String(s) => query.bind(s.as_str()),
                SqlValue::Int(i) => query.bind(*i),
                SqlValue::Float(f) => query.bind(*f),
                SqlValue::Bool(b) => query.bind(if *b { 1i32 } else { 0i32 }),
                SqlValue::Null => query.bind(None::<String>),
            };
        }

        query.fetch_one(pool).await
    }

    /// Fetch one page plus the total row count for the same predicates.
    pub async fn fetch_page(
        mut self,
        pool: &SqlitePool,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<E>, i64), sqlx::Error> {
        self.limit = Some(limit);
        self.offset = Some(offset);

        let total = self.count(pool).await?;
        let rows = self.fetch_all(pool).await?;
        Ok((rows, total))
    }

    /// Execute the query and return an offset-cursor connection.
    pub async fn fetch_connection(self, pool: &SqlitePool) -> Result<Connection<E>, sqlx::Error> {
        // Total count first, before limit/offset apply
        let total = self.count(pool).await?;

        let offset = self.offset.unwrap_or(0);
        let limit = self.limit.unwrap_or(25);

        let items = self.fetch_all(pool).await?;

        Ok(Connection::from_items(items, offset, limit, total))
    }

    /// Execute the query and return rows as flat JSON objects.
    pub async fn fetch_json(self, pool: &SqlitePool) -> Result<Vec<serde_json::Value>, sqlx::Error> {
        let sql = self.build_sql();
        tracing::debug!(sql = %sql, "Executing row query");

        let mut query = sqlx::query(&sql);
        for value in &self.values {
            query = value.bind_to_query(query);
        }

        let rows = query.fetch_all(pool).await?;
        rows.iter().map(row_to_json).collect()
    }

    #[cfg(test)]
    pub(crate) fn sql_for_test(&self) -> String {
        self.build_sql()
    }

    #[cfg(test)]
    pub(crate) fn count_sql_for_test(&self) -> String {
        self.build_count_sql()
    }
}

impl<E: Model> Default for SelectQuery<E> {
    fn default() -> Self {
        Self::new()
    }
}
