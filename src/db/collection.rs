//! Collection handles: one entity table bound to a database, optionally
//! scoped to a parent row.
//!
//! A scope is a `(fk_column, parent_id)` pair. It is applied to every read
//! through `query()` and injected on create, which is what makes nested
//! resource routes parent-safe without per-handler bookkeeping.

use serde_json::{Map, Value};

use super::model::{Model, SqlValue};
use super::query::SelectQuery;
use super::Database;
use crate::error::{ApiError, ApiResult};

#[derive(Clone)]
pub struct Collection<E: Model> {
    db: Database,
    scope: Option<(String, SqlValue)>,
    timestamps: bool,
    _phantom: std::marker::PhantomData<E>,
}

impl<E: Model> Collection<E> {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            scope: None,
            timestamps: false,
            _phantom: std::marker::PhantomData,
        }
    }

    /// Scope every operation to rows whose `fk_column` equals `parent_id`.
    pub fn scoped(mut self, fk_column: impl Into<String>, parent_id: SqlValue) -> Self {
        self.scope = Some((fk_column.into(), parent_id));
        self
    }

    /// Maintain `created_at` / `updated_at` on writes.
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Start a SELECT with the collection scope already applied.
    pub fn query(&self) -> SelectQuery<E> {
        let query = SelectQuery::new();
        match &self.scope {
            Some((fk, parent)) => query.where_eq(fk, parent.clone()),
            None => query,
        }
    }

    pub async fn fetch_by_id(&self, id: &SqlValue) -> ApiResult<Option<E>> {
        self.fetch_one_by(E::ID_COLUMN, id).await
    }

    /// Fetch-by-id with required semantics.
    pub async fn fetch_required(&self, id: &SqlValue) -> ApiResult<E> {
        self.fetch_required_by(E::ID_COLUMN, id).await
    }

    /// Fetch a single row where `column` equals `value`, within scope.
    ///
    /// Routes use this for lookups by a configured id attribute such as
    /// `slug`, where the URL segment is not the primary key.
    pub async fn fetch_one_by(&self, column: &str, value: &SqlValue) -> ApiResult<Option<E>> {
        let row = self
            .query()
            .where_eq(column, value.clone())
            .fetch_one(self.db.pool())
            .await?;
        Ok(row)
    }

    pub async fn fetch_required_by(&self, column: &str, value: &SqlValue) -> ApiResult<E> {
        self.fetch_one_by(column, value).await?.ok_or(ApiError::NotFound)
    }

    /// Insert a row from a JSON attribute map and return the stored entity.
    pub async fn create(&self, attrs: &Map<String, Value>) -> ApiResult<E> {
        let (mut columns, mut values) = Self::scalar_pairs(attrs)?;

        if let Some((fk, parent)) = &self.scope {
            match columns.iter().position(|c| c == fk) {
                // The route scope overrides a body-supplied foreign key
                Some(idx) => values[idx] = parent.clone(),
                None => {
                    columns.push(fk.clone());
                    values.push(parent.clone());
                }
            }
        }

        if self.timestamps {
            let now = now_timestamp();
            for column in ["created_at", "updated_at"] {
                if !columns.iter().any(|c| c == column) {
                    columns.push(column.to_string());
                    values.push(SqlValue::String(now.clone()));
                }
            }
        }

        let sql = if columns.is_empty() {
            format!(
                "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                E::TABLE,
                E::columns().join(", ")
            )
        } else {
            let placeholders: Vec<String> =
                (1..=values.len()).map(|i| format!("?{}", i)).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING {}",
                E::TABLE,
                columns.join(", "),
                placeholders.join(", "),
                E::columns().join(", ")
            )
        };
        tracing::debug!(sql = %sql, "Executing insert");

        let mut query = sqlx::query(&sql);
        for value in &values {
            query = value.bind_to_query(query);
        }

        let row = query.fetch_one(self.db.pool()).await?;
        Ok(E::from_row(&row)?)
    }

    /// Update only the supplied fields and return the stored entity.
    pub async fn save_patch(&self, id: &SqlValue, attrs: &Map<String, Value>) -> ApiResult<E> {
        let (columns, mut values) = Self::scalar_pairs(attrs)?;

        let mut assignments: Vec<String> = columns
            .iter()
            .enumerate()
            .map(|(i, column)| format!("{} = ?{}", column, i + 1))
            .collect();

        if self.timestamps && !columns.iter().any(|c| c == "updated_at") {
            assignments.push(format!("updated_at = ?{}", values.len() + 1));
            values.push(SqlValue::String(now_timestamp()));
        }

        if assignments.is_empty() {
            // Nothing to change: behave like a required fetch
            return self.fetch_required(id).await;
        }

        let mut sql = format!(
            "UPDATE {} SET {} WHERE {} = ?{}",
            E::TABLE,
            assignments.join(", "),
            E::ID_COLUMN,
            values.len() + 1
        );
        values.push(id.clone());

        if let Some((fk, parent)) = &self.scope {
            sql.push_str(&format!(" AND {} = ?{}", fk, values.len() + 1));
            values.push(parent.clone());
        }

        sql.push_str(&format!(" RETURNING {}", E::columns().join(", ")));
        tracing::debug!(sql = %sql, "Executing update");

        let mut query = sqlx::query(&sql);
        for value in &values {
            query = value.bind_to_query(query);
        }

        match query.fetch_optional(self.db.pool()).await? {
            Some(row) => Ok(E::from_row(&row)?),
            None => Err(ApiError::NotFound),
        }
    }

    /// Delete a row by id within the collection scope.
    pub async fn destroy(&self, id: &SqlValue) -> ApiResult<()> {
        let mut sql = format!("DELETE FROM {} WHERE {} = ?1", E::TABLE, E::ID_COLUMN);
        let mut values = vec![id.clone()];

        if let Some((fk, parent)) = &self.scope {
            sql.push_str(&format!(" AND {} = ?2", fk));
            values.push(parent.clone());
        }
        tracing::debug!(sql = %sql, "Executing delete");

        let mut query = sqlx::query(&sql);
        for value in &values {
            query = value.bind_to_query(query);
        }

        let result = query.execute(self.db.pool()).await?;
        if result.rows_affected() == 0 {
            return Err(ApiError::NotFound);
        }
        Ok(())
    }

    fn scalar_pairs(attrs: &Map<String, Value>) -> ApiResult<(Vec<String>, Vec<SqlValue>)> {
        let mut columns = Vec::with_capacity(attrs.len());
        let mut values = Vec::with_capacity(attrs.len());

        for (key, value) in attrs {
            let value = SqlValue::from_json(value).ok_or_else(|| {
                ApiError::validation(format!("{} must be a scalar value", key))
            })?;
            columns.push(key.clone());
            values.push(value);
        }

        Ok((columns, values))
    }
}

fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
