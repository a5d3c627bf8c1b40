//! Entity metadata and row decoding for the relational layer.
//!
//! A [`Model`] describes one mapped table: its name, key column, default
//! ordering and column list, plus how to decode a row into the entity type.
//! Route builders, the query builder and the relation loaders are all generic
//! over this trait.

use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// Metadata about a mapped table.
pub trait Model: Sized + Clone + Send + Sync + serde::Serialize {
    /// The SQL table name (e.g. "posts")
    const TABLE: &'static str;

    /// The primary key column name
    const ID_COLUMN: &'static str = "id";

    /// Default sort column for list queries
    const DEFAULT_SORT: &'static str;

    /// Default sort direction
    const DEFAULT_SORT_DIR: &'static str = "ASC";

    /// List of all column names in the table
    fn columns() -> &'static [&'static str];

    /// Build a SELECT query for all columns
    fn select_sql() -> String {
        let columns = Self::columns().join(", ");
        format!("SELECT {} FROM {}", columns, Self::TABLE)
    }

    /// Decode a row into this entity type
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error>;

    /// Primary key value of this entity
    fn id_value(&self) -> SqlValue;
}

/// Trait for entities that expose foreign key columns.
///
/// Used by the relation loaders to partition batch-loaded child rows back
/// onto their parents.
pub trait HasForeignKey {
    /// Get the value of a foreign key column.
    /// Returns None if the column doesn't exist on this entity.
    fn fk_value(&self, fk_column: &str) -> Option<SqlValue>;
}

/// Represents a SQL value that can be bound to a query.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl SqlValue {
    /// Bind this value to a sqlx query builder at the next parameter index
    pub fn bind_to_query<'q>(
        &'q self,
        query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    ) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
        match self {
            SqlValue::String(s) => query.bind(s.as_str()),
            SqlValue::Int(i) => query.bind(*i),
            SqlValue::Float(f) => query.bind(*f),
            SqlValue::Bool(b) => query.bind(if *b { 1i32 } else { 0i32 }),
            SqlValue::Null => query.bind(None::<String>),
        }
    }

    /// Convert a JSON scalar into a bindable value.
    ///
    /// Arrays and objects have no SQL scalar form and come back as None.
    pub fn from_json(value: &serde_json::Value) -> Option<SqlValue> {
        match value {
            serde_json::Value::Null => Some(SqlValue::Null),
            serde_json::Value::Bool(b) => Some(SqlValue::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(SqlValue::Int(i)),
                None => n.as_f64().map(SqlValue::Float),
            },
            serde_json::Value::String(s) => Some(SqlValue::String(s.clone())),
            _ => None,
        }
    }

    /// Stable string form, used to match child foreign keys back to parents.
    pub fn key(&self) -> String {
        match self {
            SqlValue::String(s) => s.clone(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Bool(b) => (*b as i64).to_string(),
            SqlValue::Null => String::new(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::String(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::String(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Int(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

/// Decode a row into a flat JSON object keyed by column name.
///
/// Used where rows do not hydrate into a typed entity (aggregate results).
pub fn row_to_json(row: &SqliteRow) -> Result<serde_json::Value, sqlx::Error> {
    let mut out = serde_json::Map::new();

    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i)?;
        let value = if raw.is_null() {
            serde_json::Value::Null
        } else {
            match raw.type_info().name() {
                "INTEGER" => serde_json::Value::from(row.try_get::<i64, _>(i)?),
                "REAL" => serde_json::Value::from(row.try_get::<f64, _>(i)?),
                // BLOB columns have no JSON representation
                "BLOB" => serde_json::Value::Null,
                _ => serde_json::Value::from(row.try_get::<String, _>(i)?),
            }
        };
        out.insert(column.name().to_string(), value);
    }

    Ok(serde_json::Value::Object(out))
}
