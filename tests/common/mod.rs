//! Shared fixtures: an in-memory blog schema with typed entities plus a
//! request helper for exercising routers without opening a socket.

#![allow(dead_code)]

use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use tower::ServiceExt;

use gantry::db::{Database, HasForeignKey, Model, SqlValue};
use gantry::loader::BatchItem;

pub const SCHEMA: &str = r#"
CREATE TABLE categories (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    slug TEXT NOT NULL UNIQUE
);

CREATE TABLE posts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    category_id INTEGER REFERENCES categories(id),
    title TEXT NOT NULL,
    content TEXT,
    views INTEGER NOT NULL DEFAULT 0,
    created_at TEXT,
    updated_at TEXT
);

CREATE TABLE comments (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    post_id INTEGER NOT NULL REFERENCES posts(id),
    author TEXT NOT NULL,
    body TEXT NOT NULL
);
"#;

/// Fresh in-memory database with the blog schema applied.
pub async fn blog_db() -> Database {
    let db = Database::connect_in_memory().await.unwrap();
    sqlx::raw_sql(SCHEMA).execute(db.pool()).await.unwrap();
    db
}

/// Two categories, four posts, three comments.
pub async fn seed_blog(db: &Database) {
    sqlx::raw_sql(
        r#"
INSERT INTO categories (name, slug) VALUES ('General', 'general'), ('Rust', 'rust');

INSERT INTO posts (category_id, title, content, views) VALUES
    (1, 'Hello world', 'intro post', 10),
    (1, 'Rust tips', 'about the borrow checker', 50),
    (2, 'Async patterns', NULL, 30),
    (NULL, 'Drafts', 'unpublished', 0);

INSERT INTO comments (post_id, author, body) VALUES
    (1, 'alice', 'Nice post'),
    (1, 'bob', 'Thanks for writing this'),
    (2, 'alice', 'Great tips');
"#,
    )
    .execute(db.pool())
    .await
    .unwrap();
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

impl Model for Category {
    const TABLE: &'static str = "categories";
    const DEFAULT_SORT: &'static str = "id";

    fn columns() -> &'static [&'static str] {
        &["id", "name", "slug"]
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            slug: row.try_get("slug")?,
        })
    }

    fn id_value(&self) -> SqlValue {
        SqlValue::Int(self.id)
    }
}

impl BatchItem for Category {
    fn batch_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Post {
    pub id: i64,
    pub category_id: Option<i64>,
    pub title: String,
    pub content: Option<String>,
    pub views: i64,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

impl Model for Post {
    const TABLE: &'static str = "posts";
    const DEFAULT_SORT: &'static str = "id";

    fn columns() -> &'static [&'static str] {
        &[
            "id",
            "category_id",
            "title",
            "content",
            "views",
            "created_at",
            "updated_at",
        ]
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            category_id: row.try_get("category_id")?,
            title: row.try_get("title")?,
            content: row.try_get("content")?,
            views: row.try_get("views")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn id_value(&self) -> SqlValue {
        SqlValue::Int(self.id)
    }
}

impl HasForeignKey for Post {
    fn fk_value(&self, fk_column: &str) -> Option<SqlValue> {
        match fk_column {
            "category_id" => Some(match self.category_id {
                Some(id) => SqlValue::Int(id),
                None => SqlValue::Null,
            }),
            _ => None,
        }
    }
}

impl BatchItem for Post {
    fn batch_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Comment {
    pub id: i64,
    pub post_id: i64,
    pub author: String,
    pub body: String,
}

impl Model for Comment {
    const TABLE: &'static str = "comments";
    const DEFAULT_SORT: &'static str = "id";

    fn columns() -> &'static [&'static str] {
        &["id", "post_id", "author", "body"]
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        Ok(Self {
            id: row.try_get("id")?,
            post_id: row.try_get("post_id")?,
            author: row.try_get("author")?,
            body: row.try_get("body")?,
        })
    }

    fn id_value(&self) -> SqlValue {
        SqlValue::Int(self.id)
    }
}

impl HasForeignKey for Comment {
    fn fk_value(&self, fk_column: &str) -> Option<SqlValue> {
        match fk_column {
            "post_id" => Some(SqlValue::Int(self.post_id)),
            _ => None,
        }
    }
}

impl BatchItem for Comment {
    fn batch_id(&self) -> String {
        self.id.to_string()
    }
}

/// Drive one request through the router and decode the JSON response.
pub async fn api_call(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if body.is_some() {
        builder = builder.header("content-type", "application/json");
    }
    let body = match body {
        Some(value) => Body::from(serde_json::to_string(&value).unwrap()),
        None => Body::empty(),
    };

    let request = builder.body(body).unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();

    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, headers, json)
}

/// Percent-encode a query component.
pub fn urlencode(raw: &str) -> String {
    urlencoding::encode(raw).into_owned()
}

/// The ids of a JSON array of rows, in response order.
pub fn ids(rows: &Value) -> Vec<i64> {
    rows.as_array()
        .expect("expected a JSON array body")
        .iter()
        .map(|row| row["id"].as_i64().expect("row id"))
        .collect()
}
