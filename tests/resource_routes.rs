//! End-to-end tests for the resource routes:
//! - CRUD statuses and response bodies
//! - body validation against declared fields
//! - filter, search, sort and pagination on list routes
//! - nested mounting with parent scoping
//! - the error envelope, health endpoints and the `/_specs` report

mod common;

use std::sync::{Arc, Mutex};

use axum::http::StatusCode;
use axum::Router;
use regex::Regex;
use serde_json::{json, Value};

use gantry::db::Database;
use gantry::router::{FilterContext, PageDefaults, ResourceRouter};
use gantry::{App, FieldSpec, IdPattern, ListOptions, ResourceSpec, SqlValue};

use common::{api_call, blog_db, ids, seed_blog, urlencode, Category, Comment, Post};

fn blog_app(db: &Database) -> Router {
    let posts = ResourceRouter::new(
        db.clone(),
        ResourceSpec::<Post>::default().timestamps().fields(vec![
            FieldSpec::required("title"),
            FieldSpec::optional("content"),
            FieldSpec::optional("category_id"),
            FieldSpec::optional("views"),
        ]),
    )
    .crud(
        ListOptions::new()
            .sortable(&["id", "views", "title"])
            .searchable(&["title", "content"])
            .filter_field("category_id")
            .filter_field("views"),
    )
    .children(
        ResourceRouter::new(db.clone(), ResourceSpec::<Comment>::default()).crud(
            ListOptions::new()
                .sortable(&["id"])
                .filter_field("author"),
        ),
    );

    let categories = ResourceRouter::new(
        db.clone(),
        ResourceSpec::<Category>::default()
            .id_attribute("slug")
            .id_pattern(IdPattern::Pattern(Regex::new("^[a-z0-9-]+$").unwrap())),
    )
    .read(ListOptions::new().sortable(&["id"]));

    App::new(db.clone())
        .resource(posts)
        .resource(categories)
        .build()
}

async fn setup() -> Router {
    let db = blog_db().await;
    seed_blog(&db).await;
    blog_app(&db)
}

fn content_range(headers: &axum::http::HeaderMap) -> &str {
    headers
        .get("content-range")
        .expect("Content-Range header")
        .to_str()
        .unwrap()
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn test_create_responds_201_with_stored_entity() {
    let app = setup().await;

    let (status, _, body) = api_call(
        &app,
        "POST",
        "/posts",
        Some(json!({ "title": "Fresh", "views": 7 })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["id"], json!(5));
    assert_eq!(body["title"], json!("Fresh"));
    assert_eq!(body["views"], json!(7));
    // timestamps are maintained by the resource
    assert!(body["created_at"].is_string());
    assert!(body["updated_at"].is_string());
}

#[tokio::test]
async fn test_create_missing_required_field_is_422() {
    let app = setup().await;

    let (status, _, body) =
        api_call(&app, "POST", "/posts", Some(json!({ "content": "x" }))).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body,
        json!({
            "status": 422,
            "name": "ValidationError",
            "message": "title is required",
        })
    );
}

#[tokio::test]
async fn test_create_unknown_field_is_422() {
    let app = setup().await;

    let (status, _, body) =
        api_call(&app, "POST", "/posts", Some(json!({ "bogus": 1 }))).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(
        body["message"],
        json!("bogus is not a writable field; title is required")
    );
}

#[tokio::test]
async fn test_create_rejects_non_object_body() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "POST", "/posts", Some(json!([1, 2]))).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["message"], json!("request body must be a JSON object"));
}

#[tokio::test]
async fn test_create_duplicate_unique_value_is_409() {
    let db = blog_db().await;
    seed_blog(&db).await;
    let categories =
        ResourceRouter::new(db.clone(), ResourceSpec::<Category>::default()).create();
    let app = App::new(db.clone()).resource(categories).build();

    let (status, _, body) = api_call(
        &app,
        "POST",
        "/categories",
        Some(json!({ "name": "Copy", "slug": "general" })),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["status"], json!(409));
    assert_eq!(body["name"], json!("ConflictError"));
}

// ============================================================================
// List: pagination, filters, search, sort
// ============================================================================

#[tokio::test]
async fn test_list_returns_rows_and_total_header() {
    let app = setup().await;

    let (status, headers, body) = api_call(&app, "GET", "/posts", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body), vec![1, 2, 3, 4]);
    assert_eq!(content_range(&headers), "items 0-3/4");
}

#[tokio::test]
async fn test_list_pagination_window() {
    let app = setup().await;

    let (status, headers, body) =
        api_call(&app, "GET", "/posts?sort=id&limit=2&offset=1", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body), vec![2, 3]);
    assert_eq!(content_range(&headers), "items 1-2/4");
}

#[tokio::test]
async fn test_list_beyond_last_page_is_empty() {
    let app = setup().await;

    let (status, headers, body) = api_call(&app, "GET", "/posts?offset=10", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
    assert_eq!(content_range(&headers), "items */4");
}

#[tokio::test]
async fn test_list_page_defaults_and_cap() {
    let db = blog_db().await;
    seed_blog(&db).await;
    let posts = ResourceRouter::new(
        db.clone(),
        ResourceSpec::<Post>::default().page(PageDefaults {
            per_page: 2,
            max_per_page: 3,
        }),
    )
    .list(ListOptions::new().sortable(&["id"]));
    let app = App::new(db.clone()).resource(posts).build();

    let (_, _, body) = api_call(&app, "GET", "/posts", None).await;
    assert_eq!(ids(&body), vec![1, 2]);

    let (_, _, body) = api_call(&app, "GET", "/posts?limit=50", None).await;
    assert_eq!(ids(&body), vec![1, 2, 3]);
}

#[tokio::test]
async fn test_list_sort_directions() {
    let app = setup().await;

    let (_, _, body) = api_call(&app, "GET", "/posts?sort=-views", None).await;
    assert_eq!(ids(&body), vec![2, 3, 1, 4]);

    let (_, _, body) = api_call(&app, "GET", "/posts?sort=views", None).await;
    assert_eq!(ids(&body), vec![4, 1, 3, 2]);
}

#[tokio::test]
async fn test_list_sort_outside_allow_list_is_ignored() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "GET", "/posts?sort=secret", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn test_list_sort_by_creation_time() {
    let db = blog_db().await;
    seed_blog(&db).await;
    // creation times deliberately disagree with id order
    sqlx::raw_sql(
        r#"
UPDATE posts SET created_at = '2024-03-01T00:00:00Z' WHERE id = 1;
UPDATE posts SET created_at = '2024-01-01T00:00:00Z' WHERE id = 2;
UPDATE posts SET created_at = '2024-04-01T00:00:00Z' WHERE id = 3;
UPDATE posts SET created_at = '2024-02-01T00:00:00Z' WHERE id = 4;
"#,
    )
    .execute(db.pool())
    .await
    .unwrap();

    let posts = ResourceRouter::new(db.clone(), ResourceSpec::<Post>::default())
        .list(ListOptions::new().sortable(&["id", "created_at"]));
    let app = App::new(db.clone()).resource(posts).build();

    let (_, _, body) = api_call(&app, "GET", "/posts?sort=created_at", None).await;
    assert_eq!(ids(&body), vec![2, 4, 1, 3]);

    let (_, _, body) = api_call(&app, "GET", "/posts?sort=-created_at", None).await;
    assert_eq!(ids(&body), vec![3, 1, 4, 2]);
}

#[tokio::test]
async fn test_list_filter_equality() {
    let app = setup().await;

    let uri = format!("/posts?filters={}", urlencode(r#"{"category_id":1}"#));
    let (_, _, body) = api_call(&app, "GET", &uri, None).await;

    assert_eq!(ids(&body), vec![1, 2]);
}

#[tokio::test]
async fn test_list_filter_membership() {
    let app = setup().await;

    let uri = format!("/posts?filters={}", urlencode(r#"{"views":[10,30]}"#));
    let (_, _, body) = api_call(&app, "GET", &uri, None).await;

    assert_eq!(ids(&body), vec![1, 3]);
}

#[tokio::test]
async fn test_list_filter_null_matches_missing_value() {
    let app = setup().await;

    let uri = format!("/posts?filters={}", urlencode(r#"{"category_id":null}"#));
    let (_, _, body) = api_call(&app, "GET", &uri, None).await;

    assert_eq!(ids(&body), vec![4]);
}

#[tokio::test]
async fn test_list_malformed_filters_are_ignored() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "GET", "/posts?filters=not-json", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_list_undeclared_filter_key_is_ignored() {
    let app = setup().await;

    // title is a column but not a declared filter rule
    let uri = format!("/posts?filters={}", urlencode(r#"{"title":"Drafts"}"#));
    let (_, _, body) = api_call(&app, "GET", &uri, None).await;

    assert_eq!(ids(&body), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_list_custom_filter_rule() {
    let db = blog_db().await;
    seed_blog(&db).await;

    // min_views is not a column; the rule turns it into a range predicate
    let posts = ResourceRouter::new(db.clone(), ResourceSpec::<Post>::default()).list(
        ListOptions::new().sortable(&["id"]).filter_with(
            |ctx: &mut FilterContext<'_, Post>| {
                ctx.filter("category_id");
                if let Some(min) = ctx.filters.get("min_views").and_then(Value::as_i64) {
                    let query = std::mem::take(&mut ctx.query);
                    ctx.query = query.where_raw("views >= ?", vec![SqlValue::Int(min)]);
                }
            },
        ),
    );
    let app = App::new(db.clone()).resource(posts).build();

    let uri = format!("/posts?filters={}", urlencode(r#"{"min_views":20}"#));
    let (_, _, body) = api_call(&app, "GET", &uri, None).await;
    assert_eq!(ids(&body), vec![2, 3]);

    let uri = format!(
        "/posts?filters={}",
        urlencode(r#"{"min_views":20,"category_id":1}"#)
    );
    let (_, _, body) = api_call(&app, "GET", &uri, None).await;
    assert_eq!(ids(&body), vec![2]);
}

#[tokio::test]
async fn test_list_search_is_case_insensitive() {
    let app = setup().await;

    let (_, _, body) = api_call(&app, "GET", "/posts?q=rust", None).await;
    assert_eq!(ids(&body), vec![2]);

    let (_, _, body) = api_call(&app, "GET", "/posts?q=RUST", None).await;
    assert_eq!(ids(&body), vec![2]);
}

#[tokio::test]
async fn test_list_search_covers_all_declared_columns() {
    let app = setup().await;

    // "intro" only appears in a content column
    let (_, _, body) = api_call(&app, "GET", "/posts?q=intro", None).await;
    assert_eq!(ids(&body), vec![1]);
}

#[tokio::test]
async fn test_list_search_miss_is_an_empty_page() {
    let app = setup().await;

    let (status, headers, body) = api_call(&app, "GET", "/posts?q=quantum", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
    assert_eq!(content_range(&headers), "items */0");
}

// ============================================================================
// Item
// ============================================================================

#[tokio::test]
async fn test_item_fetches_by_id() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "GET", "/posts/3", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!(3));
    assert_eq!(body["title"], json!("Async patterns"));
    assert_eq!(body["content"], json!(null));
}

#[tokio::test]
async fn test_item_missing_is_404_with_envelope() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "GET", "/posts/999", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        body,
        json!({
            "status": 404,
            "name": "NotFoundError",
            "message": "resource not found",
        })
    );
}

#[tokio::test]
async fn test_item_segment_outside_id_pattern_is_404() {
    let app = setup().await;

    let (status, _, _) = api_call(&app, "GET", "/posts/abc", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_item_by_slug_attribute() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "GET", "/categories/rust", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!(2));

    // pattern rejects uppercase before the database is consulted
    let (status, _, _) = api_call(&app, "GET", "/categories/RUST", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = api_call(&app, "GET", "/categories/missing-slug", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Update and destroy
// ============================================================================

#[tokio::test]
async fn test_update_patches_and_responds_202() {
    let app = setup().await;

    let (status, _, body) = api_call(
        &app,
        "PATCH",
        "/posts/1",
        Some(json!({ "title": "Hello again" })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["title"], json!("Hello again"));
    // untouched fields survive a partial save
    assert_eq!(body["content"], json!("intro post"));
    assert_eq!(body["views"], json!(10));
    // timestamp maintenance only bumps updated_at
    assert_eq!(body["created_at"], json!(null));
    assert!(body["updated_at"].is_string());
}

#[tokio::test]
async fn test_update_accepts_put_as_well() {
    let app = setup().await;

    let (status, _, body) = api_call(
        &app,
        "PUT",
        "/posts/2",
        Some(json!({ "views": 51 })),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["views"], json!(51));
}

#[tokio::test]
async fn test_update_unknown_field_is_422() {
    let app = setup().await;

    let (status, _, _) = api_call(
        &app,
        "PATCH",
        "/posts/1",
        Some(json!({ "bogus": true })),
    )
    .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_update_missing_row_is_404() {
    let app = setup().await;

    let (status, _, _) = api_call(
        &app,
        "PATCH",
        "/posts/999",
        Some(json!({ "title": "x" })),
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_destroy_responds_204_and_removes_the_row() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "DELETE", "/posts/4", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(body, Value::Null);

    let (status, _, _) = api_call(&app, "GET", "/posts/4", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_update_and_destroy_hooks_observe_the_row() {
    let db = blog_db().await;
    seed_blog(&db).await;

    let updated = Arc::new(Mutex::new(Vec::<String>::new()));
    let destroyed = Arc::new(Mutex::new(Vec::<String>::new()));

    let update_sink = updated.clone();
    let destroy_sink = destroyed.clone();
    let posts = ResourceRouter::new(db.clone(), ResourceSpec::<Post>::default())
        .update_with(move |post: Post| {
            let sink = update_sink.clone();
            async move {
                sink.lock().unwrap().push(post.title.clone());
                Ok(())
            }
        })
        .destroy_with(move |snapshot: Value| {
            let sink = destroy_sink.clone();
            async move {
                sink.lock()
                    .unwrap()
                    .push(snapshot["title"].as_str().unwrap_or_default().to_string());
                Ok(())
            }
        });
    let app = App::new(db.clone()).resource(posts).build();

    let (status, _, _) = api_call(
        &app,
        "PATCH",
        "/posts/1",
        Some(json!({ "title": "Edited" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, _, _) = api_call(&app, "DELETE", "/posts/2", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    assert_eq!(*updated.lock().unwrap(), vec!["Edited".to_string()]);
    assert_eq!(*destroyed.lock().unwrap(), vec!["Rust tips".to_string()]);
}

// ============================================================================
// Nested resources
// ============================================================================

#[tokio::test]
async fn test_nested_list_scopes_to_parent() {
    let app = setup().await;

    let (status, headers, body) = api_call(&app, "GET", "/posts/1/comments", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(ids(&body), vec![1, 2]);
    assert_eq!(content_range(&headers), "items 0-1/2");

    let (_, _, body) = api_call(&app, "GET", "/posts/2/comments", None).await;
    assert_eq!(ids(&body), vec![3]);
}

#[tokio::test]
async fn test_nested_missing_parent_is_404() {
    let app = setup().await;

    let (status, _, _) = api_call(&app, "GET", "/posts/999/comments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = api_call(&app, "GET", "/posts/abc/comments", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_nested_create_injects_parent_foreign_key() {
    let app = setup().await;

    // a body-supplied foreign key cannot escape the route scope
    let (status, _, body) = api_call(
        &app,
        "POST",
        "/posts/2/comments",
        Some(json!({ "author": "eve", "body": "hi", "post_id": 1 })),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["post_id"], json!(2));
    assert_eq!(body["author"], json!("eve"));
}

#[tokio::test]
async fn test_nested_item_cannot_cross_parents() {
    let app = setup().await;

    // comment 1 belongs to post 1
    let (status, _, _) = api_call(&app, "GET", "/posts/2/comments/1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = api_call(&app, "GET", "/posts/1/comments/1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["author"], json!("alice"));
}

#[tokio::test]
async fn test_nested_update_and_destroy_stay_scoped() {
    let app = setup().await;

    // comment 3 belongs to post 2
    let (status, _, _) = api_call(
        &app,
        "PATCH",
        "/posts/1/comments/3",
        Some(json!({ "body": "edited" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = api_call(&app, "DELETE", "/posts/1/comments/3", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = api_call(&app, "DELETE", "/posts/2/comments/3", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_nested_filters_apply_within_scope() {
    let app = setup().await;

    let uri = format!(
        "/posts/1/comments?filters={}",
        urlencode(r#"{"author":"alice"}"#)
    );
    let (_, _, body) = api_call(&app, "GET", &uri, None).await;

    assert_eq!(ids(&body), vec![1]);
}

// ============================================================================
// Registration behavior
// ============================================================================

#[tokio::test]
async fn test_repeated_capability_calls_register_once() {
    let db = blog_db().await;
    seed_blog(&db).await;

    // the second list() must not panic on a duplicate route
    let posts = ResourceRouter::new(db.clone(), ResourceSpec::<Post>::default())
        .list(ListOptions::new().sortable(&["id"]))
        .list(ListOptions::new());
    let app = App::new(db.clone()).resource(posts).build();

    let (status, _, body) = api_call(&app, "GET", "/posts", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 4);
}

// ============================================================================
// Service endpoints
// ============================================================================

#[tokio::test]
async fn test_specs_reports_registered_routes() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "GET", "/_specs", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["/posts"], json!(["POST", "GET"]));
    assert_eq!(
        body["/posts/{post_id}"],
        json!(["GET", "PUT", "PATCH", "DELETE"])
    );
    assert_eq!(body["/posts/{post_id}/comments"], json!(["POST", "GET"]));
    assert_eq!(
        body["/posts/{post_id}/comments/{comment_id}"],
        json!(["GET", "PUT", "PATCH", "DELETE"])
    );
    assert_eq!(body["/categories"], json!(["GET"]));
    assert_eq!(body["/categories/{category_slug}"], json!(["GET"]));
}

#[tokio::test]
async fn test_healthz_and_readyz() {
    let app = setup().await;

    let (status, _, body) = api_call(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("healthy"));

    let (status, _, body) = api_call(&app, "GET", "/readyz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "ready": true, "database": true }));
}
