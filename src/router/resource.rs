//! Declarative CRUD routes for one entity table.
//!
//! A [`ResourceSpec`] describes the resource (route name, id attribute and
//! pattern, writable fields, collection accessor) and a [`ResourceRouter`]
//! turns it into axum routes. Capabilities are opt-in: `create`, `read`,
//! `update` and `destroy` each register their routes once, `crud` registers
//! all of them, and `children` nests another resource under the item path
//! with the parent resolved up front.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, Query, Request};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::Regex;
use serde_json::{Map, Value};

use crate::db::{Collection, Database, Model, SqlValue};
use crate::error::{ApiError, ApiResult};

use super::pipeline::{apply_filters, apply_search, apply_sort, ListOptions};
use super::{
    default_collection, parse_filters, singularize, CollectionFn, ListParams, Nested,
    NestedParent, PageDefaults, ParentScope, RequestScope, RouteSpec,
};

/// Accepted shapes for the id path segment.
///
/// Routes validate the raw segment themselves, so a mismatch is a plain 404
/// rather than an unrouted path.
#[derive(Debug, Clone)]
pub enum IdPattern {
    /// Decimal integers, bound as SQL integers.
    Numeric,
    /// RFC 4122 UUIDs in their canonical hyphenated form.
    Uuid,
    /// Any segment matching the given expression, bound as text.
    Pattern(Regex),
}

impl IdPattern {
    /// Validate a raw path segment and convert it to a bindable value.
    pub fn parse(&self, raw: &str) -> Option<SqlValue> {
        match self {
            IdPattern::Numeric => raw.parse::<i64>().ok().map(SqlValue::Int),
            IdPattern::Uuid => uuid::Uuid::parse_str(raw)
                .ok()
                .map(|id| SqlValue::String(id.to_string())),
            IdPattern::Pattern(pattern) => pattern
                .is_match(raw)
                .then(|| SqlValue::String(raw.to_string())),
        }
    }
}

/// One writable body field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    pub fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// Runs after a successful update with the stored entity.
pub type AfterUpdate<E> = Arc<dyn Fn(E) -> BoxFuture<'static, ApiResult<()>> + Send + Sync>;

/// Runs after a successful destroy with a snapshot of the deleted row.
pub type AfterDestroy = Arc<dyn Fn(Value) -> BoxFuture<'static, ApiResult<()>> + Send + Sync>;

/// Everything a resource's routes need to know about the entity.
pub struct ResourceSpec<E: Model> {
    name: String,
    singular: String,
    id_attribute: String,
    id_pattern: IdPattern,
    fields: Vec<FieldSpec>,
    timestamps: bool,
    page: PageDefaults,
    collection: CollectionFn<E>,
}

impl<E: Model + 'static> Default for ResourceSpec<E> {
    /// A spec named after the entity's table with numeric ids.
    fn default() -> Self {
        Self::new(E::TABLE)
    }
}

impl<E: Model + 'static> ResourceSpec<E> {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let singular = singularize(&name);
        Self {
            name,
            singular,
            id_attribute: E::ID_COLUMN.to_string(),
            id_pattern: IdPattern::Numeric,
            fields: Vec::new(),
            timestamps: false,
            page: PageDefaults::default(),
            collection: default_collection::<E>(),
        }
    }

    /// Override the derived singular name, which drives the nested path
    /// parameter and the `{singular}_id` foreign key.
    pub fn singular(mut self, singular: impl Into<String>) -> Self {
        self.singular = singular.into();
        self
    }

    /// Look items up by this column instead of the primary key.
    pub fn id_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.id_attribute = attribute.into();
        self
    }

    pub fn id_pattern(mut self, pattern: IdPattern) -> Self {
        self.id_pattern = pattern;
        self
    }

    /// Declare the writable fields. An empty declaration leaves every
    /// column writable and nothing required.
    pub fn fields(mut self, fields: Vec<FieldSpec>) -> Self {
        self.fields = fields;
        self
    }

    /// Maintain `created_at` / `updated_at` on writes.
    pub fn timestamps(mut self) -> Self {
        self.timestamps = true;
        self
    }

    pub fn page(mut self, page: PageDefaults) -> Self {
        self.page = page;
        self
    }

    /// Replace the default collection accessor. The accessor takes over
    /// scoping entirely, including any resolved parent.
    pub fn collection_with(
        mut self,
        accessor: impl for<'a> Fn(&RequestScope<'a>) -> Collection<E> + Send + Sync + 'static,
    ) -> Self {
        self.collection = Arc::new(accessor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn singular_name(&self) -> &str {
        &self.singular
    }

    /// Route path of the list endpoint, e.g. `/posts`.
    pub fn base_path(&self) -> String {
        format!("/{}", self.name)
    }

    /// Path parameter holding the id segment, e.g. `post_id` or
    /// `category_slug`.
    ///
    /// Item routes and child mounts share this name, so nesting at any
    /// depth keeps every parameter distinct.
    pub fn item_param(&self) -> String {
        format!("{}_{}", self.singular, self.id_attribute)
    }

    /// Route path of the item endpoint, e.g. `/posts/{post_id}`.
    pub fn item_path(&self) -> String {
        format!("/{}/{{{}}}", self.name, self.item_param())
    }

    /// Foreign key column child rows carry, e.g. `post_id`.
    pub fn foreign_id(&self) -> String {
        format!("{}_id", self.singular)
    }

    pub fn parse_id(&self, raw: &str) -> ApiResult<SqlValue> {
        self.id_pattern.parse(raw).ok_or(ApiError::NotFound)
    }

    fn id_from_path(&self, params: &HashMap<String, String>) -> ApiResult<SqlValue> {
        let raw = params.get(&self.item_param()).ok_or(ApiError::NotFound)?;
        self.parse_id(raw)
    }

    /// Open the collection for the current request, honoring the configured
    /// accessor and timestamp maintenance.
    pub fn open_collection(
        &self,
        db: &Database,
        nested: &Nested,
        parent: Option<&ParentScope>,
    ) -> Collection<E> {
        let scope = RequestScope { db, nested, parent };
        (self.collection)(&scope).with_timestamps(self.timestamps)
    }

    /// Check a request body against the declared fields.
    ///
    /// Body keys must name real columns, and declared fields narrow that
    /// further. Required fields are enforced on create only.
    pub fn validate_attrs(&self, attrs: &Map<String, Value>, partial: bool) -> ApiResult<()> {
        let mut errors = Vec::new();

        for key in attrs.keys() {
            let known = E::columns().contains(&key.as_str());
            let declared = self.fields.is_empty()
                || self.fields.iter().any(|field| field.name == key.as_str());
            if !known || !declared {
                errors.push(format!("{} is not a writable field", key));
            }
        }

        if !partial {
            for field in &self.fields {
                if field.required && !attrs.contains_key(field.name) {
                    errors.push(format!("{} is required", field.name));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApiError::Validation(errors))
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RouteSet {
    create: bool,
    list: bool,
    item: bool,
    update: bool,
    destroy: bool,
}

/// Route builder for one resource. Consumed method by method, finished with
/// [`ResourceRouter::into_parts`] via the server builder.
pub struct ResourceRouter<E: Model> {
    db: Database,
    spec: Arc<ResourceSpec<E>>,
    router: Router,
    routes: RouteSet,
    specs: Vec<RouteSpec>,
}

impl<E: Model + 'static> ResourceRouter<E> {
    pub fn new(db: Database, spec: ResourceSpec<E>) -> Self {
        Self {
            db,
            spec: Arc::new(spec),
            router: Router::new(),
            routes: RouteSet::default(),
            specs: Vec::new(),
        }
    }

    pub fn spec(&self) -> &ResourceSpec<E> {
        &self.spec
    }

    /// Registered routes, for the `/_specs` report.
    pub fn route_specs(&self) -> &[RouteSpec] {
        &self.specs
    }

    /// POST the base path: insert a row from the body, respond 201 with the
    /// stored entity.
    pub fn create(mut self) -> Self {
        if self.routes.create {
            return self;
        }
        self.routes.create = true;

        let db = self.db.clone();
        let spec = self.spec.clone();
        let path = self.spec.base_path();
        let handler = move |nested: Option<Extension<Nested>>,
                            parent: Option<Extension<ParentScope>>,
                            Json(body): Json<Value>| {
            let db = db.clone();
            let spec = spec.clone();
            async move {
                handle_create(db, spec, take_nested(nested), take_parent(parent), body).await
            }
        };

        self.router = self.router.route(&path, post(handler));
        self.specs.push(RouteSpec {
            method: "POST",
            path,
        });
        self
    }

    /// GET the base path: filter, search, sort and paginate, respond 200
    /// with the page body and a `Content-Range` header carrying the total.
    pub fn list(mut self, options: ListOptions<E>) -> Self {
        if self.routes.list {
            return self;
        }
        self.routes.list = true;

        let db = self.db.clone();
        let spec = self.spec.clone();
        let options = Arc::new(options);
        let path = self.spec.base_path();
        let handler = move |Query(params): Query<ListParams>,
                            nested: Option<Extension<Nested>>,
                            parent: Option<Extension<ParentScope>>| {
            let db = db.clone();
            let spec = spec.clone();
            let options = options.clone();
            async move {
                handle_list(db, spec, options, params, take_nested(nested), take_parent(parent))
                    .await
            }
        };

        self.router = self.router.route(&path, get(handler));
        self.specs.push(RouteSpec {
            method: "GET",
            path,
        });
        self
    }

    /// GET the item path: fetch one row by the id attribute, 404 when it is
    /// missing or the segment does not match the id pattern.
    pub fn item(mut self) -> Self {
        if self.routes.item {
            return self;
        }
        self.routes.item = true;

        let db = self.db.clone();
        let spec = self.spec.clone();
        let path = self.spec.item_path();
        let handler = move |Path(params): Path<HashMap<String, String>>,
                            nested: Option<Extension<Nested>>,
                            parent: Option<Extension<ParentScope>>| {
            let db = db.clone();
            let spec = spec.clone();
            async move {
                handle_item(db, spec, params, take_nested(nested), take_parent(parent)).await
            }
        };

        self.router = self.router.route(&path, get(handler));
        self.specs.push(RouteSpec {
            method: "GET",
            path,
        });
        self
    }

    /// List and item together.
    pub fn read(self, options: ListOptions<E>) -> Self {
        self.list(options).item()
    }

    /// PUT and PATCH the item path: partial save, respond 202 with the
    /// stored entity.
    pub fn update(self) -> Self {
        self.update_inner(None)
    }

    /// Like [`ResourceRouter::update`], with a hook run after the save.
    pub fn update_with<F, Fut>(self, after: F) -> Self
    where
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<()>> + Send + 'static,
    {
        self.update_inner(Some(Arc::new(move |entity| after(entity).boxed())))
    }

    fn update_inner(mut self, after: Option<AfterUpdate<E>>) -> Self {
        if self.routes.update {
            return self;
        }
        self.routes.update = true;

        let db = self.db.clone();
        let spec = self.spec.clone();
        let path = self.spec.item_path();
        let handler = move |Path(params): Path<HashMap<String, String>>,
                            nested: Option<Extension<Nested>>,
                            parent: Option<Extension<ParentScope>>,
                            Json(body): Json<Value>| {
            let db = db.clone();
            let spec = spec.clone();
            let after = after.clone();
            async move {
                handle_update(
                    db,
                    spec,
                    after,
                    params,
                    take_nested(nested),
                    take_parent(parent),
                    body,
                )
                .await
            }
        };

        self.router = self
            .router
            .route(&path, put(handler.clone()).patch(handler));
        self.specs.push(RouteSpec {
            method: "PUT",
            path: path.clone(),
        });
        self.specs.push(RouteSpec {
            method: "PATCH",
            path,
        });
        self
    }

    /// DELETE the item path: remove the row, respond 204.
    pub fn destroy(self) -> Self {
        self.destroy_inner(None)
    }

    /// Like [`ResourceRouter::destroy`], with a hook run after the delete.
    /// The hook receives a snapshot of the deleted row.
    pub fn destroy_with<F, Fut>(self, after: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ApiResult<()>> + Send + 'static,
    {
        self.destroy_inner(Some(Arc::new(move |snapshot| after(snapshot).boxed())))
    }

    fn destroy_inner(mut self, after: Option<AfterDestroy>) -> Self {
        if self.routes.destroy {
            return self;
        }
        self.routes.destroy = true;

        let db = self.db.clone();
        let spec = self.spec.clone();
        let path = self.spec.item_path();
        let handler = move |Path(params): Path<HashMap<String, String>>,
                            nested: Option<Extension<Nested>>,
                            parent: Option<Extension<ParentScope>>| {
            let db = db.clone();
            let spec = spec.clone();
            let after = after.clone();
            async move {
                handle_destroy(db, spec, after, params, take_nested(nested), take_parent(parent))
                    .await
            }
        };

        self.router = self.router.route(&path, delete(handler));
        self.specs.push(RouteSpec {
            method: "DELETE",
            path,
        });
        self
    }

    /// All four capabilities with the given list options.
    pub fn crud(self, options: ListOptions<E>) -> Self {
        self.create().read(options).update().destroy()
    }

    /// Nest another resource under this one's item path.
    ///
    /// The child's routes run behind a resolver that fetches the parent row
    /// (404 when absent), records it for the child's handlers and scopes the
    /// child's default collection to the parent's foreign key.
    pub fn children<C: Model + 'static>(mut self, child: ResourceRouter<C>) -> Self {
        let prefix = format!("{}/{{{}}}", self.spec.base_path(), self.spec.item_param());

        let parent_spec = self.spec.clone();
        let db = self.db.clone();
        let resolver = middleware::from_fn(
            move |Path(params): Path<HashMap<String, String>>, mut req: Request, next: Next| {
                let spec = parent_spec.clone();
                let db = db.clone();
                async move {
                    resolve_parent(spec, db, params, &mut req).await?;
                    Ok::<_, ApiError>(next.run(req).await)
                }
            },
        );

        let (child_router, child_specs) = child.into_parts();
        self.router = self.router.nest(&prefix, child_router.layer(resolver));
        for child_spec in child_specs {
            self.specs.push(RouteSpec {
                method: child_spec.method,
                path: format!("{}{}", prefix, child_spec.path),
            });
        }
        self
    }

    pub(crate) fn into_parts(self) -> (Router, Vec<RouteSpec>) {
        (self.router, self.specs)
    }
}

/// Fetch the parent row named by the path and record it for the routes
/// below, honoring any scope an enclosing resource already resolved.
async fn resolve_parent<E: Model + 'static>(
    spec: Arc<ResourceSpec<E>>,
    db: Database,
    params: HashMap<String, String>,
    req: &mut Request,
) -> ApiResult<()> {
    let raw = params.get(&spec.item_param()).ok_or(ApiError::NotFound)?;
    let id = spec.parse_id(raw)?;

    let mut nested = req
        .extensions()
        .get::<Nested>()
        .cloned()
        .unwrap_or_default();
    let outer = req.extensions().get::<ParentScope>().cloned();

    let collection = spec.open_collection(&db, &nested, outer.as_ref());
    let parent = collection.fetch_required_by(&spec.id_attribute, &id).await?;

    nested.insert(
        spec.singular_name().to_string(),
        NestedParent {
            id: parent.id_value(),
            row: serde_json::to_value(&parent)?,
        },
    );
    req.extensions_mut().insert(nested);
    req.extensions_mut().insert(ParentScope {
        fk_column: spec.foreign_id(),
        parent_id: parent.id_value(),
    });
    Ok(())
}

fn take_nested(nested: Option<Extension<Nested>>) -> Nested {
    nested.map(|Extension(n)| n).unwrap_or_default()
}

fn take_parent(parent: Option<Extension<ParentScope>>) -> Option<ParentScope> {
    parent.map(|Extension(p)| p)
}

fn body_object(body: &Value) -> ApiResult<&Map<String, Value>> {
    body.as_object()
        .ok_or_else(|| ApiError::validation("request body must be a JSON object"))
}

async fn handle_create<E: Model + 'static>(
    db: Database,
    spec: Arc<ResourceSpec<E>>,
    nested: Nested,
    parent: Option<ParentScope>,
    body: Value,
) -> ApiResult<(StatusCode, Json<E>)> {
    let attrs = body_object(&body)?;
    spec.validate_attrs(attrs, false)?;

    let collection = spec.open_collection(&db, &nested, parent.as_ref());
    let entity = collection.create(attrs).await?;
    Ok((StatusCode::CREATED, Json(entity)))
}

async fn handle_list<E: Model + 'static>(
    db: Database,
    spec: Arc<ResourceSpec<E>>,
    options: Arc<ListOptions<E>>,
    params: ListParams,
    nested: Nested,
    parent: Option<ParentScope>,
) -> ApiResult<Response> {
    let collection = spec.open_collection(&db, &nested, parent.as_ref());
    let filters = parse_filters(params.filters.as_deref());

    let mut query = collection.query();
    query = apply_filters(query, &options.filterable, filters.as_ref());
    query = apply_search(query, &options.searchable, params.q.as_deref());
    query = apply_sort(query, &options.sortable, params.sort.as_deref());

    let (limit, offset) = spec.page.clamp(&params);
    let (rows, total) = query.fetch_page(collection.db().pool(), limit, offset).await?;

    let content_range = if rows.is_empty() {
        format!("items */{}", total)
    } else {
        format!("items {}-{}/{}", offset, offset + rows.len() as i64 - 1, total)
    };
    Ok(([(header::CONTENT_RANGE, content_range)], Json(rows)).into_response())
}

async fn handle_item<E: Model + 'static>(
    db: Database,
    spec: Arc<ResourceSpec<E>>,
    params: HashMap<String, String>,
    nested: Nested,
    parent: Option<ParentScope>,
) -> ApiResult<Json<E>> {
    let id = spec.id_from_path(&params)?;
    let collection = spec.open_collection(&db, &nested, parent.as_ref());
    let entity = collection.fetch_required_by(&spec.id_attribute, &id).await?;
    Ok(Json(entity))
}

async fn handle_update<E: Model + 'static>(
    db: Database,
    spec: Arc<ResourceSpec<E>>,
    after: Option<AfterUpdate<E>>,
    params: HashMap<String, String>,
    nested: Nested,
    parent: Option<ParentScope>,
    body: Value,
) -> ApiResult<(StatusCode, Json<E>)> {
    let id = spec.id_from_path(&params)?;
    let attrs = body_object(&body)?;
    spec.validate_attrs(attrs, true)?;

    let collection = spec.open_collection(&db, &nested, parent.as_ref());
    let existing = collection.fetch_required_by(&spec.id_attribute, &id).await?;
    let updated = collection.save_patch(&existing.id_value(), attrs).await?;

    if let Some(hook) = &after {
        hook(updated.clone()).await?;
    }
    Ok((StatusCode::ACCEPTED, Json(updated)))
}

async fn handle_destroy<E: Model + 'static>(
    db: Database,
    spec: Arc<ResourceSpec<E>>,
    after: Option<AfterDestroy>,
    params: HashMap<String, String>,
    nested: Nested,
    parent: Option<ParentScope>,
) -> ApiResult<StatusCode> {
    let id = spec.id_from_path(&params)?;
    let collection = spec.open_collection(&db, &nested, parent.as_ref());
    let existing = collection.fetch_required_by(&spec.id_attribute, &id).await?;
    let snapshot = serde_json::to_value(&existing)?;

    collection.destroy(&existing.id_value()).await?;

    if let Some(hook) = &after {
        hook(snapshot).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}
