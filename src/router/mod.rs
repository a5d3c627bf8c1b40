//! Shared route-builder plumbing: list parameters, page clamping, nested
//! parent state and the route registry backing `/_specs`.

pub mod aggregate;
pub mod pipeline;
pub mod resource;

pub use aggregate::{AggregateFn, AggregateRouter, AggregateSpec, Dimension, Metric};
pub use pipeline::{FilterContext, FilterRule, ListOptions, SortKey};
pub use resource::{FieldSpec, IdPattern, ResourceRouter, ResourceSpec};

use std::collections::HashMap;

use crate::db::{Collection, Database, Model, SqlValue};

/// Query-string parameters every list route understands.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ListParams {
    /// JSON object string, e.g. `filters={"user_id":2}`
    pub filters: Option<String>,
    /// Search keyword
    pub q: Option<String>,
    /// Sort field, `-` prefixed for descending
    pub sort: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Page size defaults and cap for list routes.
#[derive(Debug, Clone, Copy)]
pub struct PageDefaults {
    pub per_page: i64,
    pub max_per_page: i64,
}

impl Default for PageDefaults {
    fn default() -> Self {
        Self {
            per_page: 25,
            max_per_page: 100,
        }
    }
}

impl PageDefaults {
    /// Clamp requested limit/offset into `(limit, offset)`.
    pub fn clamp(&self, params: &ListParams) -> (i64, i64) {
        let limit = params.limit.unwrap_or(self.per_page).clamp(1, self.max_per_page);
        let offset = params.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// Parse the `filters` query parameter, a JSON object string.
///
/// Anything that is not a JSON object degrades to "no filters".
pub fn parse_filters(raw: Option<&str>) -> Option<serde_json::Map<String, serde_json::Value>> {
    let raw = raw?;
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Object(map)) => Some(map),
        Ok(_) | Err(_) => {
            tracing::debug!(raw = %raw, "Ignoring malformed filters parameter");
            None
        }
    }
}

/// A resolved parent entity, stored for nested routes.
#[derive(Debug, Clone)]
pub struct NestedParent {
    pub id: SqlValue,
    pub row: serde_json::Value,
}

/// Resolved parent rows for nested routes, keyed by singular resource name.
#[derive(Debug, Clone, Default)]
pub struct Nested(HashMap<String, NestedParent>);

impl Nested {
    pub fn get(&self, name: &str) -> Option<&NestedParent> {
        self.0.get(name)
    }

    pub fn insert(&mut self, name: String, parent: NestedParent) {
        self.0.insert(name, parent);
    }
}

/// The nearest resolved parent: the foreign key column child rows carry and
/// the parent's id. Applied by the default collection accessor.
#[derive(Debug, Clone)]
pub struct ParentScope {
    pub fk_column: String,
    pub parent_id: SqlValue,
}

/// What a collection accessor sees when a handler opens its collection.
pub struct RequestScope<'a> {
    pub db: &'a Database,
    pub nested: &'a Nested,
    pub parent: Option<&'a ParentScope>,
}

/// Builds a [`Collection`] for the current request.
pub type CollectionFn<E> =
    std::sync::Arc<dyn for<'a> Fn(&RequestScope<'a>) -> Collection<E> + Send + Sync>;

/// Default accessor: the entity's own table, scoped to the resolved parent
/// when the route is nested.
pub fn default_collection<E: Model>() -> CollectionFn<E> {
    std::sync::Arc::new(|scope: &RequestScope<'_>| {
        let collection = scope.db.collection::<E>();
        match scope.parent {
            Some(parent) => {
                collection.scoped(parent.fk_column.clone(), parent.parent_id.clone())
            }
            None => collection,
        }
    })
}

/// One registered route, reported by `/_specs`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteSpec {
    pub method: &'static str,
    pub path: String,
}

/// Singular form of a table-style plural name, for nested path params and
/// derived foreign keys. Irregular plurals resolve the way the inflection
/// rules of the `pluralize` family do (`statuses` -> `status`).
pub fn singularize(name: &str) -> String {
    pluralizer::pluralize(name, 1, false)
}
