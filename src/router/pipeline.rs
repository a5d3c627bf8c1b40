//! List-route query pipeline: filter, search and sort stages applied to a
//! [`SelectQuery`] in that order, each driven by an allow list declared on
//! the route.
//!
//! Every stage degrades to a no-op when its input is absent or falls outside
//! the declared allow list. Malformed client input narrows nothing and never
//! fails a request.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::db::{Model, SelectQuery, SqlValue};

/// A `sort` query value: field name with an optional `-` prefix meaning
/// descending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

impl SortKey {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix('-') {
            Some(field) => Self {
                field: field.to_string(),
                descending: true,
            },
            None => Self {
                field: raw.to_string(),
                descending: false,
            },
        }
    }

    pub fn direction(&self) -> &'static str {
        if self.descending { "DESC" } else { "ASC" }
    }
}

/// One declared filter rule.
#[derive(Clone)]
pub enum FilterRule<E: Model> {
    /// Stock rule: equality or `IN` membership on a single column.
    Field(&'static str),
    /// Route-supplied hook with full access to the query and filter map.
    Custom(Arc<dyn Fn(&mut FilterContext<'_, E>) + Send + Sync>),
}

/// Passed to filter rules: the query under construction plus the parsed
/// `filters` map from the request.
pub struct FilterContext<'f, E: Model> {
    pub query: SelectQuery<E>,
    pub filters: &'f Map<String, Value>,
}

impl<E: Model> FilterContext<'_, E> {
    /// Apply the stock rule for one field.
    ///
    /// An absent key narrows nothing. A JSON array becomes membership, a
    /// scalar becomes equality and `null` matches SQL NULL. Objects are
    /// ignored.
    pub fn filter(&mut self, field: &str) {
        let Some(value) = self.filters.get(field) else {
            return;
        };
        let query = std::mem::take(&mut self.query);
        self.query = match value {
            Value::Array(items) => {
                let values: Vec<SqlValue> =
                    items.iter().filter_map(SqlValue::from_json).collect();
                query.where_in(field, values)
            }
            other => match SqlValue::from_json(other) {
                Some(value) => query.where_eq(field, value),
                None => {
                    tracing::debug!(field = %field, "Ignoring non-scalar filter value");
                    query
                }
            },
        };
    }
}

/// Allow lists for the three list-route stages.
pub struct ListOptions<E: Model> {
    pub sortable: Vec<&'static str>,
    pub searchable: Vec<&'static str>,
    pub filterable: Vec<FilterRule<E>>,
}

impl<E: Model> Default for ListOptions<E> {
    fn default() -> Self {
        Self {
            sortable: Vec::new(),
            searchable: Vec::new(),
            filterable: Vec::new(),
        }
    }
}

impl<E: Model> Clone for ListOptions<E> {
    fn clone(&self) -> Self {
        Self {
            sortable: self.sortable.clone(),
            searchable: self.searchable.clone(),
            filterable: self.filterable.clone(),
        }
    }
}

impl<E: Model> ListOptions<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sortable(mut self, fields: &[&'static str]) -> Self {
        self.sortable = fields.to_vec();
        self
    }

    pub fn searchable(mut self, fields: &[&'static str]) -> Self {
        self.searchable = fields.to_vec();
        self
    }

    /// Declare a stock filter rule for `field`.
    pub fn filter_field(mut self, field: &'static str) -> Self {
        self.filterable.push(FilterRule::Field(field));
        self
    }

    /// Declare a custom filter rule.
    pub fn filter_with(
        mut self,
        rule: impl Fn(&mut FilterContext<'_, E>) + Send + Sync + 'static,
    ) -> Self {
        self.filterable.push(FilterRule::Custom(Arc::new(rule)));
        self
    }
}

/// Run the declared filter rules over the query.
///
/// `filters` is `None` when the request carried no usable `filters`
/// parameter, which skips the stage entirely. Custom rules always run when
/// the map is present, even if it is empty.
pub fn apply_filters<E: Model>(
    query: SelectQuery<E>,
    rules: &[FilterRule<E>],
    filters: Option<&Map<String, Value>>,
) -> SelectQuery<E> {
    let Some(filters) = filters else {
        return query;
    };
    let mut context = FilterContext { query, filters };
    for rule in rules {
        match rule {
            FilterRule::Field(field) => context.filter(field),
            FilterRule::Custom(hook) => hook(&mut context),
        }
    }
    context.query
}

/// Add a grouped `OR` of substring probes over the searchable columns.
pub fn apply_search<E: Model>(
    query: SelectQuery<E>,
    searchable: &[&'static str],
    q: Option<&str>,
) -> SelectQuery<E> {
    let Some(q) = q.filter(|q| !q.is_empty()) else {
        return query;
    };
    if searchable.is_empty() {
        return query;
    }

    let probes: Vec<String> = searchable
        .iter()
        .map(|column| format!("{} LIKE ?", column))
        .collect();
    let condition = format!("({})", probes.join(" OR "));
    let pattern = format!("%{}%", q);
    let values = searchable
        .iter()
        .map(|_| SqlValue::String(pattern.clone()))
        .collect();
    query.where_raw(&condition, values)
}

/// Order the query from the `sort` parameter.
///
/// An absent parameter falls back to the first sortable column ascending. A
/// field outside the allow list leaves the query unordered.
pub fn apply_sort<E: Model>(
    query: SelectQuery<E>,
    sortable: &[&'static str],
    sort: Option<&str>,
) -> SelectQuery<E> {
    if sortable.is_empty() {
        return query;
    }
    let key = match sort {
        Some(raw) => SortKey::parse(raw),
        None => SortKey {
            field: sortable[0].to_string(),
            descending: false,
        },
    };
    if !sortable.iter().any(|column| *column == key.field) {
        tracing::debug!(field = %key.field, "Ignoring sort field outside the allow list");
        return query;
    }
    query.order_by(&key.field, key.direction())
}
