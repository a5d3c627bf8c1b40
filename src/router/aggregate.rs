//! Aggregation routes: declared dimensions and metrics composed into a
//! grouped query from query-string parameters.
//!
//! The route owner declares what can be selected and grouped; the request
//! picks from those declarations by name. Anything undeclared is skipped,
//! and an empty pick falls back to the first declared dimension and metric.

use std::sync::Arc;

use axum::extract::Query;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::Value;

use crate::db::{Database, Model, SelectQuery};
use crate::error::ApiResult;

use super::pipeline::{apply_filters, apply_search, FilterContext, FilterRule};
use super::{parse_filters, PageDefaults, RouteSpec};

/// SQL aggregate functions a metric can use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    fn sql(&self) -> &'static str {
        match self {
            AggregateFn::Count => "COUNT",
            AggregateFn::Sum => "SUM",
            AggregateFn::Avg => "AVG",
            AggregateFn::Min => "MIN",
            AggregateFn::Max => "MAX",
        }
    }
}

/// A groupable expression, selected under `name`.
#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: &'static str,
    pub expr: String,
}

impl Dimension {
    pub fn new(name: &'static str, expr: impl Into<String>) -> Self {
        Self {
            name,
            expr: expr.into(),
        }
    }

    /// A dimension that is just a column.
    pub fn column(name: &'static str) -> Self {
        Self {
            name,
            expr: name.to_string(),
        }
    }

    fn select_sql(&self) -> String {
        if self.expr == self.name {
            self.name.to_string()
        } else {
            format!("{} AS {}", self.expr, self.name)
        }
    }
}

/// An aggregated column, selected under `name`.
#[derive(Debug, Clone)]
pub struct Metric {
    pub name: &'static str,
    pub aggregate: AggregateFn,
    pub column: &'static str,
}

impl Metric {
    pub fn new(name: &'static str, aggregate: AggregateFn, column: &'static str) -> Self {
        Self {
            name,
            aggregate,
            column,
        }
    }

    fn select_sql(&self) -> String {
        format!("{}({}) AS {}", self.aggregate.sql(), self.column, self.name)
    }
}

/// Query-string parameters of an aggregate route. The name lists are
/// comma-separated.
#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AggregateParams {
    pub dimensions: Option<String>,
    pub metrics: Option<String>,
    pub by: Option<String>,
    pub filters: Option<String>,
    pub q: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Declares an aggregation endpoint over one entity table.
pub struct AggregateSpec<E: Model> {
    path: String,
    dimensions: Vec<Dimension>,
    metrics: Vec<Metric>,
    filterable: Vec<FilterRule<E>>,
    searchable: Vec<&'static str>,
    page: PageDefaults,
}

impl<E: Model + 'static> AggregateSpec<E> {
    /// Mounted at `/aggregate/{table}` unless a path override is given.
    pub fn new(dimensions: Vec<Dimension>, metrics: Vec<Metric>) -> Self {
        Self {
            path: format!("/aggregate/{}", E::TABLE),
            dimensions,
            metrics,
            filterable: Vec::new(),
            searchable: Vec::new(),
            page: PageDefaults::default(),
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn searchable(mut self, fields: &[&'static str]) -> Self {
        self.searchable = fields.to_vec();
        self
    }

    pub fn filter_field(mut self, field: &'static str) -> Self {
        self.filterable.push(FilterRule::Field(field));
        self
    }

    pub fn filter_with(
        mut self,
        rule: impl Fn(&mut FilterContext<'_, E>) + Send + Sync + 'static,
    ) -> Self {
        self.filterable.push(FilterRule::Custom(Arc::new(rule)));
        self
    }

    pub fn page(mut self, page: PageDefaults) -> Self {
        self.page = page;
        self
    }

    /// Resolve requested names against the declarations and compose the
    /// grouped query. Pagination is applied by the caller.
    fn compose(&self, params: &AggregateParams) -> SelectQuery<E> {
        let dimensions = picked(&self.dimensions, params.dimensions.as_deref(), |d| d.name);
        let metrics = picked(&self.metrics, params.metrics.as_deref(), |m| m.name);

        let mut selects: Vec<String> = Vec::new();
        selects.extend(dimensions.iter().map(|d| d.select_sql()));
        selects.extend(metrics.iter().map(|m| m.select_sql()));

        let mut query = SelectQuery::new();
        if !selects.is_empty() {
            query = query.select(&selects);
        }

        let filters = parse_filters(params.filters.as_deref());
        query = apply_filters(query, &self.filterable, filters.as_ref());
        query = apply_search(query, &self.searchable, params.q.as_deref());

        if let Some(by) = self.group_dimension(params.by.as_deref(), &dimensions) {
            query = query.group_by(by);
        }
        query
    }

    /// The grouping dimension: the requested one when declared, otherwise
    /// the first picked dimension.
    fn group_dimension<'a>(
        &self,
        by: Option<&str>,
        picked: &[&'a Dimension],
    ) -> Option<&'a str> {
        if let Some(requested) = by {
            if let Some(dimension) = picked.iter().find(|d| d.name == requested) {
                return Some(dimension.name);
            }
            tracing::debug!(by = %requested, "Ignoring undeclared grouping dimension");
        }
        picked.first().map(|d| d.name)
    }
}

/// Resolve a comma-separated pick list against the declarations. Unknown
/// names are skipped; an empty outcome falls back to the first declaration.
fn picked<'a, T>(
    declared: &'a [T],
    requested: Option<&str>,
    name: impl Fn(&T) -> &'static str,
) -> Vec<&'a T> {
    let mut out = Vec::new();
    if let Some(raw) = requested {
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match declared.iter().find(|item| name(item) == part) {
                Some(item) => out.push(item),
                None => tracing::debug!(name = %part, "Ignoring undeclared aggregate name"),
            }
        }
    }
    if out.is_empty() {
        out.extend(declared.first());
    }
    out
}

/// Route builder for one aggregation endpoint.
pub struct AggregateRouter<E: Model> {
    router: Router,
    specs: Vec<RouteSpec>,
    _marker: std::marker::PhantomData<E>,
}

impl<E: Model + 'static> AggregateRouter<E> {
    pub fn new(db: Database, spec: AggregateSpec<E>) -> Self {
        let spec = Arc::new(spec);
        let path = spec.path.clone();

        let handler = {
            let spec = spec.clone();
            move |Query(params): Query<AggregateParams>| {
                let db = db.clone();
                let spec = spec.clone();
                async move { handle_aggregate(db, spec, params).await }
            }
        };

        let router = Router::new().route(&path, get(handler));
        Self {
            router,
            specs: vec![RouteSpec {
                method: "GET",
                path,
            }],
            _marker: std::marker::PhantomData,
        }
    }

    pub fn route_specs(&self) -> &[RouteSpec] {
        &self.specs
    }

    pub(crate) fn into_parts(self) -> (Router, Vec<RouteSpec>) {
        (self.router, self.specs)
    }
}

async fn handle_aggregate<E: Model + 'static>(
    db: Database,
    spec: Arc<AggregateSpec<E>>,
    params: AggregateParams,
) -> ApiResult<Json<Vec<Value>>> {
    let limit = params
        .limit
        .unwrap_or(spec.page.per_page)
        .clamp(1, spec.page.max_per_page);
    let offset = params.offset.unwrap_or(0).max(0);

    let query = spec.compose(&params).limit(limit).offset(offset);
    let rows = query.fetch_json(db.pool()).await?;
    Ok(Json(rows))
}
