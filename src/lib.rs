//! Gantry - declarative REST resources over SQLite with batched relation
//! loading.
//!
//! A resource is declared once ([`ResourceSpec`]) and turned into CRUD
//! routes ([`ResourceRouter`]) with filtering, search, sorting, pagination
//! and nested mounting. Graph-style read APIs reuse the same tables through
//! a per-request [`Loader`] that coalesces relation fetches into single
//! `IN` queries, paginated as cursor connections.

pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod loader;
pub mod router;
pub mod server;

pub use config::Config;
pub use db::{Collection, Database, HasForeignKey, Model, SelectQuery, SqlValue};
pub use error::{ApiError, ApiResult};
pub use loader::{BatchConfig, BelongsTo, HasMany, HasOne, Loader};
pub use router::{
    AggregateFn, AggregateRouter, AggregateSpec, Dimension, FieldSpec, IdPattern, ListOptions,
    Metric, ResourceRouter, ResourceSpec,
};
pub use server::{init_tracing, App};
