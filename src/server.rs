//! Application assembly and serving.
//!
//! [`App`] merges resource and aggregate routers, adds the health and
//! `/_specs` endpoints, injects a fresh per-request [`Loader`] and wraps the
//! result in the shared CORS and trace layers.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::middleware::{self, Next};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::db::{Database, Model};
use crate::loader::{BatchConfig, Loader};
use crate::router::{AggregateRouter, ResourceRouter, RouteSpec};

/// Install the JSON tracing subscriber with an env-controlled filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gantry=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    ready: bool,
    database: bool,
}

/// Application builder.
pub struct App {
    db: Database,
    router: Router,
    specs: Vec<RouteSpec>,
    batch_config: BatchConfig,
}

impl App {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            router: Router::new(),
            specs: Vec::new(),
            batch_config: BatchConfig::default(),
        }
    }

    /// Mount a resource's routes.
    pub fn resource<E: Model + 'static>(mut self, resource: ResourceRouter<E>) -> Self {
        let (router, specs) = resource.into_parts();
        self.router = self.router.merge(router);
        self.specs.extend(specs);
        self
    }

    /// Mount an aggregation route.
    pub fn aggregate<E: Model + 'static>(mut self, aggregate: AggregateRouter<E>) -> Self {
        let (router, specs) = aggregate.into_parts();
        self.router = self.router.merge(router);
        self.specs.extend(specs);
        self
    }

    /// Mount additional routes, e.g. a GraphQL endpoint.
    pub fn merge(mut self, router: Router) -> Self {
        self.router = self.router.merge(router);
        self
    }

    /// Override the relation batching window.
    pub fn batch_config(mut self, config: BatchConfig) -> Self {
        self.batch_config = config;
        self
    }

    pub fn route_specs(&self) -> &[RouteSpec] {
        &self.specs
    }

    /// Finish the router: health endpoints, the spec report, the
    /// per-request loader and the middleware stack.
    pub fn build(self) -> Router {
        let mut spec_map: BTreeMap<String, Vec<&'static str>> = BTreeMap::new();
        for spec in &self.specs {
            let methods = spec_map.entry(spec.path.clone()).or_default();
            if !methods.contains(&spec.method) {
                methods.push(spec.method);
            }
        }
        let spec_map = Arc::new(spec_map);

        let db = self.db.clone();
        let batch_config = self.batch_config.clone();

        self.router
            .route("/healthz", get(healthz))
            .route(
                "/readyz",
                get(move || {
                    let db = db.clone();
                    async move { readyz(db).await }
                }),
            )
            .route(
                "/_specs",
                get(move || {
                    let specs = spec_map.clone();
                    async move { Json(specs.as_ref().clone()) }
                }),
            )
            .layer(middleware::from_fn(move |mut req: Request, next: Next| {
                let config = batch_config.clone();
                async move {
                    req.extensions_mut().insert(Loader::with_config(config));
                    next.run(req).await
                }
            }))
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(TraceLayer::new_for_http())
    }

    /// Build and serve on the given port until the task is stopped.
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let app = self.build();
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;
        Ok(())
    }
}

/// Liveness: always OK while the server runs.
async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness: verifies the database answers.
async fn readyz(db: Database) -> Json<ReadyResponse> {
    let db_ok = sqlx::query("SELECT 1").fetch_one(db.pool()).await.is_ok();

    Json(ReadyResponse {
        ready: db_ok,
        database: db_ok,
    })
}
