//! HTTP interface for the ledger service

pub mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::service::LedgerService;

pub use handlers::ApiError;

/// Build the router with every route and request tracing
pub fn create_router(service: Arc<LedgerService>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/audit/logs", post(handlers::ingest))
        .route("/audit/query", post(handlers::query))
        .route("/audit/verify", post(handlers::verify_range))
        .route("/audit/verify/:log_id", get(handlers::verify_entry))
        .route("/audit/public-key", get(handlers::public_key))
        .route("/compliance/evaluate", post(handlers::evaluate))
        .route("/compliance/report", post(handlers::report))
        .route("/retention/purge", post(handlers::purge))
        .route("/dispatch", post(handlers::dispatch))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(service)
}
