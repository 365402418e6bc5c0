//! Router construction.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    routing::{get, post},
};
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer, trace::TraceLayer};

use super::handlers::{
    create_transaction_handler, get_by_request_id_handler, get_transaction_handler,
    health_check_handler, list_completions_handler, liveness_handler, openapi_handler,
    readiness_handler, resolve_stuck_handler,
};
use crate::app::TxManager;

/// HTTP layer settings
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub request_timeout: Duration,
    pub body_limit_bytes: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            body_limit_bytes: 256 * 1024,
        }
    }
}

impl RouterConfig {
    /// Load from `HTTP_REQUEST_TIMEOUT_SECS` and `HTTP_BODY_LIMIT_BYTES`.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: std::env::var("HTTP_REQUEST_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            body_limit_bytes: std::env::var("HTTP_BODY_LIMIT_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.body_limit_bytes),
        }
    }
}

/// Create the router with default layer settings
pub fn create_router(manager: Arc<TxManager>) -> Router {
    create_router_with_config(manager, RouterConfig::default())
}

pub fn create_router_with_config(manager: Arc<TxManager>, config: RouterConfig) -> Router {
    Router::new()
        .route("/transactions", post(create_transaction_handler))
        .route("/transactions/{id}", get(get_transaction_handler))
        .route("/transactions/{id}/resolve", post(resolve_stuck_handler))
        .route(
            "/submitters/{submitter}/requests/{request_id}",
            get(get_by_request_id_handler),
        )
        .route("/completions", get(list_completions_handler))
        .route("/health", get(health_check_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .route("/api-docs/openapi.json", get(openapi_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
                .layer(TimeoutLayer::new(config.request_timeout)),
        )
        .with_state(manager)
}
