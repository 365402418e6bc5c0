//! HTTP request handlers with OpenAPI documentation.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use tracing::{error, warn};
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;

use crate::app::{AppliedResolution, ResolutionOutcome, TxManager};
use crate::domain::{
    AppError, ChainError, CompletionEvent, CompletionPage, CreateTransactionRequest,
    DatabaseError, ErrorDetail, ErrorResponse, HealthResponse, HealthStatus, ManagedTransaction,
    TransactionState,
};

/// Default completion page size when `limit` is omitted
pub const DEFAULT_COMPLETION_LIMIT: i64 = 100;

/// OpenAPI documentation structure
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fenced Transaction Manager API",
        version = "0.1.0",
        description = "Create managed chain transactions and follow them to a terminal state",
        license(
            name = "MIT"
        )
    ),
    paths(
        create_transaction_handler,
        get_transaction_handler,
        get_by_request_id_handler,
        list_completions_handler,
        resolve_stuck_handler,
        health_check_handler,
        liveness_handler,
        readiness_handler,
    ),
    components(
        schemas(
            ManagedTransaction,
            CreateTransactionRequest,
            TransactionState,
            CompletionEvent,
            CompletionPage,
            AppliedResolution,
            ResolutionOutcome,
            HealthResponse,
            HealthStatus,
            ErrorResponse,
            ErrorDetail,
        )
    ),
    tags(
        (name = "transactions", description = "Managed transaction endpoints"),
        (name = "completions", description = "Completion feed"),
        (name = "health", description = "Health check endpoints")
    )
)]
pub struct ApiDoc;

/// Completion feed query parameters
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct CompletionParams {
    /// Return events with a sequence greater than this (default 0)
    pub after: Option<i64>,
    /// Page size (1-1000, default 100)
    pub limit: Option<i64>,
}

/// Create a managed transaction
///
/// Binds a nonce under the submitter's lease and persists the record before
/// responding. Submission to the chain happens asynchronously afterwards.
/// Repeating a request with the same `request_id` returns the original record.
#[utoipa::path(
    post,
    path = "/transactions",
    tag = "transactions",
    request_body = CreateTransactionRequest,
    responses(
        (status = 200, description = "Transaction allocated", body = ManagedTransaction),
        (status = 400, description = "Validation error", body = ErrorResponse),
        (status = 409, description = "This node does not hold the submitter's lease", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse),
        (status = 503, description = "Batch aborted or database unavailable", body = ErrorResponse)
    )
)]
pub async fn create_transaction_handler(
    State(manager): State<Arc<TxManager>>,
    Json(request): Json<CreateTransactionRequest>,
) -> Result<Json<ManagedTransaction>, AppError> {
    let transaction = manager.create_transaction(request).await?;
    Ok(Json(transaction))
}

/// Get a managed transaction by ID
#[utoipa::path(
    get,
    path = "/transactions/{id}",
    tag = "transactions",
    params(
        ("id" = Uuid, Path, description = "Transaction ID")
    ),
    responses(
        (status = 200, description = "Transaction found", body = ManagedTransaction),
        (status = 404, description = "Transaction not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_transaction_handler(
    State(manager): State<Arc<TxManager>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ManagedTransaction>, AppError> {
    let transaction = manager
        .get_transaction(id)
        .await?
        .ok_or_else(|| AppError::Database(DatabaseError::NotFound(id.to_string())))?;
    Ok(Json(transaction))
}

/// Look up a transaction by its idempotency key
#[utoipa::path(
    get,
    path = "/submitters/{submitter}/requests/{request_id}",
    tag = "transactions",
    params(
        ("submitter" = String, Path, description = "Submitter account"),
        ("request_id" = String, Path, description = "Caller-supplied request ID")
    ),
    responses(
        (status = 200, description = "Transaction found", body = ManagedTransaction),
        (status = 404, description = "No transaction for this request ID", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn get_by_request_id_handler(
    State(manager): State<Arc<TxManager>>,
    Path((submitter, request_id)): Path<(String, String)>,
) -> Result<Json<ManagedTransaction>, AppError> {
    let transaction = manager
        .get_by_request_id(&submitter, &request_id)
        .await?
        .ok_or_else(|| {
            AppError::Database(DatabaseError::NotFound(format!(
                "{}/{}",
                submitter, request_id
            )))
        })?;
    Ok(Json(transaction))
}

/// Page through the completion feed
#[utoipa::path(
    get,
    path = "/completions",
    tag = "completions",
    params(CompletionParams),
    responses(
        (status = 200, description = "Completion events ordered by sequence", body = CompletionPage),
        (status = 400, description = "Invalid paging parameters", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn list_completions_handler(
    State(manager): State<Arc<TxManager>>,
    Query(params): Query<CompletionParams>,
) -> Result<Json<CompletionPage>, AppError> {
    let page = manager
        .completions_after(
            params.after.unwrap_or(0),
            params.limit.unwrap_or(DEFAULT_COMPLETION_LIMIT),
        )
        .await?;
    Ok(Json(page))
}

/// Run stuck resolution for one transaction
///
/// Asks the configured resolution hook for a decision and applies it under
/// the submitter's lease.
#[utoipa::path(
    post,
    path = "/transactions/{id}/resolve",
    tag = "transactions",
    params(
        ("id" = Uuid, Path, description = "Transaction ID")
    ),
    responses(
        (status = 200, description = "Decision applied", body = AppliedResolution),
        (status = 400, description = "Transaction already terminal", body = ErrorResponse),
        (status = 404, description = "Transaction not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    )
)]
pub async fn resolve_stuck_handler(
    State(manager): State<Arc<TxManager>>,
    Path(id): Path<Uuid>,
) -> Result<Json<AppliedResolution>, AppError> {
    let resolution = manager.resolve_stuck(id).await?;
    Ok(Json(resolution))
}

/// Detailed health check
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Health status", body = HealthResponse)
    )
)]
pub async fn health_check_handler(State(manager): State<Arc<TxManager>>) -> Json<HealthResponse> {
    Json(manager.health_check().await)
}

/// Liveness probe
#[utoipa::path(
    get,
    path = "/health/live",
    tag = "health",
    responses(
        (status = 200, description = "Application is alive")
    )
)]
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness probe
#[utoipa::path(
    get,
    path = "/health/ready",
    tag = "health",
    responses(
        (status = 200, description = "Application is ready to serve traffic"),
        (status = 503, description = "Application is not ready")
    )
)]
pub async fn readiness_handler(State(manager): State<Arc<TxManager>>) -> StatusCode {
    match manager.health_check().await.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Serve the OpenAPI document
pub async fn openapi_handler() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error_type) = match &self {
            AppError::Database(db_err) => match db_err {
                DatabaseError::Connection(_) => (StatusCode::SERVICE_UNAVAILABLE, "database_error"),
                DatabaseError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                DatabaseError::Duplicate(_) => (StatusCode::CONFLICT, "duplicate"),
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            },
            AppError::Chain(chain_err) => match chain_err {
                ChainError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout"),
                _ => (StatusCode::BAD_GATEWAY, "chain_error"),
            },
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
            AppError::NotLeader { .. } => (StatusCode::CONFLICT, "not_leader"),
            AppError::FencedRejection { .. } => (StatusCode::CONFLICT, "fenced_rejection"),
            AppError::BatchAborted(_) => (StatusCode::SERVICE_UNAVAILABLE, "batch_aborted"),
            AppError::NotSupported(_) => (StatusCode::NOT_IMPLEMENTED, "not_supported"),
            AppError::Serialization(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error")
            }
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            error!(error_type = %error_type, message = %message, "Server error");
        } else if status == StatusCode::CONFLICT {
            warn!(error_type = %error_type, message = %message, "Request conflicted");
        }

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                r#type: error_type.to_string(),
                message,
            },
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ValidationError;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            status_of(AppError::NotLeader {
                submitter: "s1".to_string(),
                fencing_token: 3,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(AppError::Validation(ValidationError::MissingField(
                "submitter".to_string()
            ))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(AppError::Database(DatabaseError::NotFound("x".to_string()))),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(AppError::Chain(ChainError::RpcError("down".to_string()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_of(AppError::Internal("boom".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_openapi_lists_routes() {
        let doc = ApiDoc::openapi();
        let paths: Vec<_> = doc.paths.paths.keys().cloned().collect();
        assert!(paths.contains(&"/transactions".to_string()));
        assert!(paths.contains(&"/completions".to_string()));
        assert!(paths.contains(&"/transactions/{id}/resolve".to_string()));
    }
}
