use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

use crate::audit::ledger::{ActionRecord, IngestReceipt};
use crate::audit::query::{QueryRequest, QueryResult};
use crate::audit::retention::PurgeOutcome;
use crate::audit::verify::{EntryVerification, RangeVerification};
use crate::compliance::engine::ComplianceCheckResult;
use crate::compliance::report::ComplianceReport;
use crate::crypto::PublicKeyInfo;
use crate::error::LedgerError;
use crate::service::{
    EvaluateRequest, HealthStatus, LedgerService, Operation, OperationResponse, PurgeRequest,
    RangeRequest, ReportRequest,
};

/// Error body: `{status: "error", kind, message}`.
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(LedgerError::ValidationError(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            LedgerError::ValidationError(_) => StatusCode::BAD_REQUEST,
            LedgerError::NotFoundError(_) => StatusCode::NOT_FOUND,
            LedgerError::ProcessingError(_) | LedgerError::ConfigError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!("Request failed: {}", self.0);
        }

        let body = json!({
            "status": "error",
            "kind": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub async fn health(State(service): State<Arc<LedgerService>>) -> Json<HealthStatus> {
    Json(service.health().await)
}

pub async fn ingest(
    State(service): State<Arc<LedgerService>>,
    payload: Result<Json<ActionRecord>, JsonRejection>,
) -> ApiResult<IngestReceipt> {
    let Json(record) = payload?;
    Ok(Json(service.ingest(record).await?))
}

pub async fn query(
    State(service): State<Arc<LedgerService>>,
    payload: Result<Json<QueryRequest>, JsonRejection>,
) -> ApiResult<QueryResult> {
    let Json(request) = payload?;
    Ok(Json(service.query(&request).await?))
}

pub async fn verify_entry(
    State(service): State<Arc<LedgerService>>,
    Path(log_id): Path<String>,
) -> ApiResult<EntryVerification> {
    Ok(Json(service.verify_entry(&log_id).await?))
}

pub async fn verify_range(
    State(service): State<Arc<LedgerService>>,
    payload: Result<Json<RangeRequest>, JsonRejection>,
) -> ApiResult<RangeVerification> {
    let Json(request) = payload?;
    Ok(Json(service.verify_range(&request).await?))
}

pub async fn public_key(State(service): State<Arc<LedgerService>>) -> Json<PublicKeyInfo> {
    Json(service.public_key())
}

pub async fn evaluate(
    State(service): State<Arc<LedgerService>>,
    payload: Result<Json<EvaluateRequest>, JsonRejection>,
) -> ApiResult<ComplianceCheckResult> {
    let Json(request) = payload?;
    Ok(Json(service.evaluate(&request).await?))
}

pub async fn report(
    State(service): State<Arc<LedgerService>>,
    payload: Result<Json<ReportRequest>, JsonRejection>,
) -> ApiResult<ComplianceReport> {
    let Json(request) = payload?;
    Ok(Json(service.report(&request).await?))
}

pub async fn purge(
    State(service): State<Arc<LedgerService>>,
    payload: Result<Json<PurgeRequest>, JsonRejection>,
) -> ApiResult<PurgeOutcome> {
    let Json(request) = payload?;
    if !request.dry_run {
        info!("Purge of category '{}' requested", request.category);
    }
    Ok(Json(service.purge(&request).await?))
}

pub async fn dispatch(
    State(service): State<Arc<LedgerService>>,
    payload: Result<Json<Operation>, JsonRejection>,
) -> ApiResult<OperationResponse> {
    let Json(operation) = payload?;
    Ok(Json(service.dispatch(operation).await?))
}
