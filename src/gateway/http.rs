use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use super::observability::PipelineMetricsSnapshot;
use super::pipeline::OrchestrationPipeline;
use super::{ChatRequest, GatewayError};

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct GatewayHttpState {
    pipeline: Arc<OrchestrationPipeline>,
}

impl GatewayHttpState {
    pub fn new(pipeline: Arc<OrchestrationPipeline>) -> Self {
        Self { pipeline }
    }
}

#[derive(Debug, Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    remaining: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/chat", post(handle_chat))
        .route("/history", get(handle_history))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn metrics(State(state): State<GatewayHttpState>) -> Json<PipelineMetricsSnapshot> {
    Json(state.pipeline.metrics().snapshot())
}

async fn handle_chat(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response {
    let request_id = extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);

    let mut response = match payload {
        Ok(Json(request)) => {
            let span = tracing::info_span!(
                "chat",
                request_id = %request_id,
                user_id = %request.user_id,
            );
            match state.pipeline.handle(request).instrument(span).await {
                Ok(body) => Json(body).into_response(),
                Err(err) => map_gateway_error(err).into_response(),
            }
        }
        Err(rejection) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            rejection.body_text(),
        )
        .into_response(),
    };

    insert_request_id(response.headers_mut(), &request_id);
    response
}

async fn handle_history(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    query: Result<Query<HistoryQuery>, QueryRejection>,
) -> Response {
    let request_id = extract_header(&headers, "x-request-id").unwrap_or_else(generate_request_id);

    let mut response = match query {
        Ok(Query(query)) => {
            let user_id = query.user_id.unwrap_or_default();
            let span = tracing::info_span!(
                "history",
                request_id = %request_id,
                user_id = %user_id,
            );
            match state
                .pipeline
                .list_history(&user_id, query.limit)
                .instrument(span)
                .await
            {
                Ok(turns) => Json(turns).into_response(),
                Err(err) => {
                    tracing::warn!(request_id = %request_id, error = %err, "history read failed");
                    map_gateway_error(err).into_response()
                }
            }
        }
        Err(rejection) => error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            rejection.body_text(),
        )
        .into_response(),
    };

    insert_request_id(response.headers_mut(), &request_id);
    response
}

fn map_gateway_error(err: GatewayError) -> (StatusCode, Json<ErrorResponse>) {
    let message = err.to_string();
    match err {
        GatewayError::InvalidRequest { .. } => {
            error_response(StatusCode::BAD_REQUEST, "invalid_request", message)
        }
        GatewayError::Blocked => error_response(StatusCode::BAD_REQUEST, "blocked", message),
        GatewayError::QuotaExceeded { remaining } => {
            let (status, mut body) =
                error_response(StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", message);
            body.0.error.remaining = Some(remaining);
            (status, body)
        }
        GatewayError::RateLimited { .. } | GatewayError::ProviderRateLimited { .. } => {
            error_response(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
        }
        GatewayError::ProviderQuota { .. } => {
            error_response(StatusCode::PAYMENT_REQUIRED, "insufficient_quota", message)
        }
        GatewayError::Provider { .. } => {
            error_response(StatusCode::BAD_GATEWAY, "llm_failed", message)
        }
        GatewayError::Upstream { .. } => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "upstream_failed", message)
        }
        GatewayError::Timeout { .. } => {
            error_response(StatusCode::GATEWAY_TIMEOUT, "timeout", message)
        }
    }
}

fn error_response(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code,
                message: message.into(),
                remaining: None,
            },
        }),
    )
}

fn extract_header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn generate_request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    let ts_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis())
        .unwrap_or(0);
    format!("chatgate-{ts_ms}-{seq}")
}

fn insert_request_id(headers: &mut HeaderMap, request_id: &str) {
    let value = match HeaderValue::from_str(request_id) {
        Ok(value) => value,
        Err(_) => return,
    };
    headers.insert("x-request-id", value);
}
