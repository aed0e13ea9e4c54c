use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{
        ConnectInfo, Path, Query, State,
        rejection::{JsonRejection, PathRejection, QueryRejection},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

use crate::{
    attribution::{
        AttributionError, AttributionService,
        types::{DeferDeepLinkRequest, RecordVisitResponse, ResolveVisitResponse},
    },
    config::Config,
    identity::{IdentityError, resolve_device_key},
};

#[derive(Clone)]
pub struct AppState {
    config: Config,
    attribution: Arc<AttributionService>,
    started_at: chrono::DateTime<Utc>,
}

impl AppState {
    #[must_use]
    pub fn new(config: Config, attribution: Arc<AttributionService>) -> Self {
        Self {
            config,
            attribution,
            started_at: Utc::now(),
        }
    }

    fn deadline(&self) -> Instant {
        Instant::now() + self.config.request_timeout()
    }

    fn device_key(
        &self,
        headers: &HeaderMap,
        peer: Option<ConnectInfo<SocketAddr>>,
    ) -> Result<String, ApiError> {
        resolve_device_key(
            headers,
            peer.map(|ConnectInfo(addr)| addr),
            self.config.identity_fallback,
        )
        .map_err(ApiError::from_identity)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/readyz", get(readiness))
        .route("/save", get(save_visit))
        .route("/app/:target", get(app_visit))
        .route("/deferDeepLink", post(defer_deep_link))
        .route("/queryDeferredDeepLinks", get(query_deferred_deep_link))
        .route(
            "/queryDeferredDeepLinks/:device_key",
            get(query_deferred_deep_link_by_key),
        )
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http()),
        )
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    build_sha: String,
    uptime_seconds: i64,
    store_driver: &'static str,
    identity_fallback: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    store_driver: &'static str,
    store_ready: bool,
}

#[derive(Debug, Deserialize)]
struct SaveQuery {
    #[serde(default)]
    pill: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AppVisitQuery {
    #[serde(default)]
    device_type: Option<String>,
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let uptime_seconds = (Utc::now() - state.started_at).num_seconds();
    Json(HealthResponse {
        status: "ok",
        service: state.config.service_name.clone(),
        build_sha: state.config.build_sha.clone(),
        uptime_seconds,
        store_driver: state.attribution.driver_name(),
        identity_fallback: state.config.identity_fallback.as_str(),
    })
}

async fn readiness(State(state): State<AppState>) -> impl IntoResponse {
    let store_ready = match state.attribution.ping(state.deadline()).await {
        Ok(()) => true,
        Err(error) => {
            tracing::warn!(reason = %error, "attribution store not ready");
            false
        }
    };
    let status = if store_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(ReadinessResponse {
            status: if store_ready { "ready" } else { "not_ready" },
            store_driver: state.attribution.driver_name(),
            store_ready,
        }),
    )
}

// Landing page: the visitor was shown `pill` and does not have the app yet.
async fn save_visit(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    query: Result<Query<SaveQuery>, QueryRejection>,
) -> Result<Json<RecordVisitResponse>, ApiError> {
    let Query(query) = query.map_err(ApiError::from_query)?;
    let device_key = state.device_key(&headers, peer)?;
    let pill = query.pill.unwrap_or_default();
    let record = state
        .attribution
        .record_visit(&device_key, &pill, state.deadline())
        .await
        .map_err(ApiError::from_attribution)?;
    tracing::info!(
        device_key = %record.device_key,
        variant = %record.variant,
        "recorded deferred deep link visit"
    );
    Ok(Json(RecordVisitResponse::recorded(&record)))
}

async fn app_visit(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    target: Result<Path<String>, PathRejection>,
    query: Result<Query<AppVisitQuery>, QueryRejection>,
) -> Result<Json<RecordVisitResponse>, ApiError> {
    let Path(target) = target.map_err(ApiError::from_path)?;
    let Query(query) = query.map_err(ApiError::from_query)?;
    let device_key = state.device_key(&headers, peer)?;
    let record = state
        .attribution
        .record_app_visit(
            &device_key,
            &target,
            query.device_type.as_deref(),
            state.deadline(),
        )
        .await
        .map_err(ApiError::from_attribution)?;
    tracing::info!(
        device_key = %record.device_key,
        target = %target,
        "recorded app-not-installed visit"
    );
    Ok(Json(RecordVisitResponse::recorded(&record)))
}

async fn defer_deep_link(
    State(state): State<AppState>,
    body: Result<Json<DeferDeepLinkRequest>, JsonRejection>,
) -> Result<Json<RecordVisitResponse>, ApiError> {
    let Json(body) = body.map_err(ApiError::from_json)?;
    let deadline = state.deadline();
    let record = match (body.pill.as_deref(), body.target.as_deref()) {
        (Some(pill), _) if !pill.trim().is_empty() => {
            state
                .attribution
                .record_visit(&body.device_id, pill, deadline)
                .await
        }
        (_, Some(target)) => {
            state
                .attribution
                .record_app_visit(
                    &body.device_id,
                    target,
                    body.device_type.as_deref(),
                    deadline,
                )
                .await
        }
        _ => Err(AttributionError::InvalidRequest(
            "pill or target is required".to_string(),
        )),
    }
    .map_err(ApiError::from_attribution)?;
    tracing::info!(
        device_key = %record.device_key,
        variant = %record.variant,
        "recorded deferred deep link from service request"
    );
    Ok(Json(RecordVisitResponse::recorded(&record)))
}

// The installed app asks for its pending attribution on first launch.
async fn query_deferred_deep_link(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
) -> Result<Json<ResolveVisitResponse>, ApiError> {
    let device_key = state.device_key(&headers, peer)?;
    resolve(&state, device_key).await
}

async fn query_deferred_deep_link_by_key(
    State(state): State<AppState>,
    device_key: Result<Path<String>, PathRejection>,
) -> Result<Json<ResolveVisitResponse>, ApiError> {
    let Path(device_key) = device_key.map_err(ApiError::from_path)?;
    resolve(&state, device_key).await
}

async fn resolve(
    state: &AppState,
    device_key: String,
) -> Result<Json<ResolveVisitResponse>, ApiError> {
    // The lookup runs on the trimmed key; echo the same key back.
    let device_key = device_key.trim().to_string();
    let record = state
        .attribution
        .resolve_visit(&device_key, state.deadline())
        .await
        .map_err(ApiError::from_attribution)?;
    tracing::debug!(
        device_key = %device_key,
        pending = record.is_some(),
        "resolved deferred deep link"
    );
    Ok(Json(ResolveVisitResponse::from_lookup(device_key, record)))
}

#[derive(Debug)]
enum ApiError {
    IdentityUnavailable(String),
    InvalidRequest(String),
    StorageUnavailable(String),
    Storage(String),
}

impl ApiError {
    fn from_identity(error: IdentityError) -> Self {
        match error {
            IdentityError::Unavailable(reason) => Self::IdentityUnavailable(reason.to_string()),
        }
    }

    fn from_attribution(error: AttributionError) -> Self {
        match error {
            AttributionError::InvalidRequest(message) => Self::InvalidRequest(message),
            AttributionError::StorageUnavailable(message) => Self::StorageUnavailable(message),
            AttributionError::Storage(message) => Self::Storage(message),
        }
    }

    fn from_json(rejection: JsonRejection) -> Self {
        Self::InvalidRequest(format!("invalid request body: {}", rejection.body_text()))
    }

    fn from_query(rejection: QueryRejection) -> Self {
        Self::InvalidRequest(format!("invalid query string: {}", rejection.body_text()))
    }

    fn from_path(rejection: PathRejection) -> Self {
        Self::InvalidRequest(format!("invalid path: {}", rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let (status, code, message) = match self {
            Self::IdentityUnavailable(message) => {
                (StatusCode::BAD_REQUEST, "identity_unavailable", message)
            }
            Self::InvalidRequest(message) => (StatusCode::BAD_REQUEST, "invalid_request", message),
            // Driver detail stays in the logs.
            Self::StorageUnavailable(reason) => {
                tracing::warn!(reason = %reason, "attribution storage unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "storage_unavailable",
                    "attribution storage is temporarily unavailable".to_string(),
                )
            }
            Self::Storage(reason) => {
                tracing::error!(reason = %reason, "attribution storage statement failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "storage_error",
                    "attribution storage request failed".to_string(),
                )
            }
        };
        (
            status,
            Json(serde_json::json!({
                "error": code,
                "message": message,
            })),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests;
