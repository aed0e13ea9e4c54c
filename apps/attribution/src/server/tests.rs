use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{Method, Request, StatusCode},
};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use super::{AppState, build_router};
use crate::{
    attribution::{
        AttributionRecord, AttributionService, AttributionStore, AttributionStoreError,
        store::MemoryAttributionStore,
    },
    config::Config,
    identity::IdentityFallback,
};

fn test_config(mutate_config: impl FnOnce(&mut Config)) -> Result<Config> {
    let mut config = Config::from_lookup(|_| None)?;
    config.service_name = "deeplink-attribution-test".to_string();
    config.build_sha = "test".to_string();
    mutate_config(&mut config);
    Ok(config)
}

fn build_test_router_with_config(
    mutate_config: impl FnOnce(&mut Config),
) -> Result<(axum::Router, Arc<MemoryAttributionStore>)> {
    let config = test_config(mutate_config)?;
    let store = Arc::new(MemoryAttributionStore::default());
    let service = AttributionService::new(
        store.clone(),
        config.allowed_variants.clone(),
        config.default_device_type.clone(),
    );
    let state = AppState::new(config, Arc::new(service));
    Ok((build_router(state), store))
}

fn build_test_router_with_store(store: Arc<dyn AttributionStore>) -> Result<axum::Router> {
    let config = test_config(|_| {})?;
    let service = AttributionService::new(
        store,
        config.allowed_variants.clone(),
        config.default_device_type.clone(),
    );
    Ok(build_router(AppState::new(config, Arc::new(service))))
}

fn test_router() -> Result<(axum::Router, Arc<MemoryAttributionStore>)> {
    build_test_router_with_config(|_| {})
}

async fn response_json(response: axum::response::Response) -> Result<Value> {
    let collected = response.into_body().collect().await?;
    let bytes = collected.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

fn get_from(uri: &str, forwarded_for: &str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("x-forwarded-for", forwarded_for)
        .body(Body::empty())?)
}

#[tokio::test]
async fn health_and_readiness_endpoints_are_available() -> Result<()> {
    let (app, _) = test_router()?;

    let health = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty())?)
        .await?;
    let readiness = app
        .oneshot(Request::builder().uri("/readyz").body(Body::empty())?)
        .await?;

    assert_eq!(health.status(), StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));
    let health_json = response_json(health).await?;
    assert_eq!(health_json["store_driver"], "memory");
    assert_eq!(health_json["identity_fallback"], "reject");
    assert_eq!(readiness.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn landing_page_visit_is_resolved_by_the_installed_app() -> Result<()> {
    let (app, store) = test_router()?;

    let saved = app
        .clone()
        .oneshot(get_from("/save?pill=blue", "198.51.100.9, 10.0.0.1")?)
        .await?;
    assert_eq!(saved.status(), StatusCode::OK);
    let saved_json = response_json(saved).await?;
    assert_eq!(saved_json["status"], "recorded");
    assert_eq!(saved_json["device_key"], "198.51.100.9");
    assert_eq!(saved_json["variant"], "blue");

    let resolved = app
        .clone()
        .oneshot(get_from("/queryDeferredDeepLinks", "198.51.100.9")?)
        .await?;
    assert_eq!(resolved.status(), StatusCode::OK);
    assert_eq!(response_json(resolved).await?["variant"], "blue");

    let overwritten = app
        .clone()
        .oneshot(get_from("/save?pill=red", "198.51.100.9")?)
        .await?;
    assert_eq!(overwritten.status(), StatusCode::OK);

    let resolved = app
        .oneshot(get_from("/queryDeferredDeepLinks", "198.51.100.9")?)
        .await?;
    assert_eq!(response_json(resolved).await?["variant"], "red");
    assert_eq!(store.len().await, 1);
    Ok(())
}

#[tokio::test]
async fn resolve_without_pending_attribution_returns_null_variant() -> Result<()> {
    let (app, _) = test_router()?;
    let response = app
        .oneshot(get_from("/queryDeferredDeepLinks", "192.0.2.77")?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await?;
    assert_eq!(json["device_key"], "192.0.2.77");
    assert_eq!(json["variant"], Value::Null);
    Ok(())
}

#[tokio::test]
async fn missing_forwarded_header_is_rejected_by_default() -> Result<()> {
    let (app, store) = test_router()?;
    let response = app
        .oneshot(
            Request::builder()
                .uri("/save?pill=red")
                .extension(ConnectInfo(SocketAddr::from(([192, 0, 2, 10], 40_000))))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = response_json(response).await?;
    assert_eq!(json["error"], "identity_unavailable");
    assert!(store.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn empty_first_forwarded_entry_is_rejected() -> Result<()> {
    let (app, _) = test_router()?;
    let response = app
        .oneshot(get_from("/queryDeferredDeepLinks", ", 10.0.0.1")?)
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(response).await?["error"], "identity_unavailable");
    Ok(())
}

#[tokio::test]
async fn peer_fallback_records_against_transport_address() -> Result<()> {
    let (app, store) = build_test_router_with_config(|config| {
        config.identity_fallback = IdentityFallback::PeerAddress;
    })?;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/save?pill=red")
                .extension(ConnectInfo(SocketAddr::from(([192, 0, 2, 10], 40_000))))
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await?["device_key"], "192.0.2.10");
    assert_eq!(store.len().await, 1);

    let no_peer = app
        .oneshot(Request::builder().uri("/save?pill=red").body(Body::empty())?)
        .await?;
    assert_eq!(no_peer.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn unknown_or_missing_pill_is_an_invalid_request() -> Result<()> {
    let (app, store) = test_router()?;

    let unknown = app
        .clone()
        .oneshot(get_from("/save?pill=green", "198.51.100.4")?)
        .await?;
    assert_eq!(unknown.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response_json(unknown).await?["error"], "invalid_request");

    let missing = app.oneshot(get_from("/save", "198.51.100.4")?).await?;
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
    assert!(store.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn app_route_records_target_and_device_type() -> Result<()> {
    let (app, _) = test_router()?;

    let response = app
        .clone()
        .oneshot(get_from("/app/summer-sale", "203.0.113.5, 10.0.0.1")?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let json = response_json(response).await?;
    assert_eq!(json["variant"], "summer-sale");
    assert_eq!(json["target"], "summer-sale");

    let resolved = app
        .clone()
        .oneshot(get_from("/queryDeferredDeepLinks", "203.0.113.5")?)
        .await?;
    let json = response_json(resolved).await?;
    assert_eq!(json["target"], "summer-sale");
    assert_eq!(json["device_type"], "Android");

    let ios = app
        .clone()
        .oneshot(get_from("/app/winter-sale?device_type=iOS", "203.0.113.5")?)
        .await?;
    assert_eq!(ios.status(), StatusCode::OK);
    let resolved = app
        .oneshot(get_from("/queryDeferredDeepLinks", "203.0.113.5")?)
        .await?;
    let json = response_json(resolved).await?;
    assert_eq!(json["variant"], "winter-sale");
    assert_eq!(json["device_type"], "iOS");
    Ok(())
}

#[tokio::test]
async fn service_record_accepts_device_id_and_legacy_user_ip() -> Result<()> {
    let (app, store) = test_router()?;

    let pill = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/deferDeepLink")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({
                    "device_id": "198.51.100.50",
                    "pill": "red"
                }))?))?,
        )
        .await?;
    assert_eq!(pill.status(), StatusCode::OK);

    let target = app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/deferDeepLink")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({
                    "user_ip": "198.51.100.51",
                    "target": "onboarding",
                    "device_type": "Android"
                }))?))?,
        )
        .await?;
    assert_eq!(target.status(), StatusCode::OK);
    assert_eq!(response_json(target).await?["variant"], "onboarding");

    let by_key = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/queryDeferredDeepLinks/198.51.100.50")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(response_json(by_key).await?["variant"], "red");

    let neither = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/deferDeepLink")
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(&json!({
                    "device_id": "198.51.100.52"
                }))?))?,
        )
        .await?;
    assert_eq!(neither.status(), StatusCode::BAD_REQUEST);
    assert_eq!(store.len().await, 2);
    Ok(())
}

#[tokio::test]
async fn concurrent_saves_for_one_device_leave_one_row() -> Result<()> {
    let (app, store) = test_router()?;

    let mut handles = Vec::new();
    for pill in ["red", "blue", "red", "blue", "red", "blue"] {
        let app = app.clone();
        let request = get_from(&format!("/save?pill={pill}"), "198.51.100.99")?;
        handles.push(tokio::spawn(async move { app.oneshot(request).await }));
    }
    for handle in handles {
        assert_eq!(handle.await??.status(), StatusCode::OK);
    }

    assert_eq!(store.len().await, 1);
    let resolved = app
        .oneshot(get_from("/queryDeferredDeepLinks", "198.51.100.99")?)
        .await?;
    let variant = response_json(resolved).await?["variant"].clone();
    assert!(variant == "red" || variant == "blue");
    Ok(())
}

fn post_json(uri: &str, body: &'static str) -> Result<Request<Body>> {
    Ok(Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body))?)
}

#[tokio::test]
async fn malformed_service_bodies_get_the_json_error_shape() -> Result<()> {
    let (app, store) = test_router()?;

    for body in [r#"{"device_id": 5"#, r#"{"device_id": 5, "pill": "red"}"#, "[]"] {
        let response = app.clone().oneshot(post_json("/deferDeepLink", body)?).await?;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {body}");
        let json = response_json(response).await?;
        assert_eq!(json["error"], "invalid_request");
        assert!(json["message"].as_str().is_some_and(|message| !message.is_empty()));
    }

    let without_content_type = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/deferDeepLink")
                .body(Body::from(r#"{"device_id": "198.51.100.5", "pill": "red"}"#))?,
        )
        .await?;
    assert_eq!(without_content_type.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        response_json(without_content_type).await?["error"],
        "invalid_request"
    );
    assert!(store.is_empty().await);
    Ok(())
}

#[tokio::test]
async fn lookup_by_key_echoes_the_trimmed_key() -> Result<()> {
    let (app, _) = test_router()?;

    let absent = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/queryDeferredDeepLinks/%20k%20")
                .body(Body::empty())?,
        )
        .await?;
    assert_eq!(absent.status(), StatusCode::OK);
    let json = response_json(absent).await?;
    assert_eq!(json["device_key"], "k");
    assert_eq!(json["variant"], Value::Null);

    let recorded = app
        .clone()
        .oneshot(post_json(
            "/deferDeepLink",
            r#"{"device_id": "k", "pill": "blue"}"#,
        )?)
        .await?;
    assert_eq!(recorded.status(), StatusCode::OK);

    let present = app
        .oneshot(
            Request::builder()
                .uri("/queryDeferredDeepLinks/%20k")
                .body(Body::empty())?,
        )
        .await?;
    let json = response_json(present).await?;
    assert_eq!(json["device_key"], "k");
    assert_eq!(json["variant"], "blue");
    Ok(())
}

struct FailingStore {
    error: AttributionStoreError,
}

#[async_trait::async_trait]
impl AttributionStore for FailingStore {
    fn driver_name(&self) -> &'static str {
        "failing"
    }

    async fn record_visit(&self, _record: AttributionRecord) -> Result<(), AttributionStoreError> {
        Err(self.error.clone())
    }

    async fn resolve_visit(
        &self,
        _device_key: &str,
    ) -> Result<Option<AttributionRecord>, AttributionStoreError> {
        Err(self.error.clone())
    }

    async fn ping(&self) -> Result<(), AttributionStoreError> {
        Err(self.error.clone())
    }
}

#[tokio::test]
async fn storage_failures_do_not_leak_driver_detail() -> Result<()> {
    let detail = "db error: relation \"deferred_deep_links\" does not exist";
    let cases = [
        (
            AttributionStoreError::Storage(detail.to_string()),
            StatusCode::INTERNAL_SERVER_ERROR,
            "storage_error",
        ),
        (
            AttributionStoreError::StorageUnavailable(detail.to_string()),
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
        ),
    ];

    for (error, status, code) in cases {
        let app = build_test_router_with_store(Arc::new(FailingStore { error }))?;
        let response = app
            .oneshot(get_from("/queryDeferredDeepLinks", "198.51.100.9")?)
            .await?;
        assert_eq!(response.status(), status);
        let json = response_json(response).await?;
        assert_eq!(json["error"], code);
        let message = json["message"].as_str().unwrap_or_default();
        assert!(!message.is_empty());
        assert!(!message.contains("relation"), "message {message}");
    }
    Ok(())
}
