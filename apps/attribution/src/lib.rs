#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::{
    attribution::{AttributionService, store},
    config::{Config, LogFormat},
    db::AttributionDb,
    server::{AppState, build_router},
};

pub mod attribution;
pub mod client;
pub mod config;
pub mod db;
pub mod identity;
pub mod server;

pub async fn build_app_state(config: Config) -> Result<AppState> {
    let store = match config.db_url.as_deref() {
        Some(url) => {
            let db = AttributionDb::connect(url, config.db_pool.clone()).await?;
            let store = store::postgres(db, &config.table)
                .await
                .with_context(|| format!("prepare attribution table {}", config.table))?;
            info!(
                table = %config.table,
                max_connections = config.db_pool.max_connections,
                max_idle_connections = config.db_pool.max_idle_connections,
                "attribution store connected to postgres"
            );
            store
        }
        None => {
            warn!("DB_URL not set; attribution records are kept in process memory");
            store::memory()
        }
    };
    let attribution = Arc::new(AttributionService::new(
        store,
        config.allowed_variants.clone(),
        config.default_device_type.clone(),
    ));
    Ok(AppState::new(config, attribution))
}

pub async fn build_app(config: Config) -> Result<axum::Router> {
    Ok(build_router(build_app_state(config).await?))
}

pub async fn serve(config: Config) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    info!(
        service = %config.service_name,
        bind_addr = %config.bind_addr,
        identity_fallback = config.identity_fallback.as_str(),
        "attribution service listening"
    );
    let app = build_app(config).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("attribution service shut down");
    Ok(())
}

pub fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(reason = %error, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                warn!(reason = %error, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown signal received");
}
