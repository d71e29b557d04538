//! HTTP server bootstrap for the PDV sync service.
//!
//! This module wires together:
//! - configuration
//! - the SQLite connection pool and migrations
//! - the sync service (store, clock, reconciler)
//! - the Axum router

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::routing::get;
use axum::Router;
use chrono::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, Level};
use tracing_subscriber::EnvFilter;

use crate::clock::SystemClock;
use crate::reconcile::ConflictPolicy;
use crate::session::{SyncConfig, SyncService};
use crate::store::SqliteStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL.
    pub database_url: String,
    /// Server listen address.
    pub listen_addr: SocketAddr,
    /// Ledger retention window in days.
    pub retention_days: i64,
    /// Sync session timeout in minutes.
    pub session_timeout_minutes: i64,
    /// Conflict policy applied by the reconciler.
    pub policy: ConflictPolicy,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://pdv_sync.db?mode=rwc".to_string());

        let port: u16 = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let listen_addr: SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address {host}:{port}: {e}"))?;

        let retention_days: i64 = std::env::var("LEDGER_RETENTION_DAYS")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(30);

        let session_timeout_minutes: i64 = std::env::var("SESSION_TIMEOUT_MINUTES")
            .ok()
            .and_then(|v| v.parse().ok())
            .filter(|v| *v > 0)
            .unwrap_or(15);

        let policy = match std::env::var("CONFLICT_POLICY").as_deref() {
            Ok("client_wins") => ConflictPolicy::ClientWins,
            Ok("field_merge") => ConflictPolicy::FieldMerge,
            Ok("server_wins") | Err(_) => ConflictPolicy::ServerWins,
            Ok(other) => anyhow::bail!("unknown CONFLICT_POLICY {other:?}"),
        };

        Ok(Self {
            database_url,
            listen_addr,
            retention_days,
            session_timeout_minutes,
            policy,
        })
    }

    fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            retention: Duration::days(self.retention_days),
            session_timeout: Duration::minutes(self.session_timeout_minutes),
            policy: self.policy,
            ..SyncConfig::default()
        }
    }
}

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SyncService<SqliteStore>>,
}

/// Start the HTTP server.
pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    info!("Starting PDV sync service v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    info!("Configuration loaded");
    info!("  Listen address: {}", config.listen_addr);
    info!("  Retention: {} days", config.retention_days);
    info!("  Conflict policy: {:?}", config.policy);

    info!("Opening SQLite database...");
    let store = SqliteStore::connect(&config.database_url).await?;
    info!("Database ready");

    let service = Arc::new(SyncService::new(
        Arc::new(store),
        Arc::new(SystemClock),
        config.sync_config(),
    ));

    // Background maintenance: retention pruning and session expiry.
    let maintenance = service.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval.tick().await;
            if let Err(err) = maintenance.prune_ledger().await {
                tracing::error!(%err, "ledger pruning failed");
            }
            maintenance.expire_stale_sessions().await;
        }
    });

    let state = AppState { service };
    let app = build_router()?.with_state(state);

    info!("Starting HTTP server on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;

    info!("PDV sync service is ready to accept connections");
    axum::serve(listener, app).await?;

    Ok(())
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(Level::INFO.to_string()));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();
}

fn build_router() -> anyhow::Result<Router<AppState>> {
    let mut router = Router::new()
        .nest("/api", crate::api::router())
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http());

    if let Some(cors_layer) = cors_layer_from_env()? {
        router = router.layer(cors_layer);
    }

    Ok(router)
}

fn cors_layer_from_env() -> anyhow::Result<Option<CorsLayer>> {
    let origins = match std::env::var("CORS_ALLOW_ORIGINS") {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let origins = origins.trim();
    if origins.is_empty() {
        return Ok(None);
    }

    let allow_origin = if origins == "*" {
        AllowOrigin::any()
    } else {
        let origins: Vec<HeaderValue> = origins
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<HeaderValue>()
                    .map_err(|e| anyhow::anyhow!("Invalid CORS origin {s:?}: {e}"))
            })
            .collect::<anyhow::Result<_>>()?;
        AllowOrigin::list(origins)
    };

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE]),
    ))
}

/// Health check endpoint.
async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "healthy",
        "service": "pdv-sync",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
