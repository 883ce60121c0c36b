//! HTTP endpoint exposing Prometheus metrics and the storage status snapshot.
//!
//! Routes:
//! - `GET /metrics`: all registered metrics in the Prometheus text format
//! - `GET /status`: the current [`PostgresStatus`] as JSON

use crate::db::pool::StatPool;
use crate::db::status::{PostgresStatus, prepare_status};
use crate::error::{StoreError, StoreResult};
use crate::metrics::MetricsFactory;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Time allowed for open requests once shutdown starts.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct AppState {
    factory: MetricsFactory,
    pool: StatPool,
    shutdown: CancellationToken,
}

/// Serves `/metrics` and `/status` until the shutdown token fires.
pub struct StatusServer {
    state: AppState,
    /// Host to bind to
    host: String,
    /// Port to bind to
    port: u16,
}

impl StatusServer {
    pub fn new(
        factory: MetricsFactory,
        pool: StatPool,
        shutdown: CancellationToken,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            state: AppState {
                factory,
                pool,
                shutdown,
            },
            host: host.into(),
            port,
        }
    }

    /// Get the bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(metrics))
            .route("/status", get(status))
            .with_state(self.state.clone())
    }

    pub async fn run(&self) -> StoreResult<()> {
        let bind_addr = self.bind_addr();
        let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
            StoreError::connection(
                format!("Failed to bind to {}: {}", bind_addr, e),
                "Check that the port is available",
            )
        })?;
        info!(addr = %bind_addr, "Metrics and status endpoint ready");

        let shutdown = self.state.shutdown.clone();
        let graceful = shutdown.clone();
        let server = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { graceful.cancelled().await });

        tokio::select! {
            result = server => {
                if let Err(e) = result {
                    error!(error = %e, "HTTP server error");
                    return Err(StoreError::internal(format!("HTTP server error: {}", e)));
                }
                info!("HTTP server stopped");
            }
            _ = async {
                shutdown.cancelled().await;
                tokio::time::sleep(GRACEFUL_TIMEOUT).await;
            } => {
                warn!("Graceful shutdown timeout, forcing exit");
            }
        }
        Ok(())
    }
}

async fn metrics(State(state): State<AppState>) -> Response {
    match state.factory.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn status(State(state): State<AppState>) -> Json<PostgresStatus> {
    let scope = state.shutdown.child_token();
    Json(prepare_status(&state.pool, &scope).await)
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
pub async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
