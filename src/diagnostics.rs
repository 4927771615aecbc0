//! Debug HTTP endpoint: the latest controller snapshot and a liveness probe.
use axum::{Json, Router, extract::State, routing::get};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{ControllerSnapshot, SnapshotHandle};
use crate::version::VERSION;

pub const DEFAULT_ADDR: &str = "127.0.0.1:6060";

#[derive(Error, Debug)]
pub enum DiagnosticsError {
    #[error("Failed to bind diagnostics endpoint on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Diagnostics server failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub addr: SocketAddr,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: SocketAddr::from(([127, 0, 0, 1], 6060)),
        }
    }
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    monitors: usize,
}

pub fn router(snapshots: SnapshotHandle) -> Router {
    Router::new()
        .route("/debug/stats", get(stats))
        .route("/debug/health", get(health))
        .with_state(snapshots)
}

async fn stats(State(snapshots): State<SnapshotHandle>) -> Json<ControllerSnapshot> {
    let current = snapshots.load_full();
    Json(ControllerSnapshot::clone(&current))
}

async fn health(State(snapshots): State<SnapshotHandle>) -> Json<Health> {
    let current = snapshots.load();
    Json(Health {
        status: "ok",
        version: VERSION,
        uptime_secs: current.uptime_secs,
        monitors: current.monitors,
    })
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, DiagnosticsError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| DiagnosticsError::Bind { addr, source })
}

/// Serves until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    snapshots: SnapshotHandle,
    shutdown: CancellationToken,
) -> Result<(), DiagnosticsError> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Diagnostics endpoint listening.");
    }
    axum::serve(listener, router(snapshots))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(DiagnosticsError::Serve)
}
