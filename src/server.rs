//! HTTP surface for liveness, readiness, status and Prometheus metrics.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::header,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use eyre::Result;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::info;

/// Bridge statistics shared between the orchestrator and the HTTP server.
#[derive(Debug, Default, Clone)]
pub struct BridgeStats {
    pub role: String,
    pub synced: bool,
    pub last_evm_height: u64,
    pub pending_withdrawals: usize,
    pub known_memos: usize,
}

pub struct Metrics {
    pub deposits_observed_total: IntCounter,
    pub mints_submitted_total: IntCounterVec,
    pub payouts_submitted_total: IntCounterVec,
    pub refunds_submitted_total: IntCounterVec,
    pub quorum_failures_total: IntCounter,
    pub last_evm_height: IntGauge,
    pub pending_withdrawals: IntGauge,
    pub up: IntGauge,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let deposits_observed_total = IntCounter::new(
            "bridge_deposits_observed_total",
            "Total number of deposits observed on the bridge Stellar account",
        )
        .expect("constant metric name is valid");

        let mints_submitted_total = IntCounterVec::new(
            Opts::new(
                "bridge_mints_submitted_total",
                "Total number of mint submissions by status",
            ),
            &["status"],
        )
        .expect("constant metric name is valid");

        let payouts_submitted_total = IntCounterVec::new(
            Opts::new(
                "bridge_payouts_submitted_total",
                "Total number of Stellar payout submissions by status",
            ),
            &["status"],
        )
        .expect("constant metric name is valid");

        let refunds_submitted_total = IntCounterVec::new(
            Opts::new(
                "bridge_refunds_submitted_total",
                "Total number of Stellar refund submissions by status",
            ),
            &["status"],
        )
        .expect("constant metric name is valid");

        let quorum_failures_total = IntCounter::new(
            "bridge_quorum_failures_total",
            "Signing rounds that ended without the required signature count",
        )
        .expect("constant metric name is valid");

        let last_evm_height = IntGauge::new(
            "bridge_last_evm_height",
            "Last EVM head processed by the dispatcher",
        )
        .expect("constant metric name is valid");

        let pending_withdrawals = IntGauge::new(
            "bridge_pending_withdrawals",
            "Withdrawals buffered while awaiting confirmation depth",
        )
        .expect("constant metric name is valid");

        let up = IntGauge::new("bridge_up", "Whether the bridge is up and running")
            .expect("constant metric name is valid");

        registry
            .register(Box::new(deposits_observed_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(mints_submitted_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(payouts_submitted_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(refunds_submitted_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(quorum_failures_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(last_evm_height.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(pending_withdrawals.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(up.clone()))
            .expect("metric registration must not be called twice");

        Self {
            deposits_observed_total,
            mints_submitted_total,
            payouts_submitted_total,
            refunds_submitted_total,
            quorum_failures_total,
            last_evm_height,
            pending_withdrawals,
            up,
            registry,
        }
    }
}

pub type SharedStats = Arc<RwLock<BridgeStats>>;
pub type SharedMetrics = Arc<Metrics>;

#[derive(Clone)]
pub struct AppState {
    pub stats: SharedStats,
    pub metrics: SharedMetrics,
}

#[derive(Serialize)]
struct StatusResponse {
    status: String,
    role: String,
    synced: bool,
    last_evm_height: u64,
    pending_withdrawals: usize,
    known_memos: usize,
}

async fn liveness() -> &'static str {
    "OK"
}

async fn readiness(State(state): State<AppState>) -> &'static str {
    let stats = state.stats.read().await;
    if stats.last_evm_height > 0 || stats.known_memos > 0 {
        "OK"
    } else {
        "NOT_READY"
    }
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    let stats = state.stats.read().await;
    Json(StatusResponse {
        status: "ok".to_string(),
        role: stats.role.clone(),
        synced: stats.synced,
        last_evm_height: stats.last_evm_height,
        pending_withdrawals: stats.pending_withdrawals,
        known_memos: stats.known_memos,
    })
}

async fn prometheus_metrics(State(state): State<AppState>) -> Response {
    let stats = state.stats.read().await;
    state.metrics.last_evm_height.set(stats.last_evm_height as i64);
    state
        .metrics
        .pending_withdrawals
        .set(stats.pending_withdrawals as i64);
    drop(stats);

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry.gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build response",
        )
            .into_response(),
    }
}

/// Serve the API until the process exits.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    state.metrics.up.set(1);

    let app = Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .route("/status", get(status))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    axum::serve(listener, app).await?;
    Ok(())
}
