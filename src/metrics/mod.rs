mod tracker;

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, routing::get, Router as HttpRouter};
use once_cell::sync::Lazy;
use prometheus::{
    opts, register_gauge_vec, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Encoder, GaugeVec, HistogramVec, IntCounter, IntCounterVec,
    TextEncoder,
};
use tokio::net::TcpListener;
use tracing::info;

pub use tracker::Tracker;

static FRONT_CONNECTIONS: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        opts!("shoal_front_connection", "currently open client connections"),
        &["cluster"]
    )
    .expect("front connection gauge registration must succeed")
});

static FRONT_CONNECTION_INCR: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "shoal_front_connection_incr",
            "client connections accepted since start"
        ),
        &["cluster"]
    )
    .expect("front connection counter registration must succeed")
});

static GLOBAL_ERROR: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(opts!("shoal_global_error", "global error counter"))
        .expect("global error counter registration must succeed")
});

static BACKEND_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "shoal_backend_error_total",
            "backend connection failures by cluster and node"
        ),
        &["cluster", "backend"]
    )
    .expect("backend error counter registration must succeed")
});

static MIGRATE_RETRIES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        opts!(
            "shoal_migrate_retry_total",
            "semi-async migrate attempts that had to be retried"
        ),
        &["cluster"]
    )
    .expect("migrate retry counter registration must succeed")
});

static TOTAL_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "shoal_total_timer",
        "time from decode to reply per cluster, microseconds",
        &["cluster"],
        vec![1_000.0, 10_000.0, 40_000.0, 100_000.0, 200_000.0]
    )
    .expect("total timer histogram registration must succeed")
});

static REMOTE_TIMER: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "shoal_remote_timer",
        "backend round trip time per cluster, microseconds",
        &["cluster"],
        vec![1_000.0, 10_000.0, 100_000.0]
    )
    .expect("remote timer histogram registration must succeed")
});

pub fn front_conn_open(cluster: &str) {
    FRONT_CONNECTIONS.with_label_values(&[cluster]).inc();
    FRONT_CONNECTION_INCR.with_label_values(&[cluster]).inc();
}

pub fn front_conn_close(cluster: &str) {
    FRONT_CONNECTIONS.with_label_values(&[cluster]).dec();
}

pub fn global_error_incr() {
    GLOBAL_ERROR.inc();
}

pub fn backend_error_incr(cluster: &str, backend: &str) {
    BACKEND_ERRORS.with_label_values(&[cluster, backend]).inc();
}

pub fn migrate_retry_incr(cluster: &str) {
    MIGRATE_RETRIES.with_label_values(&[cluster]).inc();
}

pub fn observe_total(cluster: &str, micros: f64) {
    TOTAL_TIMER.with_label_values(&[cluster]).observe(micros);
}

pub fn remote_tracker(cluster: &str) -> Tracker {
    Tracker::new(REMOTE_TIMER.with_label_values(&[cluster]))
}

/// Connection-count guard for a client session.
pub struct FrontConnectionGuard {
    cluster: String,
}

impl FrontConnectionGuard {
    pub fn new(cluster: &str) -> Self {
        front_conn_open(cluster);
        Self {
            cluster: cluster.to_string(),
        }
    }
}

impl Drop for FrontConnectionGuard {
    fn drop(&mut self) {
        front_conn_close(&self.cluster);
    }
}

/// Serve the Prometheus exposition endpoint.
pub async fn serve_exporter(addr: SocketAddr) -> Result<()> {
    let app = HttpRouter::new().route("/metrics", get(render));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics endpoint {addr}"))?;
    info!(%addr, "metrics exporter listening");
    axum::serve(listener, app)
        .await
        .context("metrics exporter terminated")
}

async fn render() -> impl IntoResponse {
    let families = prometheus::gather();
    let mut out = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&families, &mut out).is_err() {
        out.clear();
    }
    ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], out)
}
