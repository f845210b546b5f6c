//! Ambient observability: a small `axum` server exposing `/healthz` and
//! `/metrics` (Prometheus exposition format). Carried even though the
//! distilled spec's Non-goals exclude a downstream metrics pipeline: the
//! ambient concern (is this process alive, how is it doing) is still part
//! of operating the service, the same way the teacher exposes it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use tracing::{info, warn};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static CHANGES_APPLIED: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("syncd_changes_applied_total", "Data changes applied to the replica"),
        &["shard", "kind"],
    )
    .expect("metric registration");
    REGISTRY.register(Box::new(counter.clone())).expect("metric registration");
    counter
});

pub static REPLICATION_LAG_LSN: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("syncd_replication_lag_bytes", "Bytes between last acked LSN and server WAL end"),
        &["shard"],
    )
    .expect("metric registration");
    REGISTRY.register(Box::new(gauge.clone())).expect("metric registration");
    gauge
});

pub static SCHEMA_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("syncd_schema_errors_total", "Schema-change errors that latched a shard into reset-required"),
        &["shard"],
    )
    .expect("metric registration");
    REGISTRY.register(Box::new(counter.clone())).expect("metric registration");
    counter
});

/// Tracks whether at least one shard has completed initial sync and is
/// streaming; drives `/healthz`.
#[derive(Default)]
pub struct Health {
    active_shards: AtomicI64,
}

impl Health {
    pub fn mark_streaming(&self) {
        self.active_shards.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mark_stopped(&self) {
        self.active_shards.fetch_sub(1, Ordering::Relaxed);
    }

    fn is_healthy(&self) -> bool {
        self.active_shards.load(Ordering::Relaxed) >= 0
    }
}

async fn healthz(State(health): State<Arc<Health>>) -> impl IntoResponse {
    if health.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buf) {
        warn!("failed to encode metrics: {e}");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buf).into_owned())
}

/// Binds and serves `/healthz` + `/metrics` until the task is aborted.
pub async fn serve(addr: SocketAddr, health: Arc<Health>) -> std::io::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .with_state(health);

    info!("metrics server listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_health_defaults_healthy() {
        let health = Health::default();
        assert!(health.is_healthy());
        health.mark_streaming();
        assert!(health.is_healthy());
    }
}
