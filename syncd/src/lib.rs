//! Change source and replica synchronization core: mirrors a subset of a
//! Postgres database into a local embedded SQL store and streams ordered,
//! committed changes downstream.

pub mod catalog;
pub mod changemaker;
pub mod cli;
pub mod config;
pub mod initial_sync;
pub mod metrics;
pub mod provisioner;
pub mod replica;
pub mod service;
pub mod spec;
pub mod subscriber;
pub mod tls;
pub mod util;
pub mod watermark;

use tracing_subscriber::EnvFilter;

/// Initialize structured logging. Respects `RUST_LOG`; defaults to `info`
/// for this crate and `warn` for dependencies.
pub fn logger() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn,syncd=info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}
