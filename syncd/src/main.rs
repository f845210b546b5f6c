//! syncd: Postgres change source and embedded replica synchronization core.
//!
//! Provisions a shard, runs initial sync when the local replica is empty,
//! then streams ordered, committed changes to stdout as newline-delimited
//! JSON for a downstream process to consume.

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use syncd::catalog;
use syncd::cli::{self, Commands};
use syncd::config::{self, Overrides};
use syncd::initial_sync;
use syncd::metrics::{self, Health};
use syncd::provisioner;
use syncd::replica::Replica;
use syncd::service::{self, ChangeStreamMessage};
use syncd::spec::{PublishedSchema, ShardConfig, ShardId};
use syncd::subscriber;
use syncd::tls;
use syncd::watermark;

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    syncd::logger();

    let args = cli::Cli::parse();
    config::load(&args.config)?;
    config::overrides(Overrides {
        upstream_url: args.upstream_url,
        replica_path: args.replica_path,
    });

    let cfg = config::config();
    let shard = ShardConfig {
        id: ShardId::new(cfg.shard.app_id.clone(), cfg.shard.shard_num)?,
        publications: cfg.shard.publications.clone(),
    };
    shard.validate()?;

    let admin_client = tls::connect(
        &cfg.general.upstream_url,
        cfg.general.tls_verify,
        cfg.general.tls_server_ca_certificate.as_deref(),
    )
    .await?;

    catalog::check_server_requirements(&admin_client).await?;

    match args.command {
        Some(Commands::Provision) => {
            let provisioned = provisioner::provision(&admin_client, &shard).await?;
            info!(
                ddl_detection = provisioned.ddl_detection,
                publications = ?provisioned.publications,
                "shard provisioned"
            );
        }
        Some(Commands::DropShard) => {
            provisioner::drop_shard(&admin_client, &shard).await?;
            info!("shard dropped");
        }
        Some(Commands::Run) | None => {
            run(admin_client, shard).await?;
        }
    }

    Ok(())
}

/// Top-level service loop: sync (if needed), stream, and on an `AUTO_RESET`
/// signal or a handoff, drop the local replica (only on reset) and restart.
async fn run(admin_client: tokio_postgres::Client, shard: ShardConfig) -> Result<(), Box<dyn std::error::Error>> {
    let health = Arc::new(Health::default());

    if let Some(addr) = config::config().general.metrics_addr.clone() {
        let health = health.clone();
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(addr.parse().expect("valid metrics_addr"), health).await {
                warn!("metrics server exited: {e}");
            }
        });
    }

    loop {
        let cfg = config::config();
        let general = cfg.general.clone();

        let replica = Replica::open(&general.replica_path)?;
        replica.init_internal_tables()?;

        let (replica_version, initial_schema, ddl_detection, slot_name) =
            match replica.state_version() {
                Ok(version) => match resume(&admin_client, &shard, &version).await? {
                    Some(resumed) => resumed,
                    None => {
                        warn!("local replica has no matching upstream replica row; resyncing from scratch");
                        drop(replica);
                        std::fs::remove_file(&general.replica_path).ok();
                        sync(&admin_client, &shard, &general).await?
                    }
                },
                Err(syncd::replica::Error::NotInitialized) => {
                    drop(replica);
                    sync(&admin_client, &shard, &general).await?
                }
                Err(e) => return Err(e.into()),
            };

        let replication_client = subscriber::connect(
            cfg.general.upstream_url.parse()?,
            general.tls_verify,
            general.tls_server_ca_certificate.as_deref(),
        )
        .await?;

        let stream = service::start_stream(
            &admin_client,
            replication_client,
            &shard,
            &slot_name,
            initial_schema,
            ddl_detection,
            &replica_version,
        )
        .await?;

        health.mark_streaming();
        let outcome = drain(stream).await;
        health.mark_stopped();

        match outcome {
            Drained::Reset => {
                warn!("control-reset-required received; dropping local replica and resyncing");
                std::fs::remove_file(&general.replica_path).ok();
                continue;
            }
            Drained::Closed => {
                warn!("change stream closed; restarting subscription");
                continue;
            }
        }
    }
}

/// Looks up the slot this replica was created with and re-derives the
/// published schema from the live catalog (the same source of truth the
/// change maker itself re-queries on every DDL event).
async fn resume(
    admin_client: &tokio_postgres::Client,
    shard: &ShardConfig,
    replica_version: &str,
) -> Result<Option<(String, PublishedSchema, bool, String)>, Box<dyn std::error::Error>> {
    let upstream_schema = shard.id.upstream_schema();

    let slot_row = admin_client
        .query_opt(
            &format!(
                "SELECT slot_name FROM \"{upstream_schema}\".replicas WHERE replica_version = $1"
            ),
            &[&replica_version],
        )
        .await?;
    let Some(slot_row) = slot_row else {
        return Ok(None);
    };
    let slot_name: String = slot_row.get(0);

    let config_row = admin_client
        .query_one(
            &format!(
                "SELECT ddl_detection, publications FROM \"{upstream_schema}\".shard_config"
            ),
            &[],
        )
        .await?;
    let ddl_detection: bool = config_row.get(0);
    let publications: Vec<String> = config_row.get(1);

    let schema = catalog::get_publication_info(admin_client, &publications).await?;
    let app_schema = shard.id.app_schema();
    for table in &schema.tables {
        for warning in catalog::validate(table, &app_schema, &upstream_schema)? {
            warn!(table = %table.qualified_name(), "{warning}");
        }
    }

    Ok(Some((
        replica_version.to_string(),
        schema,
        ddl_detection,
        slot_name,
    )))
}

async fn sync(
    admin_client: &tokio_postgres::Client,
    shard: &ShardConfig,
    general: &config::General,
) -> Result<(String, PublishedSchema, bool, String), Box<dyn std::error::Error>> {
    let replication_client = subscriber::connect(
        general.upstream_url.parse()?,
        general.tls_verify,
        general.tls_server_ca_certificate.as_deref(),
    )
    .await?;

    let result = initial_sync::run(
        admin_client,
        &replication_client,
        &general.upstream_url,
        shard,
        &general.replica_path,
        general.sync_workers,
        general.cursor_batch_size as i32,
        general.insert_batch_size,
    )
    .await?;

    let upstream_schema = shard.id.upstream_schema();
    let slot_name: String = admin_client
        .query_one(
            &format!(
                "SELECT slot_name FROM \"{upstream_schema}\".replicas WHERE replica_version = $1"
            ),
            &[&result.replica_version],
        )
        .await?
        .get(0);

    Ok((result.replica_version, result.initial_schema, result.ddl_detection, slot_name))
}

enum Drained {
    Reset,
    Closed,
}

/// Drains one change stream to stdout as NDJSON, acking the last observed
/// commit watermark whenever the server requests a status reply. There is
/// no separate downstream consumer process in this binary, so every commit
/// is taken as implicitly applied the moment it is relayed.
async fn drain(mut stream: service::ChangeStream) -> Drained {
    let mut last_commit_watermark: Option<String> = None;

    while let Some(message) = stream.changes.recv().await {
        match &message {
            ChangeStreamMessage::Commit { watermark } => {
                last_commit_watermark = Some(watermark.clone());
                metrics::CHANGES_APPLIED.with_label_values(&["_", "commit"]).inc();
            }
            ChangeStreamMessage::Data(_) => {
                metrics::CHANGES_APPLIED.with_label_values(&["_", "data"]).inc();
            }
            ChangeStreamMessage::ControlResetRequired => {
                return Drained::Reset;
            }
            ChangeStreamMessage::Status { watermark } => {
                if let Some(lsn) = watermark::version_from_lexi(watermark).ok() {
                    metrics::REPLICATION_LAG_LSN.with_label_values(&["_"]).set(lsn as i64);
                }
                if let Some(ack_at) = &last_commit_watermark {
                    if let Err(e) = stream.acker.ack(ack_at) {
                        error!("failed to ack watermark {ack_at}: {e}");
                        return Drained::Closed;
                    }
                }
                continue;
            }
            _ => {}
        }

        match serde_json::to_string(&message) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("failed to serialize change message: {e}"),
        }
    }

    Drained::Closed
}
