//! C9: Change source service. Binds one shard to an upstream URI, enforces
//! a single active subscriber per slot, and translates upstream errors
//! (e.g. `PG_ADMIN_SHUTDOWN` on handoff) into the service's own error kinds.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_postgres::error::SqlState;
use tracing::{info, warn};

use futures::StreamExt;

use crate::changemaker::{ChangeEvent, ChangeMaker, Error as ChangeMakerError};
use crate::spec::{PublishedSchema, ShardConfig};
use crate::subscriber::{self, Acker, Error as SubscriberError};
use crate::watermark::{self, one_after};

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("subscriber error: {0}")]
    Subscriber(#[from] SubscriberError),

    #[error("change maker error: {0}")]
    ChangeMaker(#[from] ChangeMakerError),

    #[error("watermark error: {0}")]
    Watermark(#[from] watermark::Error),

    /// Upstream sent `PG_ADMIN_SHUTDOWN`: a graceful handoff, not a failure.
    #[error("shutdown signal received from upstream (handoff)")]
    ShutdownSignal,

    #[error("tls error: {0}")]
    Tls(#[from] crate::tls::Error),
}

/// One `ChangeStreamMessage`, as described in §3.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChangeStreamMessage {
    Begin { commit_watermark: String },
    Data(crate::changemaker::DataChange),
    Commit { watermark: String },
    Rollback,
    ControlResetRequired,
    Status { watermark: String },
}

/// Producer-suspends-when-consumer-is-slow bounded channel.
const SUBSCRIPTION_DEPTH: usize = 256;

pub struct Subscription {
    rx: mpsc::Receiver<ChangeStreamMessage>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<ChangeStreamMessage> {
        self.rx.recv().await
    }
}

pub struct ChangeStream {
    pub changes: Subscription,
    pub acker: Acker,
}

const SLOT_DROP_RETRIES: usize = 5;
const SLOT_DROP_RETRY_SLEEP: Duration = Duration::from_secs(1);

/// `startStream(clientWatermark)`, §4.9.
pub async fn start_stream(
    admin_client: &tokio_postgres::Client,
    replication_client: tokio_postgres::Client,
    shard: &ShardConfig,
    slot_name: &str,
    initial_schema: PublishedSchema,
    ddl_detection: bool,
    client_watermark: &str,
) -> Result<ChangeStream, Error> {
    terminate_incumbent_backends(admin_client, shard).await?;
    cleanup_stale_replicas(admin_client, shard, slot_name).await?;

    let start_lexi = one_after(client_watermark)?;
    let start_lsn_int = watermark::version_from_lexi(&start_lexi)?;
    let start_lsn = crate::watermark::Lsn::from_bigint(start_lsn_int);

    // The resolved set this shard actually publishes under -- not
    // `shard.publications`, which is empty when the operator asked for the
    // default publication (`ShardConfig` §3) and the live name was decided
    // by the provisioner.
    let publications = initial_schema.publications.clone();
    let (messages, acker) =
        subscriber::subscribe(replication_client, slot_name, &publications, start_lsn).await?;

    let (tx, rx) = mpsc::channel(SUBSCRIPTION_DEPTH);

    tokio::spawn(pump(messages, acker.clone(), tx, initial_schema, shard.clone(), ddl_detection));

    Ok(ChangeStream {
        changes: Subscription { rx },
        acker,
    })
}

/// Reads the subscriber's raw message stream, routes each message through
/// the change maker, and pushes results into the bounded subscription.
async fn pump(
    messages: impl futures::Stream<Item = Result<subscriber::Message, SubscriberError>> + Unpin,
    acker: Acker,
    tx: mpsc::Sender<ChangeStreamMessage>,
    initial_schema: PublishedSchema,
    shard: ShardConfig,
    ddl_detection: bool,
) {
    let mut change_maker = ChangeMaker::new(initial_schema, shard, ddl_detection);
    let mut messages = Box::pin(messages);

    let query_client = match open_query_client().await {
        Ok(c) => c,
        Err(e) => {
            warn!("could not open schema-query client for change maker: {e}");
            return;
        }
    };

    while let Some(message) = messages.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                warn!("subscriber stream error: {e}");
                return;
            }
        };

        if let subscriber::Message::Keepalive { server_wal_end, reply_requested } = &message {
            if *reply_requested {
                let watermark = crate::watermark::version_to_lexi(server_wal_end.to_bigint());
                if tx
                    .send(ChangeStreamMessage::Status { watermark })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            continue;
        }

        for event in change_maker.make_changes(&query_client, message).await {
            let out = match event {
                ChangeEvent::Begin { commit_watermark, .. } => {
                    ChangeStreamMessage::Begin { commit_watermark }
                }
                ChangeEvent::Data(change) => ChangeStreamMessage::Data(change),
                ChangeEvent::Commit { watermark } => ChangeStreamMessage::Commit { watermark },
                ChangeEvent::Rollback => ChangeStreamMessage::Rollback,
                ChangeEvent::ControlResetRequired => ChangeStreamMessage::ControlResetRequired,
            };
            if tx.send(out).await.is_err() {
                return;
            }
        }

        if acker.keepalive().is_err() {
            return;
        }
    }
}

async fn open_query_client() -> Result<tokio_postgres::Client, Error> {
    let cfg = crate::config::config();
    Ok(crate::tls::connect(
        &cfg.general.upstream_url,
        cfg.general.tls_verify,
        cfg.general.tls_server_ca_certificate.as_deref(),
    )
    .await?)
}

/// §4.9 step 1: terminate any backend already streaming from this shard's
/// slots so a new subscriber can take over.
async fn terminate_incumbent_backends(client: &tokio_postgres::Client, shard: &ShardConfig) -> Result<(), Error> {
    let pattern = format!("{}_{}_%", shard.id.app_id, shard.id.shard_num);
    client
        .execute(
            "SELECT pg_terminate_backend(active_pid) FROM pg_replication_slots \
             WHERE slot_name LIKE $1 AND active_pid IS NOT NULL",
            &[&pattern],
        )
        .await?;
    Ok(())
}

/// §4.9 step 2: delete stale `replicas` rows other than the one we're about
/// to use, then best-effort drop their slots in the background.
async fn cleanup_stale_replicas(
    client: &tokio_postgres::Client,
    shard: &ShardConfig,
    keep_slot: &str,
) -> Result<(), Error> {
    let upstream_schema = shard.id.upstream_schema();
    let rows = client
        .query(
            &format!("SELECT slot_name FROM \"{upstream_schema}\".replicas WHERE slot_name != $1"),
            &[&keep_slot],
        )
        .await?;

    let stale: Vec<String> = rows.iter().map(|r| r.get(0)).collect();
    client
        .execute(
            &format!("DELETE FROM \"{upstream_schema}\".replicas WHERE slot_name != $1"),
            &[&keep_slot],
        )
        .await?;

    let upstream_url = crate::config::config().general.upstream_url.clone();
    for slot in stale {
        tokio::spawn(drop_slot_with_retries(upstream_url.clone(), slot));
    }

    Ok(())
}

/// Best-effort, retried slot drop per §4.9 step 2 / §5 timeouts: up to five
/// attempts, backing off on `OBJECT_IN_USE`.
async fn drop_slot_with_retries(upstream_url: String, slot: String) {
    let cfg = crate::config::config();
    let client = match crate::tls::connect(
        &upstream_url,
        cfg.general.tls_verify,
        cfg.general.tls_server_ca_certificate.as_deref(),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            warn!("could not open connection to drop stale slot {slot}: {e}");
            return;
        }
    };

    for attempt in 1..=SLOT_DROP_RETRIES {
        match client
            .execute("SELECT pg_drop_replication_slot($1)", &[&slot])
            .await
        {
            Ok(_) => {
                info!("dropped stale replication slot {slot}");
                return;
            }
            Err(e) if e.code() == Some(&SqlState::OBJECT_IN_USE) && attempt < SLOT_DROP_RETRIES => {
                sleep(SLOT_DROP_RETRY_SLEEP).await;
            }
            Err(e) => {
                warn!("failed to drop stale slot {slot} after {attempt} attempt(s): {e}");
                return;
            }
        }
    }
}

/// Translate a raw upstream error into the service's error kinds, per
/// §4.9's error translation table.
pub fn translate_error(e: tokio_postgres::Error) -> Error {
    if e.code() == Some(&SqlState::ADMIN_SHUTDOWN) {
        Error::ShutdownSignal
    } else {
        Error::Pg(e)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_translate_admin_shutdown() {
        // SqlState has no public constructor from code outside actual server
        // errors; the handoff contract is covered at the integration level
        // (testcontainers) instead. This is a placeholder asserting the
        // mapping function exists with the right shape.
        let _ = translate_error as fn(tokio_postgres::Error) -> Error;
    }
}
