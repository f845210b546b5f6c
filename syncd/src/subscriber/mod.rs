//! C7: Logical replication subscriber.
//!
//! Opens a replication-mode connection, issues `START_REPLICATION`, and
//! decodes `pgoutput` messages into the tagged [`Message`] variants the
//! change maker (C8) consumes. Grounded on the `tokio-postgres` +
//! `postgres-replication` client shape (connect in `ReplicationMode::Logical`,
//! `copy_both_simple` wrapped in `LogicalReplicationStream`) rather than a
//! bespoke wire decoder, since no such decoder was available to carry
//! forward; see `DESIGN.md`.

use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use postgres_replication::protocol::{
    LogicalReplicationMessage as WireMessage, ReplicationMessage, TupleData as WireTupleData,
};
use postgres_replication::LogicalReplicationStream;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_postgres::config::ReplicationMode;
use tokio_postgres::types::PgLsn;
use tokio_postgres::{Client, SimpleQueryMessage};
use tracing::{debug, warn};

use crate::config::TlsVerifyMode;
use crate::watermark::{self, Lexi, Lsn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("watermark error: {0}")]
    Watermark(#[from] watermark::Error),

    #[error("replication stream ended unexpectedly")]
    StreamClosed,

    #[error("tls error: {0}")]
    Tls(#[from] crate::tls::Error),
}

/// One column value as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub enum TupleValue {
    Null,
    UnchangedToast,
    Text(Vec<u8>),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Tuple {
    pub columns: Vec<TupleValue>,
}

#[derive(Debug, Clone)]
pub struct RelationColumn {
    pub name: String,
    pub type_oid: u32,
    pub key: bool,
}

/// A decoded `pgoutput` message, tagged the way §4.7 of the sync contract
/// describes.
#[derive(Debug, Clone)]
pub enum Message {
    Begin {
        commit_lsn: Lsn,
        xid: u32,
    },
    Insert {
        rel_id: u32,
        new: Tuple,
    },
    Update {
        rel_id: u32,
        key: Option<Tuple>,
        old: Option<Tuple>,
        new: Tuple,
    },
    Delete {
        rel_id: u32,
        key: Option<Tuple>,
        old: Option<Tuple>,
    },
    Truncate {
        rel_ids: Vec<u32>,
    },
    Relation {
        oid: u32,
        schema: String,
        name: String,
        replica_identity: char,
        columns: Vec<RelationColumn>,
    },
    Type {
        id: u32,
        namespace: String,
        name: String,
    },
    Origin {
        name: String,
    },
    LogicalMessage {
        transactional: bool,
        prefix: String,
        content: Vec<u8>,
    },
    Commit {
        commit_lsn: Lsn,
    },
    /// A primary keepalive. `reply_requested` mirrors the server's request
    /// bit; the consumer decides whether to `ack` or let the [`Acker`]'s
    /// timer cover it.
    Keepalive {
        server_wal_end: Lsn,
        reply_requested: bool,
    },
}

fn tuple_from_wire(t: &WireTupleData) -> Tuple {
    let columns = t
        .tuple_data()
        .iter()
        .map(|c| match c {
            postgres_replication::protocol::TupleDataType::Null => TupleValue::Null,
            postgres_replication::protocol::TupleDataType::UnchangedToast => {
                TupleValue::UnchangedToast
            }
            postgres_replication::protocol::TupleDataType::Text(bytes) => {
                TupleValue::Text(bytes.to_vec())
            }
        })
        .collect();
    Tuple { columns }
}

fn decode(msg: WireMessage) -> Result<Message, Error> {
    Ok(match msg {
        WireMessage::Begin(b) => Message::Begin {
            commit_lsn: Lsn::from_bigint(u64::from(b.final_lsn())),
            xid: b.xid(),
        },
        WireMessage::Commit(c) => Message::Commit {
            commit_lsn: Lsn::from_bigint(u64::from(c.commit_lsn())),
        },
        WireMessage::Origin(o) => Message::Origin {
            name: o.name().unwrap_or_default().to_string(),
        },
        WireMessage::Relation(r) => Message::Relation {
            oid: r.rel_id(),
            schema: r.namespace().unwrap_or_default().to_string(),
            name: r.name().unwrap_or_default().to_string(),
            replica_identity: r.replica_identity() as u8 as char,
            columns: r
                .columns()
                .iter()
                .map(|c| RelationColumn {
                    name: c.name().unwrap_or_default().to_string(),
                    type_oid: c.type_id() as u32,
                    key: c.flags() & 1 != 0,
                })
                .collect(),
        },
        WireMessage::Type(t) => Message::Type {
            id: t.id(),
            namespace: t.namespace().unwrap_or_default().to_string(),
            name: t.name().unwrap_or_default().to_string(),
        },
        WireMessage::Insert(i) => Message::Insert {
            rel_id: i.rel_id(),
            new: tuple_from_wire(i.tuple()),
        },
        WireMessage::Update(u) => Message::Update {
            rel_id: u.rel_id(),
            key: u.key_tuple().map(tuple_from_wire),
            old: u.old_tuple().map(tuple_from_wire),
            new: tuple_from_wire(u.new_tuple()),
        },
        WireMessage::Delete(d) => Message::Delete {
            rel_id: d.rel_id(),
            key: d.key_tuple().map(tuple_from_wire),
            old: d.old_tuple().map(tuple_from_wire),
        },
        WireMessage::Truncate(t) => Message::Truncate {
            rel_ids: t.rel_ids().to_vec(),
        },
        WireMessage::Message(m) => Message::LogicalMessage {
            transactional: m.flags() & 1 != 0,
            prefix: m.prefix().unwrap_or_default().to_string(),
            content: m.data().to_vec(),
        },
        other => {
            warn!("unhandled pgoutput message variant: {other:?}");
            return Err(Error::StreamClosed);
        }
    })
}

/// Request sent from the [`Acker`] handle to the background driver task.
enum AckCommand {
    Ack(Lexi),
    Keepalive,
}

/// Send-side handle for acknowledging commit watermarks. Clone and hand
/// to callers that read the `messages` stream; the actual status-update
/// writes happen on the subscriber's own task, serialized through a channel.
#[derive(Clone)]
pub struct Acker {
    tx: mpsc::UnboundedSender<AckCommand>,
}

impl Acker {
    /// Sends a Standby Status Update with `lsn = versionFromLexi(watermark)`,
    /// cancelling any pending keepalive timer.
    pub fn ack(&self, watermark: &str) -> Result<(), Error> {
        let watermark = watermark.to_string();
        self.tx
            .send(AckCommand::Ack(watermark))
            .map_err(|_| Error::StreamClosed)
    }

    /// Arms the ~1s one-shot keepalive timer described in the Acker contract.
    pub fn keepalive(&self) -> Result<(), Error> {
        self.tx
            .send(AckCommand::Keepalive)
            .map_err(|_| Error::StreamClosed)
    }
}

const KEEPALIVE_TIMER: Duration = Duration::from_secs(1);

/// Open a replication connection and start streaming from `start_lsn`.
///
/// `replication_conn` must already be configured with
/// `replication_mode(ReplicationMode::Logical)` and connected; callers build
/// it via [`crate::tls`] so the TLS posture matches the shard's configuration.
pub async fn subscribe(
    client: Client,
    slot: &str,
    publications: &[String],
    start_lsn: Lsn,
) -> Result<(impl Stream<Item = Result<Message, Error>>, Acker), Error> {
    ensure_slot(&client, slot).await?;

    let options = format!(
        r#"("proto_version" '1', "publication_names" '{}')"#,
        publications.join(",")
    );
    let query = format!(
        r#"START_REPLICATION SLOT "{slot}" LOGICAL {start_lsn} {options}"#,
        start_lsn = PgLsn::from(start_lsn.to_bigint()),
    );

    let copy_stream = client.copy_both_simple::<Bytes>(&query).await?;
    let stream = Box::pin(LogicalReplicationStream::new(copy_stream));

    let (tx, rx) = mpsc::unbounded_channel();
    let acker = Acker { tx };

    Ok((driver(stream, rx), acker))
}

/// `CREATE_REPLICATION_SLOT ... LOGICAL pgoutput` if the slot does not
/// already exist; idempotent across restarts.
async fn ensure_slot(client: &Client, slot: &str) -> Result<(), Error> {
    let exists_query = format!(
        "select 1 from pg_replication_slots where slot_name = '{slot}'",
    );
    let rows = client.simple_query(&exists_query).await?;
    let exists = rows
        .iter()
        .any(|m| matches!(m, SimpleQueryMessage::Row(_)));

    if !exists {
        let create = format!(r#"CREATE_REPLICATION_SLOT "{slot}" LOGICAL pgoutput"#);
        client.simple_query(&create).await?;
        debug!(slot, "created replication slot");
    }

    Ok(())
}

/// Bridges the raw `LogicalReplicationStream` with the `Acker` channel: a
/// single task owns the stream so status updates and message reads never
/// race, matching the single-producer requirement in §4.7.
fn driver(
    mut stream: Pin<Box<LogicalReplicationStream>>,
    mut acks: mpsc::UnboundedReceiver<AckCommand>,
) -> impl Stream<Item = Result<Message, Error>> {
    async_stream::try_stream! {
        let mut deadline: Option<Instant> = None;
        loop {
            let timer = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;

                cmd = acks.recv() => {
                    match cmd {
                        Some(AckCommand::Ack(watermark)) => {
                            let lsn = watermark::version_from_lexi(&watermark)?;
                            send_status(&mut stream, lsn).await?;
                            deadline = None;
                        }
                        Some(AckCommand::Keepalive) => {
                            deadline = Some(Instant::now() + KEEPALIVE_TIMER);
                        }
                        None => {
                            // Every Acker handle (and the service's own
                            // clone) has been dropped; nothing will ever
                            // ack again, so tear down rather than spin.
                            Err(Error::StreamClosed)?;
                        }
                    }
                }

                _ = timer => {
                    send_status(&mut stream, 0).await?;
                    deadline = None;
                }

                next = stream.next() => {
                    let next = next.ok_or(Error::StreamClosed)??;
                    match next {
                        ReplicationMessage::XLogData(body) => {
                            yield decode(body.into_data())?;
                        }
                        ReplicationMessage::PrimaryKeepAlive(body) => {
                            let reply_requested = body.reply() == 1;
                            yield Message::Keepalive {
                                server_wal_end: Lsn::from_bigint(u64::from(body.wal_end())),
                                reply_requested,
                            };
                        }
                        _ => {}
                    }
                }
            }
        }
    }
}

async fn send_status(
    stream: &mut Pin<Box<LogicalReplicationStream>>,
    lsn: u64,
) -> Result<(), Error> {
    let ts = crate::util::postgres_now();
    stream
        .as_mut()
        .standby_status_update(PgLsn::from(lsn), PgLsn::from(lsn), PgLsn::from(lsn), ts, 0)
        .await?;
    Ok(())
}

/// Opens the replication-mode connection this module streams from. Kept
/// separate from [`subscribe`] so tests can hand it a pre-built `Client`.
pub async fn connect(
    mut config: tokio_postgres::Config,
    tls_verify: TlsVerifyMode,
    tls_server_ca_certificate: Option<&std::path::Path>,
) -> Result<Client, Error> {
    config.replication_mode(ReplicationMode::Logical);
    Ok(crate::tls::connect_with_config(&config, tls_verify, tls_server_ca_certificate).await?)
}
