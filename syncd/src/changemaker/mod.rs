//! C8: Change maker. Turns decoded [`crate::subscriber::Message`]s into
//! ordered typed change events, and translates the DDL-event-trigger
//! notifications into `create-table`/`drop-column`/... events when
//! `ddlDetection` is enabled, or detects unsupported schema drift when it
//! isn't.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_postgres::Client;
use tracing::error;

use crate::catalog::{self, get_publication_info};
use crate::spec::{IndexSpec, PgTypeClass, PublishedSchema, PublishedTableSpec, ReplicaIdentity, ShardConfig};
use crate::subscriber::{Message, RelationColumn, Tuple};
use crate::watermark::{self, version_to_lexi, Lsn};

#[derive(Debug, Error)]
pub enum Error {
    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::Error),

    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("watermark error: {0}")]
    Watermark(#[from] watermark::Error),

    #[error("malformed ddl event message: {0}")]
    MalformedDdlEvent(String),

    #[error(
        "Replication halted. Schema changes cannot be reliably replicated without event \
         trigger support. Resync the replica to recover."
    )]
    UnsupportedSchemaChange,

    #[error("delete message has neither old row nor replica-identity key")]
    DeleteWithoutKey,

    #[error("ddlUpdate message arrived with no preceding ddlStart")]
    MissingPreSchema,
}

/// One outgoing event. Mirrors the `["tag", payload, meta?]` shape of the
/// wire protocol without committing to its serialization here.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Begin { xid: u32, commit_watermark: String },
    Data(DataChange),
    Commit { watermark: String },
    Rollback,
    ControlResetRequired,
}

/// The `DataChange` tagged union from §3: row-level changes carry the
/// upstream relation id they arrived tagged with; schema-change variants
/// (produced by the DDL diff in §4.8.2) carry their own table/index identity
/// since they have no single originating relation message.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag", rename_all = "kebab-case")]
pub enum DataChange {
    Insert { rel_id: u32, new: Tuple },
    Update { rel_id: u32, key: Tuple, new: Tuple },
    Delete { rel_id: u32, key: Tuple },
    Truncate { rel_id: u32 },
    CreateTable { spec: PublishedTableSpec },
    RenameTable { old: (String, String), new: (String, String) },
    AddColumn { schema: String, table: String, column: String },
    UpdateColumn { schema: String, table: String, column: String },
    DropColumn { schema: String, table: String, column: String },
    DropTable { schema: String, name: String },
    CreateIndex { spec: IndexSpec },
    DropIndex { schema: String, name: String },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum DdlMessage {
    #[serde(rename = "ddlStart")]
    DdlStart { schema: Value },
    #[serde(rename = "ddlUpdate")]
    DdlUpdate { schema: Value, event: DdlEvent },
}

#[derive(Debug, Deserialize)]
struct DdlEvent {
    #[allow(dead_code)]
    tag: String,
}

/// A [`PublishedSchema`] decoded from a `ddlStart`/`ddlUpdate` logical
/// message's embedded `schema` field via [`catalog::schema_from_snapshot`].
type SchemaSnapshot = PublishedSchema;

/// Per-shard state, long-lived across `make_changes` calls.
pub struct ChangeMaker {
    initial_schema: PublishedSchema,
    pre_schema: Option<SchemaSnapshot>,
    shard: ShardConfig,
    shard_prefix: String,
    ddl_detection: bool,
    error: Option<(Instant, String)>,
    /// §4.8.2 step 4: a deferred, cancellable attempt to fix up replica
    /// identities of newly-keyless tables after a DDL update. Superseded
    /// (aborted) by the next DDL event.
    pending_fixup: Option<tokio::task::JoinHandle<()>>,
}

const ERROR_LOG_INTERVAL: Duration = Duration::from_secs(60);

impl ChangeMaker {
    pub fn new(initial_schema: PublishedSchema, shard: ShardConfig, ddl_detection: bool) -> Self {
        let shard_prefix = shard.id.message_prefix();
        Self {
            initial_schema,
            pre_schema: None,
            shard,
            shard_prefix,
            ddl_detection,
            error: None,
            pending_fixup: None,
        }
    }

    /// Translate one decoded upstream message. Once latched into an error
    /// state, every subsequent call short-circuits to an empty vec until
    /// the process restarts.
    pub async fn make_changes(
        &mut self,
        client: &Client,
        message: Message,
    ) -> Vec<ChangeEvent> {
        if self.error.is_some() {
            return Vec::new();
        }

        match self.translate(client, message).await {
            Ok(events) => events,
            Err(e) => {
                self.latch_error(&e.to_string());
                vec![ChangeEvent::Rollback, ChangeEvent::ControlResetRequired]
            }
        }
    }

    fn latch_error(&mut self, message: &str) {
        let should_log = match &self.error {
            Some((at, _)) => at.elapsed() >= ERROR_LOG_INTERVAL,
            None => true,
        };
        if should_log {
            error!("change maker error: {message}");
        }
        self.error = Some((Instant::now(), message.to_string()));
    }

    async fn translate(&mut self, client: &Client, message: Message) -> Result<Vec<ChangeEvent>, Error> {
        match message {
            Message::Begin { commit_lsn, xid } => Ok(vec![ChangeEvent::Begin {
                xid,
                commit_watermark: version_to_lexi(commit_lsn.to_bigint()),
            }]),

            Message::Insert { rel_id, new } => Ok(vec![ChangeEvent::Data(DataChange::Insert {
                rel_id,
                new,
            })]),

            Message::Truncate { rel_ids } => Ok(rel_ids
                .into_iter()
                .map(|rel_id| ChangeEvent::Data(DataChange::Truncate { rel_id }))
                .collect()),

            Message::Update { rel_id, old, key, new } => {
                let key = old.or(key).unwrap_or_default();
                Ok(vec![ChangeEvent::Data(DataChange::Update { rel_id, key, new })])
            }

            Message::Delete { rel_id, old, key } => {
                let key = old.or(key).ok_or(Error::DeleteWithoutKey)?;
                Ok(vec![ChangeEvent::Data(DataChange::Delete { rel_id, key })])
            }

            Message::Commit { commit_lsn } => Ok(vec![ChangeEvent::Commit {
                watermark: version_to_lexi(commit_lsn.to_bigint()),
            }]),

            Message::Type { .. } | Message::Origin { .. } => Ok(Vec::new()),

            Message::Relation { oid, schema, name, columns, .. } => {
                if self.ddl_detection {
                    Ok(Vec::new())
                } else {
                    self.degraded_mode_relation(client, oid, &schema, &name, &columns).await
                }
            }

            Message::LogicalMessage { prefix, content, .. } => {
                if prefix != self.shard_prefix {
                    return Ok(Vec::new());
                }
                self.handle_ddl_message(&content).await
            }

            Message::Keepalive { .. } => Ok(Vec::new()),
        }
    }

    /// §4.8.1: without event-trigger support, any `relation` message might
    /// signal an upstream schema change we cannot safely ignore. Refuse to
    /// proceed unless the schema is unchanged from `initialSchema` both
    /// globally (step 1), for the specific incoming relation as seen by a
    /// fresh catalog query (step 2), and against the incoming relation
    /// message's own column list (step 3) -- snapshot isolation means a live
    /// query alone can miss drift the wire message already reflects.
    async fn degraded_mode_relation(
        &self,
        client: &Client,
        oid: u32,
        schema: &str,
        name: &str,
        columns: &[RelationColumn],
    ) -> Result<Vec<ChangeEvent>, Error> {
        let publications = self.initial_schema.publications.clone();
        let current = get_publication_info(client, &publications).await?;

        if schemas_differ(&self.initial_schema, &current) {
            return Err(Error::UnsupportedSchemaChange);
        }

        if let Some(initial_table) = self.initial_schema.table_by_oid(oid) {
            if let Some(current_table) = current.table_by_oid(oid) {
                if tables_differ(initial_table, current_table) {
                    return Err(Error::UnsupportedSchemaChange);
                }
            } else {
                return Err(Error::UnsupportedSchemaChange);
            }

            if relation_columns_differ(initial_table, columns) {
                return Err(Error::UnsupportedSchemaChange);
            }
        } else {
            // New table that appeared after initial sync without DDL detection.
            let _ = (schema, name);
            return Err(Error::UnsupportedSchemaChange);
        }

        Ok(Vec::new())
    }

    async fn handle_ddl_message(&mut self, content: &[u8]) -> Result<Vec<ChangeEvent>, Error> {
        // Any DDL event supersedes a previously-scheduled deferred fixup.
        if let Some(pending) = self.pending_fixup.take() {
            pending.abort();
        }

        let parsed: DdlMessage = serde_json::from_slice(content)
            .map_err(|e| Error::MalformedDdlEvent(e.to_string()))?;

        match parsed {
            DdlMessage::DdlStart { schema } => {
                let publications = self.initial_schema.publications.clone();
                let snapshot = catalog::schema_from_snapshot(&publications, &schema)?;
                self.pre_schema = Some(snapshot);
                Ok(Vec::new())
            }
            DdlMessage::DdlUpdate { schema, .. } => {
                let prev = self.pre_schema.take().ok_or(Error::MissingPreSchema)?;
                let publications = self.initial_schema.publications.clone();
                let next = catalog::schema_from_snapshot(&publications, &schema)?;
                let events = diff_schemas(&prev, &next);
                self.schedule_replica_identity_fixup(publications);
                Ok(events)
            }
        }
    }

    /// §4.8.2 step 4: after emitting a DDL update's data changes, schedule a
    /// deferred attempt (≈500ms, per config) to set replica identities for
    /// any newly keyless tables (C5 step 5). Runs on its own connection since
    /// it fires well after the triggering message has been processed.
    fn schedule_replica_identity_fixup(&mut self, publications: Vec<String>) {
        let shard = self.shard.clone();
        let delay = crate::config::config().general.replica_identity_fixup_delay;

        self.pending_fixup = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let cfg = crate::config::config();
            let client = match crate::tls::connect(
                &cfg.general.upstream_url,
                cfg.general.tls_verify,
                cfg.general.tls_server_ca_certificate.as_deref(),
            )
            .await
            {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!("could not open connection for deferred replica-identity fixup: {e}");
                    return;
                }
            };

            if let Err(e) = crate::provisioner::fixup_replica_identities(&client, &shard, &publications).await {
                tracing::warn!("deferred replica-identity fixup failed: {e}");
            }
        }));
    }
}

fn schemas_differ(a: &PublishedSchema, b: &PublishedSchema) -> bool {
    if a.tables.len() != b.tables.len() {
        return true;
    }
    for ta in &a.tables {
        match b.table_by_oid(ta.oid) {
            Some(tb) if !tables_differ(ta, tb) => continue,
            _ => return true,
        }
    }
    false
}

fn tables_differ(a: &PublishedTableSpec, b: &PublishedTableSpec) -> bool {
    if a.table.schema != b.table.schema || a.table.name != b.table.name {
        return true;
    }
    if a.table.primary_key != b.table.primary_key {
        return true;
    }
    let mut cols_a: Vec<_> = a.table.columns.iter().collect();
    let mut cols_b: Vec<_> = b.table.columns.iter().collect();
    cols_a.sort_by_key(|(_, c)| c.pos);
    cols_b.sort_by_key(|(_, c)| c.pos);
    if cols_a.len() != cols_b.len() {
        return true;
    }
    cols_a.iter().zip(cols_b.iter()).any(|((na, ca), (nb, cb))| {
        na != nb || ca.pos != cb.pos || ca.type_oid != cb.type_oid || ca.not_null != cb.not_null
    })
}

/// §4.8.1 step 3: compare the incoming relation message's own column list
/// against the table of the same oid in `initialSchema` -- order-independent
/// for the primary key, pairwise by column position for everything else.
fn relation_columns_differ(initial: &PublishedTableSpec, incoming: &[RelationColumn]) -> bool {
    let incoming_key: HashSet<&str> = incoming
        .iter()
        .filter(|c| c.key)
        .map(|c| c.name.as_str())
        .collect();
    let initial_key: HashSet<&str> = initial
        .table
        .primary_key
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(|s| s.as_str())
        .collect();
    if incoming_key != initial_key {
        return true;
    }

    let mut initial_cols: Vec<_> = initial.table.columns.iter().collect();
    initial_cols.sort_by_key(|(_, c)| c.pos);
    let mut initial_non_pk = initial_cols
        .into_iter()
        .filter(|(name, _)| !initial_key.contains(name.as_str()));
    let mut incoming_non_pk = incoming.iter().filter(|c| !c.key);

    loop {
        match (initial_non_pk.next(), incoming_non_pk.next()) {
            (None, None) => return false,
            (Some((name, col)), Some(rc)) => {
                if name != &rc.name || col.type_oid != Some(rc.type_oid) {
                    return true;
                }
            }
            _ => return true,
        }
    }
}

/// §4.8.2 step 3: produce `data` change events in drop-before-create order.
fn diff_schemas(prev: &PublishedSchema, next: &PublishedSchema) -> Vec<ChangeEvent> {
    let mut events = Vec::new();

    let prev_indexes: HashMap<(String, String), &IndexSpec> = prev
        .indexes
        .iter()
        .map(|i| ((i.schema.clone().unwrap_or_default(), i.name.clone()), i))
        .collect();
    let next_indexes: HashMap<(String, String), &IndexSpec> = next
        .indexes
        .iter()
        .map(|i| ((i.schema.clone().unwrap_or_default(), i.name.clone()), i))
        .collect();

    // a. dropped indexes
    for (key, idx) in &prev_indexes {
        if !next_indexes.contains_key(key) {
            events.push(ChangeEvent::Data(DataChange::DropIndex {
                schema: idx.schema.clone().unwrap_or_default(),
                name: idx.name.clone(),
            }));
        }
    }

    let prev_by_oid: HashMap<u32, &PublishedTableSpec> =
        prev.tables.iter().map(|t| (t.oid, t)).collect();
    let next_by_oid: HashMap<u32, &PublishedTableSpec> =
        next.tables.iter().map(|t| (t.oid, t)).collect();

    // b. dropped tables
    for (oid, table) in &prev_by_oid {
        if !next_by_oid.contains_key(oid) {
            events.push(ChangeEvent::Data(DataChange::DropTable {
                schema: table.table.schema.clone(),
                name: table.table.name.clone(),
            }));
        }
    }

    // c. tables present in both: renames and column diffs
    for (oid, prev_table) in &prev_by_oid {
        let Some(next_table) = next_by_oid.get(oid) else {
            continue;
        };

        if prev_table.table.schema != next_table.table.schema
            || prev_table.table.name != next_table.table.name
        {
            events.push(ChangeEvent::Data(DataChange::RenameTable {
                old: (prev_table.table.schema.clone(), prev_table.table.name.clone()),
                new: (next_table.table.schema.clone(), next_table.table.name.clone()),
            }));
        }

        let mut prev_cols: HashMap<i16, (&str, &crate::spec::ColumnSpec)> = prev_table
            .table
            .columns
            .iter()
            .map(|(n, c)| (c.pos, (n.as_str(), c)))
            .collect();
        let next_cols: HashMap<i16, (&str, &crate::spec::ColumnSpec)> = next_table
            .table
            .columns
            .iter()
            .map(|(n, c)| (c.pos, (n.as_str(), c)))
            .collect();

        let mut positions: Vec<i16> = prev_cols.keys().chain(next_cols.keys()).copied().collect();
        positions.sort_unstable();
        positions.dedup();

        for pos in positions {
            match (prev_cols.remove(&pos), next_cols.get(&pos)) {
                (Some((name, _)), None) => {
                    events.push(ChangeEvent::Data(DataChange::DropColumn {
                        schema: next_table.table.schema.clone(),
                        table: next_table.table.name.clone(),
                        column: name.to_string(),
                    }));
                }
                (Some((pname, pcol)), Some((nname, ncol))) => {
                    if pname != *nname || pcol.data_type != ncol.data_type || pcol.not_null != ncol.not_null {
                        events.push(ChangeEvent::Data(DataChange::UpdateColumn {
                            schema: next_table.table.schema.clone(),
                            table: next_table.table.name.clone(),
                            column: nname.to_string(),
                        }));
                    }
                }
                (None, Some((nname, _))) => {
                    events.push(ChangeEvent::Data(DataChange::AddColumn {
                        schema: next_table.table.schema.clone(),
                        table: next_table.table.name.clone(),
                        column: nname.to_string(),
                    }));
                }
                (None, None) => {}
            }
        }
    }

    // d. new tables
    for (oid, table) in &next_by_oid {
        if !prev_by_oid.contains_key(oid) {
            events.push(ChangeEvent::Data(DataChange::CreateTable {
                spec: (*table).clone(),
            }));
        }
    }

    // e. new indexes
    for (key, idx) in &next_indexes {
        if !prev_indexes.contains_key(key) {
            events.push(ChangeEvent::Data(DataChange::CreateIndex {
                spec: (*idx).clone(),
            }));
        }
    }

    events
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::{ColumnSpec, TableSpec};
    use indexmap::IndexMap;

    fn table(oid: u32, name: &str, cols: Vec<(&str, i16, u32, bool)>) -> PublishedTableSpec {
        let mut columns = IndexMap::new();
        for (cname, pos, type_oid, not_null) in cols {
            columns.insert(
                cname.to_string(),
                ColumnSpec {
                    pos,
                    data_type: "int4".into(),
                    type_oid: Some(type_oid),
                    pg_type_class: Some(PgTypeClass::Base),
                    elem_pg_type_class: None,
                    character_maximum_length: None,
                    not_null,
                    default: None,
                },
            );
        }
        PublishedTableSpec {
            table: TableSpec {
                schema: "public".into(),
                name: name.into(),
                columns,
                primary_key: None,
            },
            oid,
            replica_identity: ReplicaIdentity::Default,
            publications: IndexMap::new(),
        }
    }

    fn with_pk(mut t: PublishedTableSpec, pk: Vec<&str>) -> PublishedTableSpec {
        t.table.primary_key = Some(pk.into_iter().map(String::from).collect());
        t
    }

    fn relation_col(name: &str, type_oid: u32, key: bool) -> RelationColumn {
        RelationColumn { name: name.into(), type_oid, key }
    }

    #[test]
    fn test_relation_columns_differ_matches_identical_relation() {
        let initial = with_pk(
            table(1, "a", vec![("id", 1, 23, true), ("name", 2, 25, false)]),
            vec!["id"],
        );
        let incoming = vec![relation_col("id", 23, true), relation_col("name", 25, false)];
        assert!(!relation_columns_differ(&initial, &incoming));
    }

    #[test]
    fn test_relation_columns_differ_detects_renamed_pk() {
        let initial = with_pk(
            table(1, "a", vec![("id", 1, 23, true), ("name", 2, 25, false)]),
            vec!["id"],
        );
        let incoming = vec![relation_col("pk", 23, true), relation_col("name", 25, false)];
        assert!(relation_columns_differ(&initial, &incoming));
    }

    #[test]
    fn test_relation_columns_differ_detects_non_pk_type_change() {
        let initial = with_pk(
            table(1, "a", vec![("id", 1, 23, true), ("name", 2, 25, false)]),
            vec!["id"],
        );
        let incoming = vec![relation_col("id", 23, true), relation_col("name", 1043, false)];
        assert!(relation_columns_differ(&initial, &incoming));
    }

    #[test]
    fn test_relation_columns_differ_detects_reordered_non_pk_columns() {
        let initial = with_pk(
            table(
                1,
                "a",
                vec![("id", 1, 23, true), ("a", 2, 25, false), ("b", 3, 25, false)],
            ),
            vec!["id"],
        );
        // Same names and types, but positions swapped relative to `initial`.
        let incoming = vec![
            relation_col("id", 23, true),
            relation_col("b", 25, false),
            relation_col("a", 25, false),
        ];
        assert!(relation_columns_differ(&initial, &incoming));
    }

    #[test]
    fn test_diff_schemas_add_and_drop_table() {
        let prev = PublishedSchema {
            publications: vec![],
            tables: vec![table(1, "a", vec![("id", 1, 23, true)])],
            indexes: vec![],
        };
        let next = PublishedSchema {
            publications: vec![],
            tables: vec![table(2, "b", vec![("id", 1, 23, true)])],
            indexes: vec![],
        };
        let events = diff_schemas(&prev, &next);
        assert!(events.iter().any(
            |e| matches!(e, ChangeEvent::Data(DataChange::DropTable { name, .. }) if name == "a")
        ));
        assert!(events.iter().any(|e| matches!(
            e,
            ChangeEvent::Data(DataChange::CreateTable { spec }) if spec.table.name == "b"
        )));
    }

    #[test]
    fn test_diff_schemas_column_added() {
        let prev = PublishedSchema {
            publications: vec![],
            tables: vec![table(1, "a", vec![("id", 1, 23, true)])],
            indexes: vec![],
        };
        let next = PublishedSchema {
            publications: vec![],
            tables: vec![table(1, "a", vec![("id", 1, 23, true), ("name", 2, 25, false)])],
            indexes: vec![],
        };
        let events = diff_schemas(&prev, &next);
        assert!(events.iter().any(|e| matches!(
            e,
            ChangeEvent::Data(DataChange::AddColumn { column, .. }) if column == "name"
        )));
    }

    #[test]
    fn test_tables_differ_detects_type_change() {
        let a = table(1, "t", vec![("id", 1, 23, true)]);
        let mut b = a.clone();
        b.table.columns.get_mut("id").unwrap().type_oid = Some(25);
        assert!(tables_differ(&a, &b));
    }

    #[test]
    fn test_update_without_old_or_key_falls_back_to_default_tuple() {
        let old: Option<Tuple> = None;
        let key: Option<Tuple> = None;
        let resolved = old.or(key).unwrap_or_default();
        assert_eq!(resolved, Tuple::default());
    }
}
