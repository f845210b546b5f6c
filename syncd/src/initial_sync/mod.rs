//! C6: Initial sync. Acquires a replication slot with a matching snapshot,
//! discovers and validates the published schema, copies every table under
//! that snapshot with a pool of worker connections, then creates indexes
//! and persists the replica's starting version.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config, SimpleQueryMessage};
use tracing::{info, warn};

use crate::catalog::{self, get_publication_info};
use crate::provisioner;
use crate::replica::Replica;
use crate::spec::lite::map_postgres_to_lite;
use crate::spec::{PublishedSchema, ShardConfig};
use crate::watermark::{self, version_to_lexi};

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::Error),

    #[error("provisioner error: {0}")]
    Provisioner(#[from] provisioner::Error),

    #[error("replica error: {0}")]
    Replica(#[from] crate::replica::Error),

    #[error("watermark error: {0}")]
    Watermark(#[from] watermark::Error),

    #[error("could not acquire a replication slot: {0}")]
    SlotAcquisition(String),

    #[error("tls error: {0}")]
    Tls(#[from] crate::tls::Error),
}

const DEFAULT_CURSOR_BATCH_SIZE: i32 = 10_000;
const DEFAULT_INSERT_BATCH_SIZE: usize = 50;

pub struct SlotInfo {
    pub consistent_point: String,
    pub snapshot_name: String,
}

/// Result of a successful initial sync: the replica version new subscribers
/// should pass to `startStream`, and the schema it was computed from.
pub struct SyncResult {
    pub replica_version: String,
    pub initial_schema: PublishedSchema,
    pub ddl_detection: bool,
}

/// §4.6 step 2: `CREATE_REPLICATION_SLOT ... LOGICAL pgoutput` on a
/// replication-mode connection. Retries once after granting `REPLICATION`
/// if the role lacks it.
pub async fn create_slot(
    admin_client: &Client,
    replication_client: &Client,
    slot_name: &str,
    role: &str,
) -> Result<SlotInfo, Error> {
    let query = format!(r#"CREATE_REPLICATION_SLOT "{slot_name}" LOGICAL pgoutput"#);

    match replication_client.simple_query(&query).await {
        Ok(rows) => parse_slot_info(&rows),
        Err(e)
            if e.code() == Some(&tokio_postgres::error::SqlState::INSUFFICIENT_PRIVILEGE) =>
        {
            warn!("role {role} lacks REPLICATION; granting and retrying once");
            admin_client
                .batch_execute(&format!(r#"ALTER ROLE "{role}" WITH REPLICATION"#))
                .await?;
            let rows = replication_client.simple_query(&query).await?;
            parse_slot_info(&rows)
        }
        Err(e) => Err(Error::Pg(e)),
    }
}

fn parse_slot_info(rows: &[SimpleQueryMessage]) -> Result<SlotInfo, Error> {
    for row in rows {
        if let SimpleQueryMessage::Row(row) = row {
            let consistent_point = row
                .get("consistent_point")
                .ok_or_else(|| Error::SlotAcquisition("missing consistent_point".into()))?
                .to_string();
            let snapshot_name = row
                .get("snapshot_name")
                .ok_or_else(|| Error::SlotAcquisition("missing snapshot_name".into()))?
                .to_string();
            return Ok(SlotInfo {
                consistent_point,
                snapshot_name,
            });
        }
    }
    Err(Error::SlotAcquisition("no row returned".into()))
}

/// Runs the full §4.6 algorithm. `replica_path` is the destination SQLite
/// file; `upstream_url` is used to open the worker pool (each worker opens
/// its own connection and pins it to `snapshot_name`).
pub async fn run(
    admin_client: &Client,
    replication_client: &Client,
    upstream_url: &str,
    shard: &ShardConfig,
    replica_path: &std::path::Path,
    worker_count: usize,
    cursor_batch_size: i32,
    insert_batch_size: usize,
) -> Result<SyncResult, Error> {
    let provisioned = provisioner::provision(admin_client, shard).await?;
    let ddl_detection = provisioned.ddl_detection;
    let publications = provisioned.publications;

    let slot_name = shard.id.replication_slot_name(&crate::util::random_string(8));
    let current_user: String = admin_client
        .query_one("SELECT current_user", &[])
        .await?
        .get(0);

    let slot = create_slot(admin_client, replication_client, &slot_name, &current_user).await?;
    let replica_version = watermark::lsn_to_lexi(&slot.consistent_point)?;

    // §4.6 step 8: from here on, any failure must best-effort drop the slot
    // we just created so it doesn't leak.
    match copy_and_persist(
        admin_client,
        shard,
        &publications,
        replica_path,
        &slot,
        &replica_version,
        &slot_name,
        upstream_url,
        worker_count,
        cursor_batch_size,
        insert_batch_size,
    )
    .await
    {
        Ok(schema) => Ok(SyncResult {
            replica_version,
            initial_schema: schema,
            ddl_detection,
        }),
        Err(e) => {
            warn!("initial sync failed, dropping replication slot {slot_name}: {e}");
            drop_slot_best_effort(admin_client, &slot_name).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn copy_and_persist(
    admin_client: &Client,
    shard: &ShardConfig,
    publications: &[String],
    replica_path: &std::path::Path,
    slot: &SlotInfo,
    replica_version: &str,
    slot_name: &str,
    upstream_url: &str,
    worker_count: usize,
    cursor_batch_size: i32,
    insert_batch_size: usize,
) -> Result<PublishedSchema, Error> {
    let schema = get_publication_info(admin_client, publications).await?;
    let app_schema = shard.id.app_schema();
    let upstream_schema = shard.id.upstream_schema();
    for table in &schema.tables {
        for warning in catalog::validate(table, &app_schema, &upstream_schema)? {
            warn!(table = %table.qualified_name(), "{warning}");
        }
    }

    let replica = Replica::open(replica_path)?;
    replica.init_internal_tables()?;

    // `computeZqlSpecs` chooses primary/union keys for the client-facing
    // projection and may drop keyless tables from *that* view, but every
    // published table (barring the non-fatal warnings `validate` already
    // logged above) is still physically replicated here.
    let lite_tables: Vec<_> = schema.tables.iter().map(|t| map_postgres_to_lite(&t.table)).collect();

    crate::replica::create_tables(&replica, &lite_tables)?;

    let config: Config = upstream_url.parse()?;
    let copy_tables: Vec<crate::spec::PublishedTableSpec> = schema.tables.clone();
    let queue = Arc::new(Mutex::new(copy_tables));
    let replica = Arc::new(Mutex::new(replica));

    let mut workers = Vec::with_capacity(worker_count);
    for _ in 0..worker_count.max(1) {
        let queue = queue.clone();
        let replica = replica.clone();
        let config = config.clone();
        let snapshot = slot.snapshot_name.clone();
        let replica_version = replica_version.to_string();

        workers.push(tokio::spawn(async move {
            copy_worker(
                config,
                snapshot,
                queue,
                replica,
                replica_version,
                cursor_batch_size,
                insert_batch_size,
            )
            .await
        }));
    }

    for worker in workers {
        worker
            .await
            .map_err(|e| Error::SlotAcquisition(format!("copy worker panicked: {e}")))??;
    }

    let indexes: Vec<_> = schema
        .indexes
        .iter()
        .map(crate::spec::lite::map_postgres_to_lite_index)
        .collect();
    {
        let replica = replica.lock().await;
        crate::replica::create_indexes(&replica, &indexes)?;
        replica.persist_initial_sync(publications, replica_version)?;
    }

    persist_shard_config(admin_client, shard, replica_version, slot_name).await?;

    info!(
        shard = %shard.id.upstream_schema(),
        replica_version,
        "initial sync complete"
    );

    Ok(schema)
}

/// One worker: connects under the shared snapshot, pulls tables off the
/// shared queue, and streams+inserts each via a portal-backed cursor so the
/// next batch's fetch overlaps the current batch's insert.
async fn copy_worker(
    config: Config,
    snapshot_name: String,
    queue: Arc<Mutex<Vec<crate::spec::PublishedTableSpec>>>,
    replica: Arc<Mutex<Replica>>,
    replica_version: String,
    cursor_batch_size: i32,
    insert_batch_size: usize,
) -> Result<(), Error> {
    let general = &crate::config::config().general;
    let client = crate::tls::connect_with_config(
        &config,
        general.tls_verify,
        general.tls_server_ca_certificate.as_deref(),
    )
    .await?;

    client
        .batch_execute("BEGIN TRANSACTION ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    client
        .batch_execute(&format!("SET TRANSACTION SNAPSHOT '{snapshot_name}'"))
        .await?;

    loop {
        let table = {
            let mut queue = queue.lock().await;
            queue.pop()
        };
        let Some(table) = table else { break };

        copy_table(
            &client,
            &table,
            &replica,
            &replica_version,
            cursor_batch_size,
            insert_batch_size,
        )
        .await?;
    }

    client.batch_execute("COMMIT").await?;
    Ok(())
}

async fn copy_table(
    client: &Client,
    table: &crate::spec::PublishedTableSpec,
    replica: &Arc<Mutex<Replica>>,
    replica_version: &str,
    cursor_batch_size: i32,
    insert_batch_size: usize,
) -> Result<(), Error> {
    let lite = map_postgres_to_lite(&table.table);
    let select_list: Vec<String> = table
        .table
        .columns
        .iter()
        .map(|(name, col)| select_expr(name, col))
        .collect();
    let filters: Vec<&str> = table
        .publications
        .values()
        .filter_map(|m| m.row_filter.as_deref())
        .collect();
    let where_clause = if filters.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", filters.join(" OR "))
    };

    let select = format!(
        "SELECT {} FROM \"{}\".\"{}\"{}",
        select_list.join(", "),
        table.table.schema,
        table.table.name,
        where_clause,
    );

    let stmt = client.prepare(&select).await?;
    let transaction_portal = client.bind(&stmt, &[]).await?;

    let mut pending_insert: Option<tokio::task::JoinHandle<Result<(), Error>>> = None;
    let source = table.table.clone();

    loop {
        let rows = client.query_portal(&transaction_portal, cursor_batch_size).await?;
        if rows.is_empty() {
            break;
        }

        if let Some(prev) = pending_insert.take() {
            prev.await
                .map_err(|e| Error::SlotAcquisition(format!("insert task panicked: {e}")))??;
        }

        let replica = replica.clone();
        let lite = lite.clone();
        let source = source.clone();
        let replica_version = replica_version.to_string();
        pending_insert = Some(tokio::task::spawn_blocking(move || {
            insert_batch(&replica, &lite, &source, &rows, &replica_version, insert_batch_size)
        }));
    }

    if let Some(prev) = pending_insert.take() {
        prev.await
            .map_err(|e| Error::SlotAcquisition(format!("insert task panicked: {e}")))??;
    }

    Ok(())
}

/// Build the `SELECT` expression for one upstream column, casting it into
/// the replica's storage convention: booleans to `0`/`1` (and so `int4`),
/// arrays to a JSON-stringified `text`, everything else (including `json`/
/// `jsonb`, which are already valid JSON text) to `text`.
fn select_expr(name: &str, col: &crate::spec::ColumnSpec) -> String {
    use crate::spec::lite::{base_type_name, column_is_array};
    use crate::spec::types::is_boolean_type;

    let base = base_type_name(col);
    let is_array = column_is_array(col);

    if is_array {
        format!("to_json(\"{name}\")::text AS \"{name}\"")
    } else if is_boolean_type(&base) {
        format!(
            "(CASE WHEN \"{name}\" IS NULL THEN NULL WHEN \"{name}\" THEN 1 ELSE 0 END) AS \"{name}\""
        )
    } else {
        format!("\"{name}\"::text AS \"{name}\"")
    }
}

fn insert_batch(
    replica: &Arc<Mutex<Replica>>,
    lite: &crate::spec::lite::LiteTableSpec,
    source: &crate::spec::TableSpec,
    rows: &[tokio_postgres::Row],
    replica_version: &str,
    batch_size: usize,
) -> Result<(), Error> {
    let replica = replica.blocking_lock();
    for chunk in rows.chunks(batch_size) {
        replica.insert_rows(lite, source, chunk, replica_version, batch_size)?;
    }
    Ok(())
}

/// §4.6 step 7: write `{replicaVersion, initialSchema}` into
/// `upstreamSchema.shardConfig` and record the replica in `replicas`.
async fn persist_shard_config(
    client: &Client,
    shard: &ShardConfig,
    replica_version: &str,
    slot_name: &str,
) -> Result<(), Error> {
    let upstream_schema = shard.id.upstream_schema();

    client
        .execute(
            &format!("UPDATE \"{upstream_schema}\".shard_config SET replica_version = $1"),
            &[&replica_version],
        )
        .await?;

    client
        .execute(
            &format!(
                "INSERT INTO \"{upstream_schema}\".replicas (replica_id, slot_name, replica_version) \
                 VALUES ($1, $2, $3) ON CONFLICT (replica_id) DO UPDATE SET slot_name = $2, replica_version = $3"
            ),
            &[&slot_name.to_string(), &slot_name, &replica_version],
        )
        .await?;

    Ok(())
}

/// §4.6 step 8: best-effort slot drop on any failure path.
pub async fn drop_slot_best_effort(client: &Client, slot_name: &str) {
    if let Err(e) = client
        .execute("SELECT pg_drop_replication_slot($1)", &[&slot_name.to_string()])
        .await
    {
        warn!("best-effort drop of slot {slot_name} failed: {e}");
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tokio_postgres::SimpleQueryRow;

    #[test]
    fn test_parse_slot_info_requires_both_columns() {
        let rows: Vec<SimpleQueryMessage> = vec![];
        assert!(parse_slot_info(&rows).is_err());
    }
}
