//! C5: Shard provisioner. Installs and upgrades per-shard metadata tables,
//! the metadata publication, and (best-effort) DDL event triggers.

use thiserror::Error;
use tokio_postgres::Client;
use tracing::{info, warn};

use crate::catalog::{self, get_publication_info};
use crate::spec::{ReplicaIdentity, ShardConfig};

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("catalog error: {0}")]
    Catalog(#[from] catalog::Error),

    #[error("publication \"{0}\" does not exist upstream")]
    MissingPublication(String),

    #[error("config error: {0}")]
    Config(#[from] crate::config::Error),

    #[error("the shard schema is at a version that cannot be upgraded incrementally; resync required")]
    AutoReset,
}

/// Current metadata schema version. Bump when `appSchema`/`upstreamSchema`
/// DDL below changes in a way that isn't backward compatible.
const SCHEMA_VERSION: i32 = 1;

/// Outcome of provisioning: whether DDL event triggers are active, and the
/// resolved publication set in use (the requested list, or the single
/// default publication when the operator requested none).
pub struct ProvisionResult {
    pub ddl_detection: bool,
    pub publications: Vec<String>,
}

/// Idempotently provision one shard. Safe to call on every startup.
pub async fn provision(client: &Client, shard: &ShardConfig) -> Result<ProvisionResult, Error> {
    shard.validate()?;

    let app_schema = shard.id.app_schema();
    let upstream_schema = shard.id.upstream_schema();

    ensure_app_schema(client, &app_schema).await?;
    ensure_upstream_schema(client, &upstream_schema).await?;
    check_schema_version(client, &app_schema).await?;

    let publications = ensure_publications(client, shard).await?;
    ensure_metadata_publication(client, shard, &upstream_schema).await?;

    let ddl_detection = install_ddl_triggers(client, shard, &publications).await;

    fixup_replica_identities(client, shard, &publications).await?;

    persist_shard_config_row(client, &upstream_schema, &publications, ddl_detection).await?;

    Ok(ProvisionResult {
        ddl_detection,
        publications,
    })
}

/// Ensure `upstreamSchema.shardConfig`'s single row exists and carries the
/// publications in use and whether DDL event triggers were installed.
/// `replica_version`/`initial_schema` are filled in later by initial sync
/// (§4.6 step 7); this upsert must not clobber them on a re-provision.
async fn persist_shard_config_row(
    client: &Client,
    upstream_schema: &str,
    publications: &[String],
    ddl_detection: bool,
) -> Result<(), Error> {
    client
        .execute(
            &format!(
                "INSERT INTO \"{upstream_schema}\".shard_config (publications, ddl_detection) \
                 VALUES ($1, $2) \
                 ON CONFLICT (lock) DO UPDATE SET publications = $1, ddl_detection = $2"
            ),
            &[&publications, &ddl_detection],
        )
        .await?;
    Ok(())
}

async fn ensure_app_schema(client: &Client, app_schema: &str) -> Result<(), Error> {
    client
        .batch_execute(&format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS "{app_schema}";

            CREATE TABLE IF NOT EXISTS "{app_schema}".schema_versions (
                min_supported_version INT NOT NULL,
                max_supported_version INT NOT NULL,
                lock BOOLEAN PRIMARY KEY DEFAULT true CHECK (lock)
            );

            CREATE TABLE IF NOT EXISTS "{app_schema}".permissions (
                permissions JSONB,
                hash TEXT,
                lock BOOLEAN PRIMARY KEY DEFAULT true CHECK (lock)
            );

            CREATE OR REPLACE FUNCTION "{app_schema}".permissions_hash() RETURNS TRIGGER AS $$
            BEGIN
                NEW.hash = md5(NEW.permissions::text);
                RETURN NEW;
            END;
            $$ LANGUAGE plpgsql;

            DROP TRIGGER IF EXISTS permissions_hash_trigger ON "{app_schema}".permissions;
            CREATE TRIGGER permissions_hash_trigger
                BEFORE INSERT OR UPDATE ON "{app_schema}".permissions
                FOR EACH ROW EXECUTE FUNCTION "{app_schema}".permissions_hash();
            "#
        ))
        .await?;
    Ok(())
}

async fn ensure_upstream_schema(client: &Client, upstream_schema: &str) -> Result<(), Error> {
    client
        .batch_execute(&format!(
            r#"
            CREATE SCHEMA IF NOT EXISTS "{upstream_schema}";

            CREATE TABLE IF NOT EXISTS "{upstream_schema}".clients (
                "clientGroupID" TEXT NOT NULL,
                "clientID" TEXT NOT NULL,
                "lastMutationID" BIGINT NOT NULL DEFAULT 0,
                "userID" TEXT,
                PRIMARY KEY ("clientGroupID", "clientID")
            );

            CREATE TABLE IF NOT EXISTS "{upstream_schema}".shard_config (
                publications TEXT[] NOT NULL,
                ddl_detection BOOLEAN NOT NULL DEFAULT false,
                replica_version TEXT,
                initial_schema JSONB,
                lock BOOLEAN PRIMARY KEY DEFAULT true CHECK (lock)
            );

            CREATE TABLE IF NOT EXISTS "{upstream_schema}".replicas (
                replica_id TEXT PRIMARY KEY,
                slot_name TEXT NOT NULL,
                replica_version TEXT NOT NULL
            );
            "#
        ))
        .await?;
    Ok(())
}

async fn check_schema_version(client: &Client, app_schema: &str) -> Result<(), Error> {
    let row = client
        .query_opt(
            &format!("SELECT max_supported_version FROM \"{app_schema}\".schema_versions"),
            &[],
        )
        .await?;

    match row {
        None => {
            client
                .execute(
                    &format!(
                        "INSERT INTO \"{app_schema}\".schema_versions (min_supported_version, max_supported_version) VALUES ($1, $1)"
                    ),
                    &[&SCHEMA_VERSION],
                )
                .await?;
            Ok(())
        }
        Some(row) => {
            let max_version: i32 = row.get(0);
            if max_version < SCHEMA_VERSION - 1 {
                return Err(Error::AutoReset);
            }
            Ok(())
        }
    }
}

/// Validate requested publications and create the default one if none
/// were requested. Returns the final list of publication names in use.
async fn ensure_publications(client: &Client, shard: &ShardConfig) -> Result<Vec<String>, Error> {
    if shard.publications.is_empty() {
        let name = shard.default_publication_name();
        let exists: bool = client
            .query_one(
                "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
                &[&name],
            )
            .await?
            .get(0);

        if !exists {
            client
                .batch_execute(&format!(
                    "CREATE PUBLICATION \"{name}\" FOR TABLES IN SCHEMA public WITH (publish_via_partition_root = true)"
                ))
                .await?;
            info!("created default publication \"{name}\"");
        }

        Ok(vec![name])
    } else {
        for name in &shard.publications {
            let exists: bool = client
                .query_one(
                    "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
                    &[name],
                )
                .await?
                .get(0);
            if !exists {
                return Err(Error::MissingPublication(name.clone()));
            }
        }
        Ok(shard.publications.clone())
    }
}

async fn ensure_metadata_publication(
    client: &Client,
    shard: &ShardConfig,
    upstream_schema: &str,
) -> Result<(), Error> {
    let name = shard.metadata_publication_name();
    let app_schema = shard.id.app_schema();

    let exists: bool = client
        .query_one(
            "SELECT EXISTS(SELECT 1 FROM pg_publication WHERE pubname = $1)",
            &[&name],
        )
        .await?
        .get(0);

    if !exists {
        client
            .batch_execute(&format!(
                "CREATE PUBLICATION \"{name}\" FOR TABLE \"{app_schema}\".schema_versions, \"{app_schema}\".permissions, \"{upstream_schema}\".clients"
            ))
            .await?;
        info!("created metadata publication \"{name}\"");
    }

    Ok(())
}

/// §4.5 step 5: find a non-partial, immediate, all-`NOT NULL` unique index
/// for every keyless table with replica identity `default`, and switch to
/// `REPLICA IDENTITY USING INDEX`.
pub(crate) async fn fixup_replica_identities(
    client: &Client,
    _shard: &ShardConfig,
    publications: &[String],
) -> Result<(), Error> {
    let schema = get_publication_info(client, publications).await?;

    for table in &schema.tables {
        if table.table.primary_key.is_some() || table.replica_identity != ReplicaIdentity::Default
        {
            continue;
        }

        let candidate = schema
            .indexes
            .iter()
            .filter(|idx| {
                idx.table_name == table.table.name
                    && idx.unique
                    && idx.is_immediate
                    && idx.columns.keys().all(|c| {
                        table
                            .table
                            .columns
                            .get(c)
                            .map(|c| c.not_null)
                            .unwrap_or(false)
                    })
            })
            .min_by_key(|idx| idx.name.clone());

        if let Some(index) = candidate {
            client
                .batch_execute(&format!(
                    "ALTER TABLE \"{}\".\"{}\" REPLICA IDENTITY USING INDEX \"{}\"",
                    table.table.schema, table.table.name, index.name
                ))
                .await?;
            info!(
                "set replica identity of {}.{} to index {}",
                table.table.schema, table.table.name, index.name
            );
        }
    }

    Ok(())
}

/// Server-side mirror of `catalog::queries::PUBLICATION_TABLES`/
/// `TABLE_COLUMNS`/`TABLE_INDEXES`, assembled into one JSON document. Bound
/// into the `_ddl_schema_snapshot` SQL function below and invoked
/// synchronously inside the `ddl_command_start`/`ddl_command_end` event
/// triggers, so the emitted payload reflects the catalog at that exact
/// moment rather than whatever a query from the subscriber side would see
/// after the triggering transaction has already committed.
const SNAPSHOT_QUERY: &str = "
WITH table_rows AS (
    SELECT
        n.nspname AS schema,
        c.relname AS table_name,
        c.oid::bigint AS table_oid,
        c.relreplident AS replica_identity,
        pt.pubname AS publication,
        pg_get_expr(pt.qual, pt.relid) AS row_filter,
        pt.attnames AS columns
    FROM pg_publication_tables pt
    JOIN pg_class c ON c.relname = pt.tablename
    JOIN pg_namespace n ON n.oid = c.relnamespace AND n.nspname = pt.schemaname
    WHERE pt.pubname = ANY(pubs)
),
column_rows AS (
    SELECT
        a.attrelid::bigint AS table_oid,
        a.attnum AS pos,
        a.attname AS name,
        format_type(a.atttypid, a.atttypmod) AS data_type,
        a.atttypid::bigint AS type_oid,
        t.typtype AS type_class,
        et.typtype AS elem_type_class,
        CASE WHEN a.atttypmod > 0 THEN a.atttypmod - 4 ELSE NULL END AS character_maximum_length,
        a.attnotnull AS not_null,
        pg_get_expr(ad.adbin, ad.adrelid) AS default_expr,
        (SELECT i FROM generate_subscripts(ix.indkey, 1) i
            WHERE ix.indkey[i] = a.attnum AND ix.indisprimary) + 1 AS pk_pos
    FROM pg_attribute a
    JOIN pg_type t ON t.oid = a.atttypid
    LEFT JOIN pg_type et ON et.oid = t.typelem AND t.typelem != 0
    LEFT JOIN pg_attrdef ad ON ad.adrelid = a.attrelid AND ad.adnum = a.attnum
    LEFT JOIN pg_index ix ON ix.indrelid = a.attrelid AND ix.indisprimary
    WHERE a.attrelid IN (SELECT DISTINCT table_oid FROM table_rows)
      AND a.attnum > 0
      AND NOT a.attisdropped
      AND a.attgenerated = ''
),
index_rows AS (
    SELECT
        i.indrelid::bigint AS table_oid,
        ic.relname AS index_name,
        i.indisunique AS is_unique,
        i.indisreplident AS is_replica_identity,
        i.indimmediate AS is_immediate,
        i.indkey::int2[] AS key_attrs,
        i.indoption AS key_options,
        i.indnkeyatts AS n_key_atts
    FROM pg_index i
    JOIN pg_class ic ON ic.oid = i.indexrelid
    WHERE i.indrelid IN (SELECT DISTINCT table_oid FROM table_rows)
      AND i.indexprs IS NULL
      AND i.indpred IS NULL
)
SELECT json_build_object(
    'tables', COALESCE((SELECT json_agg(row_to_json(tr)) FROM table_rows tr), '[]'::json),
    'columns', COALESCE((
        SELECT json_object_agg(table_oid::text, cols)
        FROM (
            SELECT table_oid, json_agg(row_to_json(cr) ORDER BY pos) AS cols
            FROM column_rows cr
            GROUP BY table_oid
        ) grouped_cols
    ), '{}'::json),
    'indexes', COALESCE((
        SELECT json_object_agg(table_oid::text, idxs)
        FROM (
            SELECT table_oid, json_agg(row_to_json(ir) ORDER BY index_name) AS idxs
            FROM index_rows ir
            GROUP BY table_oid
        ) grouped_idxs
    ), '{}'::json)
)";

/// §4.5 step 6: attempt to install DDL event triggers that notify via
/// `pg_logical_emit_message`. Returns whether installation succeeded
/// (`ddlDetection`). On `INSUFFICIENT_PRIVILEGE`, swallow the error and log
/// once at warn level.
async fn install_ddl_triggers(client: &Client, shard: &ShardConfig, publications: &[String]) -> bool {
    let prefix = shard.id.message_prefix();
    let app_schema = shard.id.app_schema();
    let start_fn = format!("{}_ddl_notify_start", app_schema);
    let end_fn = format!("{}_ddl_notify_end", app_schema);
    let snapshot_fn = format!("{}_ddl_schema_snapshot", app_schema);

    // §4.8.2: `ddlStart`/`ddlUpdate` each embed a full catalog snapshot taken
    // synchronously at trigger time, since by the time either message is
    // decoded downstream the triggering DDL has already committed -- a
    // live query made then can no longer distinguish "before" from "after".
    let pub_list = publications
        .iter()
        .map(|p| format!("'{}'", p.replace('\'', "''")))
        .collect::<Vec<_>>()
        .join(", ");

    let sql = format!(
        r#"
        CREATE OR REPLACE FUNCTION "{app_schema}"."{snapshot_fn}"(pubs text[]) RETURNS json
        LANGUAGE sql STABLE AS $function${snapshot_query}$function$;

        CREATE OR REPLACE FUNCTION "{start_fn}"() RETURNS event_trigger AS $$
        DECLARE
            snap json;
        BEGIN
            snap := "{app_schema}"."{snapshot_fn}"(ARRAY[{pub_list}]);
            PERFORM pg_logical_emit_message(true, '{prefix}', json_build_object('type', 'ddlStart', 'version', 1, 'schema', snap)::text);
        END;
        $$ LANGUAGE plpgsql;

        DROP EVENT TRIGGER IF EXISTS "{start_fn}";
        CREATE EVENT TRIGGER "{start_fn}" ON ddl_command_start
            EXECUTE FUNCTION "{start_fn}"();

        CREATE OR REPLACE FUNCTION "{end_fn}"() RETURNS event_trigger AS $$
        DECLARE
            snap json;
        BEGIN
            IF TG_TAG IN ('CREATE TABLE', 'ALTER TABLE', 'CREATE INDEX', 'DROP TABLE', 'DROP INDEX', 'ALTER PUBLICATION', 'ALTER SCHEMA') THEN
                snap := "{app_schema}"."{snapshot_fn}"(ARRAY[{pub_list}]);
                PERFORM pg_logical_emit_message(true, '{prefix}', json_build_object('type', 'ddlUpdate', 'version', 1, 'schema', snap, 'event', json_build_object('tag', TG_TAG))::text);
            END IF;
        END;
        $$ LANGUAGE plpgsql;

        DROP EVENT TRIGGER IF EXISTS "{end_fn}";
        CREATE EVENT TRIGGER "{end_fn}" ON ddl_command_end
            EXECUTE FUNCTION "{end_fn}"();
        "#,
        snapshot_query = SNAPSHOT_QUERY,
    );

    match client.batch_execute(&sql).await {
        Ok(()) => true,
        Err(e) => {
            if e.code() == Some(&tokio_postgres::error::SqlState::INSUFFICIENT_PRIVILEGE) {
                warn!("insufficient privilege to install DDL event triggers; continuing in degraded mode (ddlDetection=false)");
                false
            } else {
                warn!("failed to install DDL event triggers: {e}; continuing in degraded mode");
                false
            }
        }
    }
}

/// `dropShard`: drop the two publications explicitly (`DROP SCHEMA CASCADE`
/// does not cascade to publications) and then the shard schemas.
pub async fn drop_shard(client: &Client, shard: &ShardConfig) -> Result<(), Error> {
    let app_schema = shard.id.app_schema();
    let upstream_schema = shard.id.upstream_schema();

    client
        .batch_execute(&format!(
            r#"
            DROP PUBLICATION IF EXISTS "{}";
            DROP PUBLICATION IF EXISTS "{}";
            DROP SCHEMA IF EXISTS "{app_schema}" CASCADE;
            DROP SCHEMA IF EXISTS "{upstream_schema}" CASCADE;
            "#,
            shard.default_publication_name(),
            shard.metadata_publication_name(),
        ))
        .await?;

    Ok(())
}
