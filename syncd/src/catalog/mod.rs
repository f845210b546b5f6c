//! C4: Schema discovery. Queries upstream catalogs to produce a
//! [`crate::spec::PublishedSchema`] and validates it.

mod queries;

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tokio_postgres::Client;

use crate::spec::{
    ColumnSpec, IndexSpec, PgTypeClass, PublicationMembership, PublishedSchema,
    PublishedTableSpec, ReplicaIdentity, SortDirection, TableSpec,
};
use crate::spec::lite::VERSION_COLUMN;

#[derive(Debug, Error)]
pub enum Error {
    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("table {schema}.{table} is exported with different columns across publications")]
    ColumnSetMismatch { schema: String, table: String },

    #[error("unsupported table schema: {0}")]
    UnsupportedTableSchema(String),

    #[error("reserved column name \"{1}\" in {0}")]
    ReservedColumnName(String, String),

    #[error("upstream wal_level is \"{0}\", must be \"logical\"")]
    WalLevelNotLogical(String),

    #[error("upstream server_version_num {0} is below the minimum supported (150000)")]
    ServerVersionTooOld(i32),

    #[error("unknown pg_type_class \"{0}\"")]
    UnknownTypeClass(String),

    #[error("unsupported default on {0}.{1}: {2}")]
    UnsupportedColumnDefault(String, String, crate::spec::types::DefaultError),

    #[error("malformed ddl trigger schema snapshot: {0}")]
    MalformedSnapshot(String),
}

static IDENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_-]*$").unwrap());

/// Fail fast at startup if the upstream cannot support logical replication
/// the way this service requires.
pub async fn check_server_requirements(client: &Client) -> Result<(), Error> {
    let row = client.query_one(queries::SERVER_SETTINGS, &[]).await?;
    let wal_level: String = row.get(0);
    let version: String = row.get(1);
    let version_num: i32 = version.parse().unwrap_or(0);

    if wal_level != "logical" {
        return Err(Error::WalLevelNotLogical(wal_level));
    }
    if version_num < 150000 {
        return Err(Error::ServerVersionTooOld(version_num));
    }
    Ok(())
}

fn type_class_from_char(c: &str) -> Result<PgTypeClass, Error> {
    match c {
        "b" => Ok(PgTypeClass::Base),
        "c" => Ok(PgTypeClass::Composite),
        "d" => Ok(PgTypeClass::Domain),
        "e" => Ok(PgTypeClass::Enum),
        "p" => Ok(PgTypeClass::Pseudo),
        "r" => Ok(PgTypeClass::Range),
        "m" => Ok(PgTypeClass::Multirange),
        other => Err(Error::UnknownTypeClass(other.to_string())),
    }
}

fn replica_identity_from_char(c: &str) -> ReplicaIdentity {
    match c {
        "n" => ReplicaIdentity::Nothing,
        "f" => ReplicaIdentity::Full,
        "i" => ReplicaIdentity::Index,
        _ => ReplicaIdentity::Default,
    }
}

/// Row shapes shared between the live catalog query path (`get_publication_info`,
/// decoded from [`tokio_postgres::Row`]) and the embedded DDL-trigger snapshot
/// path (`schema_from_snapshot`, decoded from the `schema` JSON field a DDL
/// event trigger emits). Both produce identical SQL column sets -- the
/// trigger's `_ddl_schema_snapshot` function mirrors `queries::
/// PUBLICATION_TABLES`/`TABLE_COLUMNS`/`TABLE_INDEXES` -- so one row-to-spec
/// builder (`assemble_schema`) serves both.
#[derive(Debug, Clone, serde::Deserialize)]
struct PubTableRow {
    schema: String,
    table_name: String,
    table_oid: i64,
    replica_identity: String,
    publication: String,
    row_filter: Option<String>,
    columns: Option<Vec<String>>,
}

impl PubTableRow {
    fn from_row(row: &tokio_postgres::Row) -> Self {
        Self {
            schema: row.get("schema"),
            table_name: row.get("table_name"),
            table_oid: row.get("table_oid"),
            replica_identity: row.get("replica_identity"),
            publication: row.get("publication"),
            row_filter: row.get("row_filter"),
            columns: row.get("columns"),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct ColumnRow {
    pos: i16,
    name: String,
    data_type: String,
    type_oid: i64,
    type_class: String,
    elem_type_class: Option<String>,
    character_maximum_length: Option<i32>,
    not_null: bool,
    default_expr: Option<String>,
    pk_pos: Option<i32>,
}

impl ColumnRow {
    fn from_row(row: &tokio_postgres::Row) -> Self {
        Self {
            pos: row.get("pos"),
            name: row.get("name"),
            data_type: row.get("data_type"),
            type_oid: row.get("type_oid"),
            type_class: row.get("type_class"),
            elem_type_class: row.get("elem_type_class"),
            character_maximum_length: row.get("character_maximum_length"),
            not_null: row.get("not_null"),
            default_expr: row.get("default_expr"),
            pk_pos: row.get("pk_pos"),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
struct IndexRow {
    index_name: String,
    is_unique: bool,
    is_replica_identity: bool,
    is_immediate: bool,
    key_attrs: Vec<i16>,
    key_options: Vec<i32>,
    n_key_atts: i16,
}

impl IndexRow {
    fn from_row(row: &tokio_postgres::Row) -> Self {
        Self {
            index_name: row.get("index_name"),
            is_unique: row.get("is_unique"),
            is_replica_identity: row.get("is_replica_identity"),
            is_immediate: row.get("is_immediate"),
            key_attrs: row.get("key_attrs"),
            key_options: row.get("key_options"),
            n_key_atts: row.get("n_key_atts"),
        }
    }
}

struct TableMeta {
    schema: String,
    name: String,
    oid: u32,
    replica_identity: ReplicaIdentity,
    publications: IndexMap<String, PublicationMembership>,
    columns_by_pub: HashMap<String, HashSet<String>>,
}

fn group_tables(table_rows: &[PubTableRow]) -> HashMap<u32, TableMeta> {
    let mut tables: HashMap<u32, TableMeta> = HashMap::new();

    for row in table_rows {
        let oid = row.table_oid as u32;
        let columns: HashSet<String> = row.columns.clone().unwrap_or_default().into_iter().collect();

        let entry = tables.entry(oid).or_insert_with(|| TableMeta {
            schema: row.schema.clone(),
            name: row.table_name.clone(),
            oid,
            replica_identity: replica_identity_from_char(&row.replica_identity),
            publications: IndexMap::new(),
            columns_by_pub: HashMap::new(),
        });

        entry.publications.insert(
            row.publication.clone(),
            PublicationMembership { row_filter: row.row_filter.clone() },
        );
        entry.columns_by_pub.insert(row.publication.clone(), columns);
    }

    tables
}

// Invariant 4 / §4.4 step 2: same table in multiple publications must
// publish the same column set.
fn check_column_sets(tables: &HashMap<u32, TableMeta>) -> Result<(), Error> {
    for meta in tables.values() {
        let mut sets = meta.columns_by_pub.values();
        if let Some(first) = sets.next() {
            for other in sets {
                if other != first {
                    return Err(Error::ColumnSetMismatch {
                        schema: meta.schema.clone(),
                        table: meta.name.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

struct LoadedColumn {
    spec: ColumnSpec,
    pk_pos: Option<i32>,
}

fn rows_to_columns(rows: &[ColumnRow]) -> Result<Vec<(String, LoadedColumn)>, Error> {
    let mut out = Vec::new();
    for row in rows {
        out.push((
            row.name.clone(),
            LoadedColumn {
                spec: ColumnSpec {
                    pos: row.pos,
                    data_type: row.data_type.clone(),
                    type_oid: Some(row.type_oid as u32),
                    pg_type_class: Some(type_class_from_char(&row.type_class)?),
                    elem_pg_type_class: row
                        .elem_type_class
                        .as_deref()
                        .map(type_class_from_char)
                        .transpose()?,
                    character_maximum_length: row.character_maximum_length,
                    not_null: row.not_null,
                    default: row.default_expr.clone(),
                },
                pk_pos: row.pk_pos,
            },
        ));
    }
    Ok(out)
}

fn build_table_specs(
    tables: HashMap<u32, TableMeta>,
    columns_by_oid: &HashMap<u32, Vec<ColumnRow>>,
) -> Result<Vec<PublishedTableSpec>, Error> {
    let empty = Vec::new();
    let mut published_tables = Vec::new();

    for meta in tables.into_values() {
        let rows = columns_by_oid.get(&meta.oid).unwrap_or(&empty);
        let columns = rows_to_columns(rows)?;
        let mut primary_key: Vec<(i32, String)> = columns
            .iter()
            .filter_map(|(name, c)| c.pk_pos.map(|pos| (pos, name.clone())))
            .collect();
        primary_key.sort_by_key(|(pos, _)| *pos);
        let primary_key: Vec<String> = primary_key.into_iter().map(|(_, name)| name).collect();

        let table_spec = TableSpec {
            schema: meta.schema.clone(),
            name: meta.name.clone(),
            columns: columns.into_iter().map(|(n, c)| (n, c.spec)).collect(),
            primary_key: if primary_key.is_empty() {
                None
            } else {
                Some(primary_key)
            },
        };

        published_tables.push(PublishedTableSpec {
            table: table_spec,
            oid: meta.oid,
            replica_identity: meta.replica_identity,
            publications: meta.publications,
        });
    }

    published_tables.sort_by(|a, b| {
        (a.table.schema.as_str(), a.table.name.as_str())
            .cmp(&(b.table.schema.as_str(), b.table.name.as_str()))
    });

    Ok(published_tables)
}

fn build_indexes(
    published_tables: &[PublishedTableSpec],
    indexes_by_oid: &HashMap<u32, Vec<IndexRow>>,
) -> Vec<IndexSpec> {
    let empty = Vec::new();
    let mut indexes = Vec::new();

    for table in published_tables {
        let table_columns = &table.table.columns;
        let rows = indexes_by_oid.get(&table.oid).unwrap_or(&empty);

        'index: for row in rows {
            // `indkey` lists key columns first, then any `INCLUDE`d columns;
            // only the key prefix participates in column order/direction, so
            // an `INCLUDE`d column -- generated or otherwise -- is dropped
            // here rather than disqualifying the whole index (§4.4 step 4).
            let key_attrs = &row.key_attrs[..(row.n_key_atts as usize).min(row.key_attrs.len())];

            let mut columns = IndexMap::new();
            for (i, attnum) in key_attrs.iter().enumerate() {
                // generate_subscripts/indkey is 1-based attnum matched by pos.
                let name = table_columns
                    .iter()
                    .find(|(_, c)| c.pos == *attnum)
                    .map(|(n, _)| n.clone());

                let Some(name) = name else {
                    // Column not covered by the publication -- skip this index.
                    continue 'index;
                };

                let desc = row.key_options.get(i).copied().unwrap_or(0) & 0x1 != 0;
                columns.insert(
                    name,
                    if desc {
                        SortDirection::Desc
                    } else {
                        SortDirection::Asc
                    },
                );
            }

            if columns.is_empty() {
                continue;
            }

            indexes.push(IndexSpec {
                name: row.index_name.clone(),
                schema: Some(table.table.schema.clone()),
                table_name: table.table.name.clone(),
                unique: row.is_unique,
                is_replica_identity: row.is_replica_identity,
                is_immediate: row.is_immediate,
                columns,
            });
        }
    }

    indexes.sort_by(|a, b| {
        let sa = a.schema.as_deref().unwrap_or("");
        let sb = b.schema.as_deref().unwrap_or("");
        (sa, a.table_name.as_str(), a.name.as_str()).cmp(&(sb, b.table_name.as_str(), b.name.as_str()))
    });

    indexes
}

fn assemble_schema(
    publications: &[String],
    table_rows: &[PubTableRow],
    columns_by_oid: &HashMap<u32, Vec<ColumnRow>>,
    indexes_by_oid: &HashMap<u32, Vec<IndexRow>>,
) -> Result<PublishedSchema, Error> {
    let tables = group_tables(table_rows);
    check_column_sets(&tables)?;
    let published_tables = build_table_specs(tables, columns_by_oid)?;
    let indexes = build_indexes(&published_tables, indexes_by_oid);

    Ok(PublishedSchema {
        publications: publications.to_vec(),
        tables: published_tables,
        indexes,
    })
}

/// `getPublicationInfo`: query the set of `(schema, table, publication,
/// columns)` triples, reject tables whose published columns disagree
/// across publications, then load full column and index specs.
pub async fn get_publication_info(
    client: &Client,
    publications: &[String],
) -> Result<PublishedSchema, Error> {
    let rows = client
        .query(queries::PUBLICATION_TABLES, &[&publications])
        .await?;
    let table_rows: Vec<PubTableRow> = rows.iter().map(PubTableRow::from_row).collect();

    let oids: HashSet<u32> = table_rows.iter().map(|r| r.table_oid as u32).collect();

    let mut columns_by_oid = HashMap::new();
    for oid in &oids {
        let rows = client.query(queries::TABLE_COLUMNS, &[&(*oid as i64)]).await?;
        columns_by_oid.insert(*oid, rows.iter().map(ColumnRow::from_row).collect());
    }

    let mut indexes_by_oid = HashMap::new();
    for oid in &oids {
        let rows = client.query(queries::TABLE_INDEXES, &[&(*oid as i64)]).await?;
        indexes_by_oid.insert(*oid, rows.iter().map(IndexRow::from_row).collect());
    }

    assemble_schema(publications, &table_rows, &columns_by_oid, &indexes_by_oid)
}

/// §4.8.2: decode a DDL event trigger's embedded `schema` snapshot (produced
/// synchronously inside the trigger by the `_ddl_schema_snapshot` SQL
/// function installed alongside it -- see `provisioner::install_ddl_triggers`)
/// into a [`PublishedSchema`], using the same row-to-spec logic as a live
/// catalog query. The change maker diffs two of these (`ddlStart`'s and
/// `ddlUpdate`'s) rather than re-querying the catalog after the triggering
/// transaction has already committed.
pub fn schema_from_snapshot(
    publications: &[String],
    snapshot: &serde_json::Value,
) -> Result<PublishedSchema, Error> {
    #[derive(serde::Deserialize)]
    struct Snapshot {
        #[serde(default)]
        tables: Vec<PubTableRow>,
        #[serde(default)]
        columns: HashMap<u32, Vec<ColumnRow>>,
        #[serde(default)]
        indexes: HashMap<u32, Vec<IndexRow>>,
    }

    let snapshot: Snapshot = serde_json::from_value(snapshot.clone())
        .map_err(|e| Error::MalformedSnapshot(e.to_string()))?;

    assemble_schema(publications, &snapshot.tables, &snapshot.columns, &snapshot.indexes)
}

/// `validate(table)`: structural checks a [`PublishedTableSpec`] must pass
/// before it can be used downstream. Returns non-fatal warnings separately
/// from errors.
pub fn validate(
    table: &PublishedTableSpec,
    app_schema: &str,
    upstream_schema: &str,
) -> Result<Vec<String>, Error> {
    let mut warnings = Vec::new();

    if table.table.columns.contains_key(VERSION_COLUMN) {
        return Err(Error::ReservedColumnName(
            table.qualified_name(),
            VERSION_COLUMN.to_string(),
        ));
    }

    if !IDENT_RE.is_match(&table.table.name) {
        return Err(Error::UnsupportedTableSchema(format!(
            "table name \"{}\" contains forbidden characters",
            table.table.name
        )));
    }

    for (name, col) in &table.table.columns {
        if !IDENT_RE.is_match(name) {
            return Err(Error::UnsupportedTableSchema(format!(
                "column name \"{name}\" in {} contains forbidden characters",
                table.qualified_name()
            )));
        }

        // §4.2: defaults are mapped conservatively -- literal constants and
        // cast-wrapped literals only. Anything else (function calls, column
        // references, `CURRENT_*`) is fatal, not merely dropped from the
        // client projection like an unmapped *type* would be.
        if let Some(default) = &col.default {
            crate::spec::types::map_default_expr(default).map_err(|e| {
                Error::UnsupportedColumnDefault(table.qualified_name(), name.clone(), e)
            })?;
        }
    }

    if table.table.schema != "public"
        && table.table.schema != app_schema
        && table.table.schema != upstream_schema
    {
        return Err(Error::UnsupportedTableSchema(format!(
            "schema \"{}\" is not public, the app schema, or the upstream schema",
            table.table.schema
        )));
    }

    if table.table.primary_key.is_none()
        && matches!(table.replica_identity, ReplicaIdentity::Default)
    {
        warnings.push(format!(
            "{} has no primary key and replica identity DEFAULT; it will not be usable downstream without a qualifying unique index",
            table.qualified_name()
        ));
    }

    Ok(warnings)
}

#[cfg(test)]
mod test {
    use super::*;
    use indexmap::indexmap;

    fn table(name: &str, pk: Option<Vec<String>>, replident: ReplicaIdentity) -> PublishedTableSpec {
        PublishedTableSpec {
            table: TableSpec {
                schema: "public".into(),
                name: name.into(),
                columns: indexmap! {
                    "id".to_string() => ColumnSpec {
                        pos: 0,
                        data_type: "int4".into(),
                        type_oid: None,
                        pg_type_class: Some(PgTypeClass::Base),
                        elem_pg_type_class: None,
                        character_maximum_length: None,
                        not_null: true,
                        default: None,
                    },
                },
                primary_key: pk,
            },
            oid: 1,
            replica_identity: replident,
            publications: IndexMap::new(),
        }
    }

    #[test]
    fn test_reserved_column_rejected() {
        let mut t = table("foo", Some(vec!["id".into()]), ReplicaIdentity::Default);
        t.table.columns.insert(
            VERSION_COLUMN.to_string(),
            ColumnSpec {
                pos: 1,
                data_type: "text".into(),
                type_oid: None,
                pg_type_class: None,
                elem_pg_type_class: None,
                character_maximum_length: None,
                not_null: false,
                default: None,
            },
        );
        assert!(validate(&t, "app", "app_0").is_err());
    }

    #[test]
    fn test_schema_not_allowed_rejected() {
        let mut t = table("foo", Some(vec!["id".into()]), ReplicaIdentity::Default);
        t.table.schema = "other".into();
        assert!(validate(&t, "app", "app_0").is_err());
    }

    #[test]
    fn test_no_primary_key_default_identity_warns_not_errors() {
        let t = table("foo", None, ReplicaIdentity::Default);
        let warnings = validate(&t, "app", "app_0").unwrap();
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_function_call_default_rejected() {
        let mut t = table("foo", Some(vec!["id".into()]), ReplicaIdentity::Default);
        t.table.columns.get_mut("id").unwrap().default = Some("now()".to_string());
        assert!(matches!(
            validate(&t, "app", "app_0"),
            Err(Error::UnsupportedColumnDefault(..))
        ));
    }

    #[test]
    fn test_literal_default_accepted() {
        let mut t = table("foo", Some(vec!["id".into()]), ReplicaIdentity::Default);
        t.table.columns.get_mut("id").unwrap().default = Some("42".to_string());
        assert!(validate(&t, "app", "app_0").is_ok());
    }

    #[test]
    fn test_schema_from_snapshot_matches_live_shape() {
        let snapshot = serde_json::json!({
            "tables": [{
                "schema": "public",
                "table_name": "widgets",
                "table_oid": 16420,
                "replica_identity": "d",
                "publication": "_app_public_0",
                "row_filter": null,
                "columns": ["id", "name"],
            }],
            "columns": {
                "16420": [
                    {
                        "pos": 1, "name": "id", "data_type": "integer", "type_oid": 23,
                        "type_class": "b", "elem_type_class": null,
                        "character_maximum_length": null, "not_null": true,
                        "default_expr": null, "pk_pos": 1,
                    },
                    {
                        "pos": 2, "name": "name", "data_type": "text", "type_oid": 25,
                        "type_class": "b", "elem_type_class": null,
                        "character_maximum_length": null, "not_null": false,
                        "default_expr": null, "pk_pos": null,
                    },
                ],
            },
            "indexes": {},
        });

        let schema =
            schema_from_snapshot(&["_app_public_0".to_string()], &snapshot).unwrap();

        let table = schema.table_by_oid(16420).expect("table present");
        assert_eq!(table.table.name, "widgets");
        assert_eq!(table.table.primary_key.as_deref(), Some(["id".to_string()].as_slice()));
        assert_eq!(table.table.columns.len(), 2);
        assert_eq!(table.replica_identity, ReplicaIdentity::Default);
    }

    #[test]
    fn test_schema_from_snapshot_rejects_malformed_payload() {
        let snapshot = serde_json::json!({"tables": "not-an-array"});
        assert!(matches!(
            schema_from_snapshot(&[], &snapshot),
            Err(Error::MalformedSnapshot(_))
        ));
    }
}
