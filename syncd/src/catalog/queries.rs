//! Raw catalog SQL backing [`super::get_publication_info`].

/// One `(schema, table, publication, row_filter)` triple per table per
/// publication it belongs to.
pub const PUBLICATION_TABLES: &str = "
SELECT
    n.nspname AS schema,
    c.relname AS table_name,
    c.oid AS table_oid,
    c.relreplident AS replica_identity,
    pt.pubname AS publication,
    pg_get_expr(pt.qual, pt.relid) AS row_filter,
    pt.attnames AS columns
FROM pg_publication_tables pt
JOIN pg_class c ON c.relname = pt.tablename
JOIN pg_namespace n ON n.oid = c.relnamespace AND n.nspname = pt.schemaname
WHERE pt.pubname = ANY($1)
ORDER BY n.nspname, c.relname";

/// Columns for a table, ordered by catalog position. `pk_pos` is the
/// column's 1-based position in the primary key, if any.
pub const TABLE_COLUMNS: &str = "
SELECT
    a.attnum AS pos,
    a.attname AS name,
    format_type(a.atttypid, a.atttypmod) AS data_type,
    a.atttypid AS type_oid,
    t.typtype AS type_class,
    et.typtype AS elem_type_class,
    a.attndims > 0 OR t.typcategory = 'A' AS is_array,
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
WHERE a.attrelid = $1
  AND a.attnum > 0
  AND NOT a.attisdropped
  AND a.attgenerated = ''
ORDER BY a.attnum";

/// Indexes on a table, with their key-attribute vectors and option bits.
/// Expression indexes (`indexprs IS NOT NULL`) and partial indexes
/// (`indpred IS NOT NULL`) are excluded in the `WHERE` clause. `indkey`
/// carries key columns followed by any `INCLUDE`d columns; `n_key_atts`
/// lets the caller slice off just the key prefix (`indoption` only has
/// entries for key columns, so an `INCLUDE`d column -- generated or not --
/// never participates in direction/eligibility checks).
pub const TABLE_INDEXES: &str = "
SELECT
    ic.relname AS index_name,
    i.indisunique AS is_unique,
    i.indisreplident AS is_replica_identity,
    i.indimmediate AS is_immediate,
    i.indkey AS key_attrs,
    i.indoption AS key_options,
    i.indnkeyatts AS n_key_atts
FROM pg_index i
JOIN pg_class ic ON ic.oid = i.indexrelid
WHERE i.indrelid = $1
  AND i.indexprs IS NULL
  AND i.indpred IS NULL
ORDER BY ic.relname";

/// Check `wal_level` and server version (spec requires `wal_level = logical`
/// and server >= 15).
pub const SERVER_SETTINGS: &str = "SELECT current_setting('wal_level'), current_setting('server_version_num')";
