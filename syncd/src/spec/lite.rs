//! Downstream (replica) projection of the upstream spec model.

use indexmap::IndexMap;

use super::types::{client_type, storage_type_string, ClientType};
use super::{ColumnSpec, IndexSpec, PgTypeClass, PublishedTableSpec, SortDirection, TableSpec};

/// Synthetic trailing column every replicated table carries: the commit
/// watermark at which the row last changed.
pub const VERSION_COLUMN: &str = "_0_version";

#[derive(Debug, Clone, PartialEq)]
pub struct LiteColumnSpec {
    pub pos: i16,
    /// `base|SUFFIX[|SUFFIX...]`. `notNull` is folded in here; the column's
    /// own `not_null` flag is always `false`.
    pub data_type: String,
}

/// Downstream projection of a [`TableSpec`]. Deterministic regardless of
/// the source column map's iteration order: columns are always emitted in
/// `pos` order, `_0_version` always last.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteTableSpec {
    /// Schema-qualified names with non-`public` schemas flatten to
    /// `"schema.name"`; `public` tables keep their bare name.
    pub name: String,
    pub columns: IndexMap<String, LiteColumnSpec>,
}

/// Flatten `(schema, name)` the way the replica names tables.
pub fn flatten_name(schema: &str, name: &str) -> String {
    if schema == "public" {
        name.to_string()
    } else {
        format!("{schema}.{name}")
    }
}

pub fn column_is_array(col: &ColumnSpec) -> bool {
    col.data_type.ends_with("[]") || col.elem_pg_type_class.is_some()
}

pub fn base_type_name(col: &ColumnSpec) -> String {
    col.data_type.trim_end_matches("[]").to_string()
}

/// `mapPostgresToLite`: deterministic, `_0_version` always last.
pub fn map_postgres_to_lite(table: &TableSpec) -> LiteTableSpec {
    let mut columns: Vec<_> = table.columns.values().collect();
    columns.sort_by_key(|c| c.pos);

    let mut lite_columns = IndexMap::new();
    for col in columns {
        let name = table
            .columns
            .iter()
            .find(|(_, c)| c.pos == col.pos)
            .map(|(n, _)| n.clone())
            .expect("column present");

        let base = base_type_name(col);
        let is_array = column_is_array(col);
        let data_type = storage_type_string(
            &base,
            col.pg_type_class,
            col.elem_pg_type_class,
            is_array,
            col.not_null,
        );

        lite_columns.insert(
            name,
            LiteColumnSpec {
                pos: col.pos,
                data_type,
            },
        );
    }

    lite_columns.insert(
        VERSION_COLUMN.to_string(),
        LiteColumnSpec {
            pos: lite_columns.len() as i16,
            // "TEXT" (not a bare "string" sentinel): SQLite assigns column
            // affinity by substring match on the declared type name, and a
            // name containing none of INT/CHAR/CLOB/TEXT/BLOB/REAL/FLOA/DOUB
            // falls through to NUMERIC affinity, which would coerce a
            // numeric-looking lexi watermark like "110" into an INTEGER
            // storage class and break later reads expecting text.
            data_type: "TEXT".to_string(),
        },
    );

    LiteTableSpec {
        name: flatten_name(&table.schema, &table.name),
        columns: lite_columns,
    }
}

/// `mapPostgresToLiteIndex`: renames the table and preserves column order.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteIndexSpec {
    pub name: String,
    pub table_name: String,
    pub unique: bool,
    pub columns: IndexMap<String, SortDirection>,
}

pub fn map_postgres_to_lite_index(index: &IndexSpec) -> LiteIndexSpec {
    let schema = index.schema.as_deref().unwrap_or("public");
    LiteIndexSpec {
        name: index.name.clone(),
        table_name: flatten_name(schema, &index.table_name),
        unique: index.unique,
        columns: index.columns.clone(),
    }
}

/// `LiteTableSpecWithKeys`: a `LiteTableSpec` with the chosen `primaryKey`
/// (the shortest all-`NOT NULL` unique index) and `unionKey` (the sorted
/// union of columns across every qualifying unique index).
#[derive(Debug, Clone, PartialEq)]
pub struct LiteTableSpecWithKeys {
    pub lite: LiteTableSpec,
    pub primary_key: Vec<String>,
    pub union_key: Vec<String>,
    /// Columns whose type maps to a client type; unmapped columns are
    /// excluded from this set but remain in `lite.columns`.
    pub client_columns: IndexMap<String, ClientType>,
}

/// A unique index all of whose columns are `NOT NULL` and whose columns
/// are fully represented in the replica.
fn qualifies(index: &IndexSpec, table: &PublishedTableSpec) -> bool {
    if !index.unique {
        return false;
    }
    index.columns.keys().all(|col| {
        table
            .table
            .columns
            .get(col)
            .map(|c| c.not_null)
            .unwrap_or(false)
    })
}

/// `computeZqlSpecs`: for each published table, choose a `primaryKey` (the
/// shortest all-`NOT_NULL` unique index, ties by lexicographic index name),
/// compute `unionKey`, and drop tables with no qualifying key.
pub fn compute_zql_specs(
    tables: &[PublishedTableSpec],
    indexes: &[IndexSpec],
) -> Vec<LiteTableSpecWithKeys> {
    let mut out = Vec::new();

    for table in tables {
        let table_indexes: Vec<&IndexSpec> = indexes
            .iter()
            .filter(|idx| {
                let schema = idx.schema.as_deref().unwrap_or(&table.table.schema);
                schema == table.table.schema && idx.table_name == table.table.name
            })
            .collect();

        let qualifying: Vec<&IndexSpec> = table_indexes
            .iter()
            .copied()
            .filter(|idx| qualifies(idx, table))
            .collect();

        let chosen = qualifying
            .iter()
            .min_by_key(|idx| (idx.columns.len(), idx.name.clone()))
            .map(|idx| idx.columns.keys().cloned().collect::<Vec<_>>())
            .or_else(|| table.table.primary_key.clone());

        let Some(primary_key) = chosen else {
            continue;
        };

        let mut union_key: Vec<String> = qualifying
            .iter()
            .flat_map(|idx| idx.columns.keys().cloned())
            .collect();
        union_key.sort();
        union_key.dedup();
        if union_key.is_empty() {
            union_key = primary_key.clone();
        }

        let lite = map_postgres_to_lite(&table.table);

        let mut client_columns = IndexMap::new();
        for (name, col) in &table.table.columns {
            let base = base_type_name(col);
            if let Some(ct) = client_type(&base) {
                client_columns.insert(name.clone(), ct);
            }
        }

        out.push(LiteTableSpecWithKeys {
            lite,
            primary_key,
            union_key,
            client_columns,
        });
    }

    out
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::{PgTypeClass, PublicationMembership, ReplicaIdentity};
    use indexmap::indexmap;

    fn col(pos: i16, data_type: &str, not_null: bool) -> ColumnSpec {
        ColumnSpec {
            pos,
            data_type: data_type.to_string(),
            type_oid: None,
            pg_type_class: Some(PgTypeClass::Base),
            elem_pg_type_class: None,
            character_maximum_length: None,
            not_null,
            default: None,
        }
    }

    #[test]
    fn test_invariant_3_version_always_last() {
        let table = TableSpec {
            schema: "public".into(),
            name: "foo".into(),
            columns: indexmap! {
                "b".to_string() => col(1, "int4", true),
                "a".to_string() => col(0, "text", false),
            },
            primary_key: None,
        };

        let lite = map_postgres_to_lite(&table);
        let (last_name, _) = lite.columns.last().unwrap();
        assert_eq!(last_name, VERSION_COLUMN);
        // "a" (pos 0) before "b" (pos 1) regardless of map insertion order.
        let names: Vec<_> = lite.columns.keys().cloned().collect();
        assert_eq!(names, vec!["a", "b", "_0_version"]);
    }

    #[test]
    fn test_invariant_3_deterministic_regardless_of_order() {
        let columns_a = indexmap! {
            "a".to_string() => col(0, "text", false),
            "b".to_string() => col(1, "int4", true),
        };
        let columns_b = indexmap! {
            "b".to_string() => col(1, "int4", true),
            "a".to_string() => col(0, "text", false),
        };

        let table_a = TableSpec {
            schema: "public".into(),
            name: "foo".into(),
            columns: columns_a,
            primary_key: None,
        };
        let table_b = TableSpec {
            columns: columns_b,
            ..table_a.clone()
        };

        assert_eq!(map_postgres_to_lite(&table_a), map_postgres_to_lite(&table_b));
    }

    #[test]
    fn test_flatten_name() {
        assert_eq!(flatten_name("public", "foo"), "foo");
        assert_eq!(flatten_name("myapp_0", "clients"), "myapp_0.clients");
    }

    #[test]
    fn test_invariant_8_shortest_key_wins() {
        let table = PublishedTableSpec {
            table: TableSpec {
                schema: "public".into(),
                name: "join_table".into(),
                columns: indexmap! {
                    "id1".to_string() => col(0, "text", true),
                    "id2".to_string() => col(1, "text", true),
                    "id3".to_string() => col(2, "text", true),
                },
                primary_key: None,
            },
            oid: 1,
            replica_identity: ReplicaIdentity::Index,
            publications: indexmap! { "pub".to_string() => PublicationMembership::default() },
        };

        let wide = IndexSpec {
            name: "wide_key".into(),
            schema: None,
            table_name: "join_table".into(),
            unique: true,
            is_replica_identity: false,
            is_immediate: true,
            columns: indexmap! {
                "id1".to_string() => SortDirection::Asc,
                "id2".to_string() => SortDirection::Asc,
                "id3".to_string() => SortDirection::Asc,
            },
        };
        let narrow = IndexSpec {
            name: "narrow_key".into(),
            columns: indexmap! { "id1".to_string() => SortDirection::Asc, "id2".to_string() => SortDirection::Asc },
            ..wide.clone()
        };

        let specs = compute_zql_specs(&[table], &[wide, narrow]);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].primary_key, vec!["id1", "id2"]);
        assert_eq!(specs[0].union_key, vec!["id1", "id2", "id3"]);
    }

    #[test]
    fn test_tables_with_no_qualifying_key_excluded() {
        let table = PublishedTableSpec {
            table: TableSpec {
                schema: "public".into(),
                name: "no_key".into(),
                columns: indexmap! { "v".to_string() => col(0, "text", false) },
                primary_key: None,
            },
            oid: 1,
            replica_identity: ReplicaIdentity::Default,
            publications: indexmap! { "pub".to_string() => PublicationMembership::default() },
        };

        let specs = compute_zql_specs(&[table], &[]);
        assert!(specs.is_empty());
    }
}
