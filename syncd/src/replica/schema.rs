//! DDL generation for the replica store.
//!
//! Column types are stored verbatim as `<base>|<suffix>[|<suffix>]`
//! strings (double-quoted so SQLite's permissive type-name grammar accepts
//! the `|` characters); downstream consumers parse the suffixes back out
//! rather than relying on SQLite's own type affinity.

use crate::spec::lite::{LiteIndexSpec, LiteTableSpec};
use crate::spec::SortDirection;

pub const INTERNAL_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS "_zero.replicationConfig" (
    publications TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS "_zero.replicationState" (
    stateVersion TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS "_zero.changeLog" (
    watermark TEXT,
    data TEXT
);
"#;

pub fn create_table_sql(table: &LiteTableSpec) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|(name, col)| format!("\"{name}\" \"{}\"", col.data_type))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
        table.name,
        columns.join(", ")
    )
}

pub fn create_index_sql(index: &LiteIndexSpec) -> String {
    let unique = if index.unique { "UNIQUE " } else { "" };
    let columns: Vec<String> = index
        .columns
        .iter()
        .map(|(name, dir)| {
            let dir = match dir {
                SortDirection::Asc => "ASC",
                SortDirection::Desc => "DESC",
            };
            format!("\"{name}\" {dir}")
        })
        .collect();

    format!(
        "CREATE {unique}INDEX IF NOT EXISTS \"{}\" ON \"{}\" ({})",
        index.name,
        index.table_name,
        columns.join(", ")
    )
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::lite::map_postgres_to_lite;
    use crate::spec::{ColumnSpec, PgTypeClass, TableSpec};
    use indexmap::indexmap;

    #[test]
    fn test_create_table_sql_quotes_type_strings() {
        let table = TableSpec {
            schema: "public".into(),
            name: "widgets".into(),
            columns: indexmap! {
                "id".to_string() => ColumnSpec {
                    pos: 0, data_type: "int4".into(), type_oid: None,
                    pg_type_class: Some(PgTypeClass::Base), elem_pg_type_class: None,
                    character_maximum_length: None, not_null: true, default: None,
                },
            },
            primary_key: Some(vec!["id".into()]),
        };
        let lite = map_postgres_to_lite(&table);
        let sql = create_table_sql(&lite);
        assert!(sql.contains("\"id\" \"int4|NOT_NULL\""));
        assert!(sql.contains("\"_0_version\" \"TEXT\""));
    }
}
