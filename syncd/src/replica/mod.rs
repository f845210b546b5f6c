//! The embedded SQLite-compatible replica: the local store initial sync
//! fills and the change applier keeps current.

mod schema;

use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use thiserror::Error;
use tokio_postgres::Row as PgRow;

use crate::spec::lite::{column_is_array, LiteIndexSpec, LiteTableSpec, VERSION_COLUMN};
use crate::spec::types::is_boolean_type;
use crate::spec::{ColumnSpec, TableSpec};

pub use schema::{create_index_sql, create_table_sql};

#[derive(Debug, Error)]
pub enum Error {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Pg(#[from] tokio_postgres::Error),

    #[error("replica has no replicationState row; run initial sync first")]
    NotInitialized,
}

/// One shard's replica file. Single writer: the initial-sync process and
/// the stream applier never run concurrently on it.
pub struct Replica {
    conn: Connection,
}

impl Replica {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        Ok(Self { conn })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "OFF")?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Create the `_zero.*` internal tables. Idempotent.
    pub fn init_internal_tables(&self) -> Result<(), Error> {
        self.conn.execute_batch(schema::INTERNAL_TABLES_SQL)?;
        Ok(())
    }

    pub fn create_table(&self, table: &LiteTableSpec) -> Result<(), Error> {
        self.conn.execute(&create_table_sql(table), [])?;
        Ok(())
    }

    pub fn create_index(&self, index: &LiteIndexSpec) -> Result<(), Error> {
        self.conn.execute(&create_index_sql(index), [])?;
        Ok(())
    }

    pub fn drop_table(&self, name: &str) -> Result<(), Error> {
        self.conn
            .execute(&format!("DROP TABLE IF EXISTS \"{name}\""), [])?;
        Ok(())
    }

    pub fn drop_index(&self, name: &str) -> Result<(), Error> {
        self.conn
            .execute(&format!("DROP INDEX IF EXISTS \"{name}\""), [])?;
        Ok(())
    }

    /// `_zero.replicationConfig` + `_zero.replicationState` after a
    /// successful initial sync.
    pub fn persist_initial_sync(
        &self,
        publications: &[String],
        replica_version: &str,
    ) -> Result<(), Error> {
        let publications_json = serde_json::to_string(publications).unwrap_or_default();
        self.conn.execute(
            "INSERT INTO \"_zero.replicationConfig\" (publications) VALUES (?1)",
            [&publications_json],
        )?;
        self.conn.execute(
            "INSERT INTO \"_zero.replicationState\" (stateVersion) VALUES (?1)",
            [replica_version],
        )?;
        Ok(())
    }

    pub fn state_version(&self) -> Result<String, Error> {
        self.conn
            .query_row(
                "SELECT stateVersion FROM \"_zero.replicationState\"",
                [],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Error::NotInitialized,
                other => Error::Sqlite(other),
            })
    }

    pub fn set_state_version(&self, version: &str) -> Result<(), Error> {
        self.conn.execute(
            "UPDATE \"_zero.replicationState\" SET stateVersion = ?1",
            [version],
        )?;
        Ok(())
    }

    /// Whether a table already exists in the replica (used by the change
    /// maker to decide whether a `create-table` DDL event is a no-op replay).
    pub fn table_exists(&self, name: &str) -> Result<bool, Error> {
        let count: i64 = self.conn.query_row(
            "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// §4.6 step 4: insert a cursor-fetched chunk of upstream rows into the
    /// replica. `rows` are already cast to the replica's storage convention
    /// by the caller's `SELECT` (see `initial_sync::select_expr`): booleans
    /// come back as `int4` `0`/`1`, everything else as `text`. A chunk whose
    /// length equals `batch_size` is inserted as a single multi-row `INSERT`
    /// statement; a shorter (final, partial) chunk is inserted row by row.
    pub fn insert_rows(
        &self,
        lite: &LiteTableSpec,
        source: &TableSpec,
        rows: &[PgRow],
        replica_version: &str,
        batch_size: usize,
    ) -> Result<(), Error> {
        if rows.is_empty() {
            return Ok(());
        }

        let col_specs: Vec<(&str, &ColumnSpec)> =
            source.columns.iter().map(|(n, c)| (n.as_str(), c)).collect();

        if rows.len() == batch_size {
            self.insert_statement(lite, &col_specs, rows, replica_version)
        } else {
            for row in rows {
                self.insert_statement(lite, &col_specs, std::slice::from_ref(row), replica_version)?;
            }
            Ok(())
        }
    }

    fn insert_statement(
        &self,
        lite: &LiteTableSpec,
        col_specs: &[(&str, &ColumnSpec)],
        rows: &[PgRow],
        replica_version: &str,
    ) -> Result<(), Error> {
        let ncols = col_specs.len() + 1;

        let mut column_list: Vec<String> =
            col_specs.iter().map(|(n, _)| format!("\"{n}\"")).collect();
        column_list.push(format!("\"{VERSION_COLUMN}\""));

        let row_placeholder = format!("({})", vec!["?"; ncols].join(", "));
        let values_clause = vec![row_placeholder; rows.len()].join(", ");

        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES {}",
            lite.name,
            column_list.join(", "),
            values_clause
        );

        let mut params: Vec<SqlValue> = Vec::with_capacity(rows.len() * ncols);
        for row in rows {
            for (i, (_name, col)) in col_specs.iter().enumerate() {
                params.push(pg_cell_to_sql(row, i, col)?);
            }
            params.push(SqlValue::Text(replica_version.to_string()));
        }

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        self.conn.execute(&sql, param_refs.as_slice())?;
        Ok(())
    }
}

/// Read one already-cast column back out of an upstream row. Boolean
/// columns were selected as `int4` (`CASE WHEN ... THEN 1 ELSE 0 END`);
/// every other column (including arrays and JSON, both already
/// JSON-stringified by the caller's `SELECT`) was selected as `text`.
fn pg_cell_to_sql(row: &PgRow, idx: usize, col: &ColumnSpec) -> Result<SqlValue, Error> {
    let base = crate::spec::lite::base_type_name(col);
    if !column_is_array(col) && is_boolean_type(&base) {
        let value: Option<i32> = row.try_get(idx)?;
        Ok(value.map(|v| SqlValue::Integer(v as i64)).unwrap_or(SqlValue::Null))
    } else {
        let value: Option<String> = row.try_get(idx)?;
        Ok(value.map(SqlValue::Text).unwrap_or(SqlValue::Null))
    }
}

/// Create replica tables and leave indexes for later, per the initial-sync
/// ordering (data loads materially faster without secondary indexes).
pub fn create_tables(replica: &Replica, tables: &[LiteTableSpec]) -> Result<(), Error> {
    for table in tables {
        replica.create_table(table)?;
    }
    Ok(())
}

pub fn create_indexes(replica: &Replica, indexes: &[LiteIndexSpec]) -> Result<(), Error> {
    for index in indexes {
        replica.create_index(index)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::spec::lite::map_postgres_to_lite;
    use crate::spec::{ColumnSpec, PgTypeClass, TableSpec};
    use indexmap::indexmap;

    fn sample_table() -> LiteTableSpec {
        let table = TableSpec {
            schema: "public".into(),
            name: "widgets".into(),
            columns: indexmap! {
                "id".to_string() => ColumnSpec {
                    pos: 0, data_type: "int4".into(), type_oid: None,
                    pg_type_class: Some(PgTypeClass::Base), elem_pg_type_class: None,
                    character_maximum_length: None, not_null: true, default: None,
                },
                "name".to_string() => ColumnSpec {
                    pos: 1, data_type: "text".into(), type_oid: None,
                    pg_type_class: Some(PgTypeClass::Base), elem_pg_type_class: None,
                    character_maximum_length: None, not_null: false, default: None,
                },
            },
            primary_key: Some(vec!["id".into()]),
        };
        map_postgres_to_lite(&table)
    }

    #[test]
    fn test_init_internal_tables_idempotent() {
        let replica = Replica::open_in_memory().unwrap();
        replica.init_internal_tables().unwrap();
        replica.init_internal_tables().unwrap();
    }

    #[test]
    fn test_create_table_and_state_roundtrip() {
        let replica = Replica::open_in_memory().unwrap();
        replica.init_internal_tables().unwrap();
        replica.create_table(&sample_table()).unwrap();
        assert!(replica.table_exists("widgets").unwrap());

        replica
            .persist_initial_sync(&["pub1".to_string()], "00")
            .unwrap();
        assert_eq!(replica.state_version().unwrap(), "00");

        replica.set_state_version("01").unwrap();
        assert_eq!(replica.state_version().unwrap(), "01");
    }

    #[test]
    fn test_missing_state_errors() {
        let replica = Replica::open_in_memory().unwrap();
        replica.init_internal_tables().unwrap();
        assert!(matches!(replica.state_version(), Err(Error::NotInitialized)));
    }
}
