//! Covers E6: initial sync of a table mixing `json`, `jsonb`, array,
//! enum, and `numeric` columns lands every row in the replica with the
//! storage type strings C3 computes, and the version column is stamped
//! with the sync's replica version.

mod common;

use common::TestUpstream;
use syncd::initial_sync;
use syncd::replica::Replica;
use syncd::spec::ShardConfig;
use syncd::spec::ShardId;

fn shard(app_id: &str) -> ShardConfig {
    ShardConfig {
        id: ShardId::new(app_id, 0).unwrap(),
        publications: vec![],
    }
}

#[tokio::test]
async fn initial_sync_copies_json_array_enum_and_numeric_columns() {
    let upstream = TestUpstream::start().await;
    upstream
        .execute(
            "CREATE TYPE mood AS ENUM ('happy', 'sad');
             CREATE TABLE widgets (
                 id TEXT PRIMARY KEY,
                 blob JSON,
                 doc JSONB,
                 tags INT4[],
                 price NUMERIC,
                 feeling mood
             );
             INSERT INTO widgets (id, blob, doc, tags, price, feeling)
             VALUES ('w1', '{\"a\":1}', '{\"b\":2}', '{1,2,3}', 9.95, 'happy');",
        )
        .await;

    let shard = shard("syncapp");
    let replica_dir = tempfile::tempdir().unwrap();
    let replica_path = replica_dir.path().join("replica.db");

    let replication_client = syncd::subscriber::connect(
        upstream.conn_str.parse().unwrap(),
        syncd::config::TlsVerifyMode::Disabled,
        None,
    )
    .await
    .unwrap();

    let result = initial_sync::run(
        &upstream.client,
        &replication_client,
        &upstream.conn_str,
        &shard,
        &replica_path,
        1,
        10_000,
        50,
    )
    .await
    .unwrap();

    let table = result
        .initial_schema
        .table_by_name("public", "widgets")
        .expect("widgets table discovered");
    assert_eq!(
        table.table.primary_key.as_deref(),
        Some(["id".to_string()].as_slice()),
        "declared primary key column is retained in the discovered schema"
    );

    let replica = Replica::open(&replica_path).unwrap();
    let conn = replica.conn();

    let mut stmt = conn.prepare("PRAGMA table_info(widgets)").unwrap();
    let columns: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?)))
        .unwrap()
        .map(|r| r.unwrap())
        .collect();

    let type_of = |name: &str| -> String {
        columns
            .iter()
            .find(|(col, _)| col == name)
            .unwrap_or_else(|| panic!("column {name} not found in replica, have {columns:?}"))
            .1
            .clone()
    };

    assert!(type_of("blob").starts_with("json"));
    assert!(type_of("doc").starts_with("jsonb"));
    assert!(type_of("tags").contains("TEXT_ARRAY"));
    assert!(type_of("feeling").contains("TEXT_ENUM"));
    assert!(type_of("price").starts_with("numeric"));

    let row: (String, String) = conn
        .query_row(
            "SELECT id, _0_version FROM widgets WHERE id = 'w1'",
            [],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .unwrap();
    assert_eq!(row.0, "w1");
    assert_eq!(row.1, result.replica_version, "every copied row is stamped with the sync's replica version");

    let tags: String = conn
        .query_row("SELECT tags FROM widgets WHERE id = 'w1'", [], |r| r.get(0))
        .unwrap();
    assert_eq!(tags, "[1,2,3]", "arrays are copied as JSON-stringified text");
}
