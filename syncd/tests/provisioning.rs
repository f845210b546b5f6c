//! Covers shard provisioning against a live Postgres: the default
//! publication path, the replica-identity backfill deferred task, and the
//! multi-publication column-set agreement check.

mod common;

use common::TestUpstream;
use syncd::catalog;
use syncd::provisioner;
use syncd::spec::{ReplicaIdentity, ShardConfig, ShardId};

fn shard(app_id: &str) -> ShardConfig {
    ShardConfig {
        id: ShardId::new(app_id, 0).unwrap(),
        publications: vec![],
    }
}

#[tokio::test]
async fn provision_creates_default_publication_and_is_idempotent() {
    let upstream = TestUpstream::start().await;
    upstream
        .execute("CREATE TABLE widgets (id INT PRIMARY KEY, name TEXT)")
        .await;

    let shard = shard("provapp");

    let first = provisioner::provision(&upstream.client, &shard).await.unwrap();
    assert_eq!(first.publications, vec!["_provapp_public_0".to_string()]);
    assert!(first.ddl_detection, "test container connects as superuser, so event triggers should install");

    // Re-provisioning must not fail or duplicate the default publication.
    let second = provisioner::provision(&upstream.client, &shard).await.unwrap();
    assert_eq!(second.publications, first.publications);

    let schema = catalog::get_publication_info(&upstream.client, &second.publications)
        .await
        .unwrap();
    assert!(schema.tables.iter().any(|t| t.table.name == "widgets"));
}

#[tokio::test]
async fn replica_identity_backfilled_from_qualifying_unique_index() {
    let upstream = TestUpstream::start().await;
    upstream
        .execute(
            "CREATE TABLE my_join_table (id1 TEXT NOT NULL, id2 TEXT NOT NULL);
             CREATE UNIQUE INDEX join_key ON my_join_table(id1, id2);",
        )
        .await;

    let shard = shard("joinapp");
    provisioner::provision(&upstream.client, &shard).await.unwrap();

    let replident: String = upstream
        .client
        .query_one(
            "SELECT relreplident FROM pg_class WHERE relname = 'my_join_table'",
            &[],
        )
        .await
        .unwrap()
        .get(0);
    assert_eq!(replident, "i", "table should have switched to REPLICA IDENTITY USING INDEX");

    let schema = catalog::get_publication_info(&upstream.client, &["_joinapp_public_0".to_string()])
        .await
        .unwrap();
    let table = schema.table_by_name("public", "my_join_table").unwrap();
    assert_eq!(table.replica_identity, ReplicaIdentity::Index);
}

#[tokio::test]
async fn column_set_mismatch_across_publications_fails_discovery() {
    let upstream = TestUpstream::start().await;
    upstream
        .execute(
            "CREATE TABLE shared_table (id INT PRIMARY KEY, a TEXT, b TEXT);
             CREATE PUBLICATION pub_all FOR TABLE shared_table;
             CREATE PUBLICATION pub_partial FOR TABLE shared_table (id, a);",
        )
        .await;

    let publications = vec!["pub_all".to_string(), "pub_partial".to_string()];
    let result = catalog::get_publication_info(&upstream.client, &publications).await;
    assert!(matches!(
        result,
        Err(catalog::Error::ColumnSetMismatch { .. })
    ));
}
