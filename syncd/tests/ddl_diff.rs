//! Covers §4.8.2: a DDL event trigger's embedded schema snapshot, diffed
//! against the previous snapshot, produces the expected change events when
//! an actual `ALTER TABLE` is run through the real replication stream.

mod common;

use common::TestUpstream;
use syncd::catalog;
use syncd::changemaker::DataChange;
use syncd::provisioner;
use syncd::service::{self, ChangeStreamMessage};
use syncd::spec::{ShardConfig, ShardId};

fn shard(app_id: &str) -> ShardConfig {
    ShardConfig {
        id: ShardId::new(app_id, 0).unwrap(),
        publications: vec![],
    }
}

#[tokio::test]
async fn alter_table_add_column_is_diffed_from_embedded_ddl_snapshots() {
    let upstream = TestUpstream::start().await;
    upstream
        .execute("CREATE TABLE widgets (id INT PRIMARY KEY, name TEXT)")
        .await;

    let shard = shard("ddlapp");
    let result = provisioner::provision(&upstream.client, &shard).await.unwrap();
    assert!(
        result.ddl_detection,
        "test container connects as superuser, so event triggers should install"
    );

    let initial_schema = catalog::get_publication_info(&upstream.client, &result.publications)
        .await
        .unwrap();

    let replication_client = syncd::subscriber::connect(
        upstream.conn_str.parse().unwrap(),
        syncd::config::TlsVerifyMode::Disabled,
        None,
    )
    .await
    .unwrap();

    let slot_name = shard.id.replication_slot_name("ddltest");
    let mut stream = service::start_stream(
        &upstream.client,
        replication_client,
        &shard,
        &slot_name,
        initial_schema,
        result.ddl_detection,
        "00",
    )
    .await
    .unwrap();

    upstream
        .execute("ALTER TABLE widgets ADD COLUMN price NUMERIC")
        .await;

    let mut seen_add_column = false;
    for _ in 0..500 {
        let Ok(next) = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            stream.changes.recv(),
        )
        .await
        else {
            break;
        };
        let Some(msg) = next else {
            break;
        };
        match msg {
            ChangeStreamMessage::Data(DataChange::AddColumn { table, column, .. }) => {
                assert_eq!(table, "widgets");
                assert_eq!(column, "price");
                seen_add_column = true;
                break;
            }
            ChangeStreamMessage::ControlResetRequired => {
                panic!("change maker latched an UnsupportedSchemaChange error instead of diffing the DDL");
            }
            _ => continue,
        }
    }

    assert!(
        seen_add_column,
        "expected an AddColumn event computed from the embedded ddlStart/ddlUpdate schema snapshots"
    );
}
