//! Shared integration test scaffolding: a throwaway upstream Postgres
//! container with `wal_level = logical`, and a throwaway replica file.

use testcontainers::core::IntoContainerPort;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_postgres::{Client, NoTls};

/// A Postgres 16 container configured for logical replication, plus a
/// connected admin client. The container is torn down when this drops.
#[allow(dead_code)]
pub struct TestUpstream {
    pub client: Client,
    pub conn_str: String,
    _container: ContainerAsync<Postgres>,
}

#[allow(dead_code)]
impl TestUpstream {
    pub async fn start() -> Self {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .with_cmd([
                "postgres",
                "-c",
                "wal_level=logical",
                "-c",
                "max_replication_slots=10",
                "-c",
                "max_wal_senders=10",
            ])
            .start()
            .await
            .expect("failed to start postgres container");

        let port = container
            .get_host_port_ipv4(IntoContainerPort::into_container_port(5432))
            .await
            .expect("failed to map postgres port");

        let conn_str = format!("host=127.0.0.1 port={port} user=postgres password=postgres dbname=postgres");
        let (client, connection) = tokio_postgres::connect(&conn_str, NoTls)
            .await
            .expect("failed to connect to test postgres");
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                eprintln!("test postgres connection closed: {e}");
            }
        });

        TestUpstream {
            client,
            conn_str,
            _container: container,
        }
    }

    pub async fn execute(&self, sql: &str) {
        self.client
            .batch_execute(sql)
            .await
            .unwrap_or_else(|e| panic!("setup SQL failed: {e}\nSQL: {sql}"));
    }
}

/// A replica file under a throwaway temp directory, cleaned up on drop.
#[allow(dead_code)]
pub struct TestReplica {
    pub path: std::path::PathBuf,
    _dir: tempfile::TempDir,
}

#[allow(dead_code)]
impl TestReplica {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let path = dir.path().join("replica.db");
        TestReplica { path, _dir: dir }
    }
}
