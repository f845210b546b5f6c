//! Canonical description of upstream tables, columns and indexes, and their
//! downstream (replica) projections.

pub mod lite;
pub mod types;

use indexmap::IndexMap;
use serde::Serialize;
use std::fmt;

/// `{appID, shardNum}`, identifying one logical replication shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId {
    pub app_id: String,
    pub shard_num: u32,
}

impl ShardId {
    pub fn new(app_id: impl Into<String>, shard_num: u32) -> Result<Self, InvalidAppId> {
        let app_id = app_id.into();
        if !app_id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            || app_id.is_empty()
        {
            return Err(InvalidAppId(app_id));
        }
        Ok(Self { app_id, shard_num })
    }

    pub fn upstream_schema(&self) -> String {
        format!("{}_{}", self.app_id, self.shard_num)
    }

    pub fn app_schema(&self) -> String {
        self.app_id.clone()
    }

    pub fn replication_slot_name(&self, replica_id: &str) -> String {
        format!("{}_{}_{}", self.app_id, self.shard_num, replica_id)
    }

    /// `"{appID}/{shardNum}"`, the prefix used for `pg_logical_emit_message`.
    pub fn message_prefix(&self) -> String {
        format!("{}/{}", self.app_id, self.shard_num)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid appID \"{0}\": must match ^[a-z0-9_]+$")]
pub struct InvalidAppId(pub String);

/// A `ShardId` plus the publications the operator requested.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    pub id: ShardId,
    pub publications: Vec<String>,
}

impl ShardConfig {
    /// Default publication name when `publications` is empty.
    pub fn default_publication_name(&self) -> String {
        format!("_{}_public_{}", self.id.app_id, self.id.shard_num)
    }

    pub fn metadata_publication_name(&self) -> String {
        format!("_{}_metadata_{}", self.id.app_id, self.id.shard_num)
    }

    /// Validate that no requested publication name is reserved.
    pub fn validate(&self) -> Result<(), crate::config::Error> {
        for name in &self.publications {
            if name.starts_with('_') {
                return Err(crate::config::Error::ReservedPublicationName(name.clone()));
            }
        }
        Ok(())
    }
}

/// `pg_type.typtype`, broadened to the classes the spec distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PgTypeClass {
    Base,
    Composite,
    Domain,
    Enum,
    Pseudo,
    Range,
    Multirange,
}

/// One column of a `TableSpec`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnSpec {
    pub pos: i16,
    pub data_type: String,
    pub type_oid: Option<u32>,
    pub pg_type_class: Option<PgTypeClass>,
    pub elem_pg_type_class: Option<PgTypeClass>,
    pub character_maximum_length: Option<i32>,
    pub not_null: bool,
    pub default: Option<String>,
}

/// `{schema, name, columns, primaryKey?}`. Column order in `columns` is
/// insertion (catalog) order; `primary_key` order is index order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableSpec {
    pub schema: String,
    pub name: String,
    pub columns: IndexMap<String, ColumnSpec>,
    pub primary_key: Option<Vec<String>>,
}

impl TableSpec {
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

/// Which columns are sent as the "key" on UPDATE/DELETE for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaIdentity {
    Default,
    Nothing,
    Full,
    Index,
}

impl fmt::Display for ReplicaIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicaIdentity::Default => "default",
            ReplicaIdentity::Nothing => "nothing",
            ReplicaIdentity::Full => "full",
            ReplicaIdentity::Index => "index",
        };
        write!(f, "{s}")
    }
}

/// A row-filter predicate as exported by one publication.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PublicationMembership {
    pub row_filter: Option<String>,
}

/// `TableSpec` plus upstream publication membership.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedTableSpec {
    pub table: TableSpec,
    pub oid: u32,
    pub replica_identity: ReplicaIdentity,
    pub publications: IndexMap<String, PublicationMembership>,
}

impl PublishedTableSpec {
    pub fn qualified_name(&self) -> String {
        self.table.qualified_name()
    }
}

/// `{name, schema?, tableName, unique, isReplicaIdentity?, isImmediate?, columns}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexSpec {
    pub name: String,
    pub schema: Option<String>,
    pub table_name: String,
    pub unique: bool,
    pub is_replica_identity: bool,
    pub is_immediate: bool,
    /// Declared index order, column name -> direction.
    pub columns: IndexMap<String, SortDirection>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

/// All tables, columns and indexes belonging to a set of publications.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PublishedSchema {
    pub publications: Vec<String>,
    /// Sorted by `(schema, name)`.
    pub tables: Vec<PublishedTableSpec>,
    /// Sorted by `(schema, tableName, name)`.
    pub indexes: Vec<IndexSpec>,
}

impl PublishedSchema {
    pub fn table_by_oid(&self, oid: u32) -> Option<&PublishedTableSpec> {
        self.tables.iter().find(|t| t.oid == oid)
    }

    pub fn table_by_name(&self, schema: &str, name: &str) -> Option<&PublishedTableSpec> {
        self.tables
            .iter()
            .find(|t| t.table.schema == schema && t.table.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shard_id_derivations() {
        let shard = ShardId::new("myapp", 3).unwrap();
        assert_eq!(shard.upstream_schema(), "myapp_3");
        assert_eq!(shard.app_schema(), "myapp");
        assert_eq!(shard.replication_slot_name("r1"), "myapp_3_r1");
        assert_eq!(shard.message_prefix(), "myapp/3");
    }

    #[test]
    fn test_shard_id_rejects_invalid_app_id() {
        assert!(ShardId::new("MyApp", 0).is_err());
        assert!(ShardId::new("my-app", 0).is_err());
        assert!(ShardId::new("", 0).is_err());
        assert!(ShardId::new("my_app1", 0).is_ok());
    }

    #[test]
    fn test_default_publication_name() {
        let config = ShardConfig {
            id: ShardId::new("myapp", 3).unwrap(),
            publications: vec![],
        };
        assert_eq!(config.default_publication_name(), "_myapp_public_3");
        assert_eq!(config.metadata_publication_name(), "_myapp_metadata_3");
    }

    #[test]
    fn test_reserved_publication_name_rejected() {
        let config = ShardConfig {
            id: ShardId::new("myapp", 0).unwrap(),
            publications: vec!["_reserved".into()],
        };
        assert!(config.validate().is_err());
    }
}
