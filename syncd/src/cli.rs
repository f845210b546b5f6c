//! Command-line surface for `syncd`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// syncd: Postgres change source and embedded replica synchronization core.
#[derive(Parser, Debug)]
#[command(name = "syncd", version)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "syncd.toml")]
    pub config: PathBuf,

    /// Override `general.upstream_url` from the configuration file.
    #[arg(long)]
    pub upstream_url: Option<String>,

    /// Override `general.replica_path` from the configuration file.
    #[arg(long)]
    pub replica_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run the change source: initial sync if needed, then stream changes.
    /// This is the default when no subcommand is given.
    Run,

    /// Idempotently provision the shard (schemas, publications, DDL
    /// triggers, replica identity fixups) and exit without syncing.
    Provision,

    /// Drop the shard's publications and metadata/upstream schemas.
    /// Does not touch the replica file.
    DropShard,
}
