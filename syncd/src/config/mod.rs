//! Configuration.

pub mod error;

use std::fs::read_to_string;
use std::path::PathBuf;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use error::Error;

static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Get the current configuration.
pub fn config() -> std::sync::Arc<Config> {
    CONFIG.load().clone()
}

/// Load configuration from disk, falling back to defaults if the file is missing.
pub fn load(path: &PathBuf) -> Result<Config, Error> {
    let config = Config::load(path)?;
    set(config.clone());
    Ok(config)
}

/// Replace the global configuration.
pub fn set(config: Config) {
    CONFIG.store(std::sync::Arc::new(config));
}

/// Command-line overrides applied on top of the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub upstream_url: Option<String>,
    pub replica_path: Option<PathBuf>,
}

/// Apply CLI overrides to the currently loaded configuration.
pub fn overrides(overrides: Overrides) {
    let mut config = (*config()).clone();

    if let Some(upstream_url) = overrides.upstream_url {
        config.general.upstream_url = upstream_url;
    }

    if let Some(replica_path) = overrides.replica_path {
        config.general.replica_path = replica_path;
    }

    set(config);
}

/// `syncd.toml`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub shard: ShardSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: General::default(),
            shard: ShardSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from disk or use defaults.
    pub fn load(path: &PathBuf) -> Result<Self, Error> {
        let config: Config = if let Ok(contents) = read_to_string(path) {
            let config = toml::from_str(&contents).map_err(|err| Error::config(&contents, err))?;
            info!("loaded \"{}\"", path.display());
            config
        } else {
            warn!(
                "\"{}\" doesn't exist, loading defaults instead",
                path.display()
            );
            Config::default()
        };

        Ok(config)
    }
}

/// General runtime settings.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct General {
    /// Postgres connection string for the upstream database.
    pub upstream_url: String,
    /// Path to the SQLite replica file.
    pub replica_path: PathBuf,
    /// Number of parallel initial-sync copy workers.
    pub sync_workers: usize,
    /// Cursor fetch batch size during initial sync.
    pub cursor_batch_size: u32,
    /// Row insert batch size during initial sync.
    pub insert_batch_size: usize,
    /// Acker keepalive timer.
    #[serde(with = "duration_ms")]
    pub acker_keepalive: Duration,
    /// Deferred replica-identity-fixup delay after a DDL event.
    #[serde(with = "duration_ms")]
    pub replica_identity_fixup_delay: Duration,
    /// Maximum attempts to drop an orphaned replication slot.
    pub slot_drop_retries: usize,
    /// Host:port for the `/healthz` and `/metrics` endpoints. `None` disables them.
    pub metrics_addr: Option<String>,
    /// TLS verification mode for the upstream connection.
    pub tls_verify: TlsVerifyMode,
    pub tls_server_ca_certificate: Option<PathBuf>,
}

impl Default for General {
    fn default() -> Self {
        Self {
            upstream_url: String::new(),
            replica_path: PathBuf::from("replica.db"),
            sync_workers: 5,
            cursor_batch_size: 10_000,
            insert_batch_size: 50,
            acker_keepalive: Duration::from_secs(1),
            replica_identity_fixup_delay: Duration::from_millis(500),
            slot_drop_retries: 5,
            metrics_addr: Some("127.0.0.1:9930".into()),
            tls_verify: TlsVerifyMode::Prefer,
            tls_server_ca_certificate: None,
        }
    }
}

/// How strictly to validate the upstream's TLS certificate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TlsVerifyMode {
    Disabled,
    #[default]
    Prefer,
    VerifyCa,
    VerifyFull,
}

/// Settings identifying the shard this instance of syncd serves.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ShardSettings {
    /// `appID`, must match `^[a-z0-9_]+$`.
    pub app_id: String,
    /// Shard number within the app.
    pub shard_num: u32,
    /// Publication names requested by the operator. Empty means "provision a default".
    #[serde(default)]
    pub publications: Vec<String>,
}

impl Default for ShardSettings {
    fn default() -> Self {
        Self {
            app_id: "app".into(),
            shard_num: 0,
            publications: Vec::new(),
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_config_parses_back() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.general.sync_workers, config.general.sync_workers);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(&PathBuf::from("/nonexistent/syncd.toml")).unwrap();
        assert_eq!(config.general.sync_workers, 5);
    }
}
