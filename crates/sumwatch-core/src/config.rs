//! Process-wide configuration.
//!
//! Loaded once at startup from a TOML file and treated as read-only for
//! the life of the process. Validation failures here are fatal: a daemon
//! with a half-configured blob store or build worker must not start.

use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use thiserror::Error;

use crate::sth::KEY_TYPE_ED25519;

/// Errors from loading or validating the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("error reading config file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid TOML for the expected schema.
    #[error("error parsing config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// A required value is missing, empty, or inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Public domain the feeds and gossip endpoints are served under.
    pub domain: String,

    /// Path of the SQLite database file.
    pub database_path: PathBuf,

    /// Object storage for source tarballs and build artifacts.
    pub blob_store: BlobStoreConfig,

    /// Remote build worker used for reproducibility checks.
    pub build_worker: BuildWorkerConfig,

    /// Base URL for Go release source tarballs. Points at go.dev unless
    /// a mirror is configured.
    #[serde(default = "default_go_dl_url")]
    pub go_dl_url: String,

    /// Pre-approved bootstrap toolchain for Go 1.21 through 1.23.
    /// Optional; when absent those versions are skipped.
    #[serde(default)]
    pub legacy_bootstrap: Option<LegacyBootstrapConfig>,

    /// Monitored checksum databases.
    #[serde(default, rename = "log")]
    pub logs: Vec<LogConfig>,
}

/// Blob store location and URL signing.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobStoreConfig {
    /// Directory holding the bucket contents.
    pub root: PathBuf,

    /// Public base URL under which `/blob/` routes are reachable.
    pub base_url: String,

    /// Secret for HMAC presigned-URL signatures.
    pub signing_secret: String,
}

/// Build worker identity and endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct BuildWorkerConfig {
    /// Worker name, used in logs.
    pub name: String,

    /// Invoke URL receiving job payloads.
    pub url: String,

    /// GOARCH the worker runs on; bootstrap toolchains are selected for
    /// `linux-<arch>`.
    pub arch: String,
}

/// The immutable legacy bootstrap blob (a Go 1.20 toolchain).
#[derive(Debug, Clone, Deserialize)]
pub struct LegacyBootstrapConfig {
    /// Object key of the bootstrap zip in the blob store.
    pub object: String,

    /// Expected h1 dirhash of the bootstrap zip.
    pub hash: String,
}

/// One monitored checksum database.
#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log hostname, e.g. `sum.golang.org`.
    pub host: String,

    /// Base64 of the tagged verification key (algorithm byte + raw key).
    pub key: String,

    /// Disabled logs keep their data but get no tasks.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_enabled() -> bool {
    true
}

fn default_go_dl_url() -> String {
    "https://go.dev/dl".to_string()
}

impl LogConfig {
    /// Decodes the tagged verification key.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the key is not base64 or not a
    /// supported key type.
    pub fn decoded_key(&self) -> Result<Vec<u8>, ConfigError> {
        let key = STANDARD.decode(&self.key).map_err(|_| {
            ConfigError::Invalid(format!("log {}: key is not valid base64", self.host))
        })?;
        match key.first() {
            Some(&KEY_TYPE_ED25519) if key.len() == 33 => Ok(key),
            Some(&KEY_TYPE_ED25519) => Err(ConfigError::Invalid(format!(
                "log {}: Ed25519 key must be 32 bytes",
                self.host
            ))),
            Some(&tag) => Err(ConfigError::Invalid(format!(
                "log {}: unsupported key type {tag:#04x}",
                self.host
            ))),
            None => Err(ConfigError::Invalid(format!("log {}: key is empty", self.host))),
        }
    }
}

impl Config {
    /// Loads and validates a configuration file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] on I/O, parse, or validation failure.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates field-level requirements.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn required(value: &str, name: &str) -> Result<(), ConfigError> {
            if value.is_empty() {
                Err(ConfigError::Invalid(format!("{name} must not be empty")))
            } else {
                Ok(())
            }
        }

        required(&self.domain, "domain")?;
        required(&self.go_dl_url, "go_dl_url")?;
        required(&self.blob_store.root.to_string_lossy(), "blob_store.root")?;
        required(&self.blob_store.base_url, "blob_store.base_url")?;
        required(&self.blob_store.signing_secret, "blob_store.signing_secret")?;
        required(&self.build_worker.name, "build_worker.name")?;
        required(&self.build_worker.url, "build_worker.url")?;
        required(&self.build_worker.arch, "build_worker.arch")?;

        if let Some(legacy) = &self.legacy_bootstrap {
            required(&legacy.object, "legacy_bootstrap.object")?;
            required(&legacy.hash, "legacy_bootstrap.hash")?;
        }

        for log in &self.logs {
            required(&log.host, "log.host")?;
            log.decoded_key()?;
        }
        Ok(())
    }
}
