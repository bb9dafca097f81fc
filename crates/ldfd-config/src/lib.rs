//! Typed configuration for `ldfd`, loaded from an `.ldfd.toml` file in the
//! workspace root plus environment-variable overrides. Every field has a
//! documented default for pool sizing and timeouts, so an empty
//! `.ldfd.toml` is a valid, fully-functioning configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use ldfd_duration::{deserialize_duration, serialize_duration};

/// Pool-sizing configuration for the three worker pools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsConfig {
    #[serde(default = "default_version_sync_pool_size")]
    pub version_sync: usize,
    #[serde(default = "default_download_pool_size")]
    pub download: usize,
    #[serde(default = "default_build_pool_size")]
    pub build: usize,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            version_sync: default_version_sync_pool_size(),
            download: default_download_pool_size(),
            build: default_build_pool_size(),
        }
    }
}

fn default_version_sync_pool_size() -> usize {
    2
}
fn default_download_pool_size() -> usize {
    4
}
fn default_build_pool_size() -> usize {
    1
}

/// Timeout configuration for the sync, download, and shutdown deadlines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    #[serde(default = "default_sync_deadline")]
    pub sync: Duration,

    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    #[serde(default = "default_download_chunk_read")]
    pub download_chunk_read: Duration,

    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    #[serde(default = "default_startup_grace")]
    pub startup_grace: Duration,

    #[serde(deserialize_with = "deserialize_duration", serialize_with = "serialize_duration")]
    #[serde(default = "default_shutdown_deadline")]
    pub shutdown: Duration,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            sync: default_sync_deadline(),
            download_chunk_read: default_download_chunk_read(),
            startup_grace: default_startup_grace(),
            shutdown: default_shutdown_deadline(),
        }
    }
}

fn default_sync_deadline() -> Duration {
    Duration::from_secs(5 * 60)
}
fn default_download_chunk_read() -> Duration {
    Duration::from_secs(60)
}
fn default_startup_grace() -> Duration {
    Duration::from_secs(2)
}
fn default_shutdown_deadline() -> Duration {
    Duration::from_secs(30)
}

/// Storage backend selection, trimmed to the one cloud backend ldfd
/// carries (S3-compatible).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Root directory for the `local` backend.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub base_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[default]
    Local,
    S3,
}

fn default_local_root() -> PathBuf {
    PathBuf::from("/var/lib/ldfd/artifacts")
}

/// A URL-prefix rewrite rule redirecting downloads to an alternative host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub url_prefix: String,
    pub mirror_url: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Top-level configuration, loaded from `.ldfd.toml` and overridable from
/// the environment (`LDFD_DB_PATH`, `LDFD_WORKSPACE_ROOT`,
/// `LDFD_STORAGE_BUCKET`, `LDFD_STORAGE_ACCESS_KEY_ID`,
/// `LDFD_STORAGE_SECRET_ACCESS_KEY`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdfdConfig {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    #[serde(default = "default_runtime_binary")]
    pub container_runtime: String,

    /// The opaque builder container image invoked for every build stage.
    #[serde(default = "default_builder_image")]
    pub builder_image: String,

    #[serde(default)]
    pub pools: PoolsConfig,

    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/ldfd/ldfd.sqlite3")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/var/lib/ldfd/workspaces")
}

fn default_runtime_binary() -> String {
    "docker".to_string()
}

fn default_builder_image() -> String {
    "ldfd/builder:latest".to_string()
}

impl Default for LdfdConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            workspace_root: default_workspace_root(),
            container_runtime: default_runtime_binary(),
            builder_image: default_builder_image(),
            pools: PoolsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            storage: StorageConfig::default(),
            mirrors: Vec::new(),
        }
    }
}

impl MirrorConfig {
    /// Returns the mirrored form of `url` when `self` applies and is
    /// enabled, by rewriting the matching `url_prefix` to `mirror_url`.
    pub fn rewrite(&self, url: &str) -> Option<String> {
        if !self.enabled {
            return None;
        }
        url.strip_prefix(self.url_prefix.as_str())
            .map(|rest| format!("{}{}", self.mirror_url, rest))
    }
}

/// Applies the first-matching-then-priority-ordered mirror rewrite rules to
/// `url`, returning the rewritten candidates in the order they should be
/// tried (mirrors first, by descending priority, then the original URL).
pub fn mirror_candidates(mirrors: &[MirrorConfig], url: &str) -> Vec<String> {
    let mut matching: Vec<&MirrorConfig> = mirrors.iter().filter(|m| m.enabled && url.starts_with(m.url_prefix.as_str())).collect();
    matching.sort_by(|a, b| b.priority.cmp(&a.priority));
    let mut candidates: Vec<String> = matching.into_iter().filter_map(|m| m.rewrite(url)).collect();
    candidates.push(url.to_string());
    candidates
}

impl LdfdConfig {
    /// Load `.ldfd.toml` from `workspace_root`, if present, falling back to
    /// defaults when it isn't.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Self> {
        let config_path = workspace_root.join(".ldfd.toml");
        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Environment overrides take precedence over file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as `apply_env_overrides`, but sourced from an arbitrary lookup
    /// function rather than the real process environment, so tests can
    /// exercise override precedence without mutating global env state.
    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("LDFD_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Some(path) = lookup("LDFD_WORKSPACE_ROOT") {
            self.workspace_root = PathBuf::from(path);
        }
        if let Some(bucket) = lookup("LDFD_STORAGE_BUCKET") {
            self.storage.bucket = Some(bucket);
        }
        if let Some(region) = lookup("LDFD_STORAGE_REGION") {
            self.storage.region = Some(region);
        }
        if let Some(endpoint) = lookup("LDFD_STORAGE_ENDPOINT") {
            self.storage.endpoint = Some(endpoint);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.version_sync == 0 {
            bail!("pools.version_sync must be greater than 0");
        }
        if self.pools.download == 0 {
            bail!("pools.download must be greater than 0");
        }
        if self.pools.build == 0 {
            bail!("pools.build must be greater than 0");
        }
        if self.timeouts.sync.is_zero() {
            bail!("timeouts.sync must be greater than 0");
        }
        if self.storage.backend == StorageBackendKind::S3 && self.storage.bucket.is_none() {
            bail!("storage.bucket is required when storage.backend = \"s3\"");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        LdfdConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_pool_size_fails_validation() {
        let mut config = LdfdConfig::default();
        config.pools.download = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn s3_backend_without_bucket_fails_validation() {
        let mut config = LdfdConfig::default();
        config.storage.backend = StorageBackendKind::S3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_workspace_without_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = LdfdConfig::load_from_workspace(dir.path()).unwrap();
        assert_eq!(config.pools.download, 4);
    }

    #[test]
    fn load_from_file_parses_partial_toml_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ldfd.toml");
        std::fs::write(&path, "db_path = \"/tmp/custom.sqlite3\"\n").unwrap();
        let config = LdfdConfig::load_from_file(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/custom.sqlite3"));
        assert_eq!(config.pools.build, 1);
    }

    #[test]
    fn mirror_candidates_tries_highest_priority_first_then_original() {
        let mirrors = vec![
            MirrorConfig { url_prefix: "https://example.org".into(), mirror_url: "https://mirror-a".into(), priority: 1, enabled: true },
            MirrorConfig { url_prefix: "https://example.org".into(), mirror_url: "https://mirror-b".into(), priority: 5, enabled: true },
        ];
        let candidates = mirror_candidates(&mirrors, "https://example.org/file.tar.gz");
        assert_eq!(
            candidates,
            vec!["https://mirror-b/file.tar.gz".to_string(), "https://mirror-a/file.tar.gz".to_string(), "https://example.org/file.tar.gz".to_string()]
        );
    }

    #[test]
    fn mirror_candidates_skips_disabled_and_non_matching() {
        let mirrors = vec![
            MirrorConfig { url_prefix: "https://other.org".into(), mirror_url: "https://mirror-a".into(), priority: 1, enabled: true },
            MirrorConfig { url_prefix: "https://example.org".into(), mirror_url: "https://mirror-b".into(), priority: 1, enabled: false },
        ];
        let candidates = mirror_candidates(&mirrors, "https://example.org/file.tar.gz");
        assert_eq!(candidates, vec!["https://example.org/file.tar.gz".to_string()]);
    }

    #[test]
    fn env_override_takes_precedence_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".ldfd.toml");
        std::fs::write(&path, "db_path = \"/tmp/from-file.sqlite3\"\n").unwrap();

        let mut config = LdfdConfig::load_from_file(&path).unwrap();
        config.apply_overrides_from(|key| {
            (key == "LDFD_DB_PATH").then(|| "/tmp/from-env.sqlite3".to_string())
        });

        assert_eq!(config.db_path, PathBuf::from("/tmp/from-env.sqlite3"));
    }
}
