//! Artifact Store backends: the durable home for downloaded component
//! artifacts and finished distribution images, addressed by content key
//! rather than by filesystem path so a deployment can swap a local
//! directory for an S3-compatible bucket without the rest of ldfd
//! noticing.
//!
//! One trait, one filesystem implementation always compiled in, one
//! cloud implementation gated behind a feature flag.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use url::Url;

#[cfg(feature = "s3")]
pub mod s3;

/// Key layout helpers for the storage contract's paths. Centralized here
/// so the download manager and build manager never hand-assemble a key.
pub mod keys {
    /// `distribution/{owner}/{distribution}/{component}/{filename}`
    pub fn component_artifact(owner: &str, distribution: &str, component: &str, filename: &str) -> String {
        format!("distribution/{owner}/{distribution}/{component}/{filename}")
    }

    /// `distribution/{owner}/{distribution}/image.{ext}`
    pub fn image_artifact(owner: &str, distribution: &str, ext: &str) -> String {
        format!("distribution/{owner}/{distribution}/image.{ext}")
    }

    /// `distribution/{owner}/{distribution}/kernel-config`: the single
    /// well-known key per distribution for an overlay config snapshot.
    pub fn kernel_config(owner: &str, distribution: &str) -> String {
        format!("distribution/{owner}/{distribution}/kernel-config")
    }

    /// Artifact cache entries live under an implementation-chosen prefix,
    /// invisible to clients, keyed by `(source_id, version)`.
    pub fn cache_entry(source_id: &str, version: &str) -> String {
        format!("_cache/{source_id}/{version}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageType {
    #[default]
    Local,
    S3,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Local => write!(f, "local"),
            StorageType::S3 => write!(f, "s3"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Common interface for the Artifact Store, implemented once per backend.
/// `presign_get` returns `None` on backends (like the local filesystem)
/// that have no notion of a time-limited URL; callers fall back to
/// streaming through `get` in that case.
pub trait ArtifactStore: Send + Sync {
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;
    fn get(&self, key: &str) -> Result<Vec<u8>>;
    fn head(&self, key: &str) -> Result<ObjectMeta>;
    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>>;
    fn delete(&self, key: &str) -> Result<()>;
    fn presign_get(&self, key: &str, ttl: Duration) -> Result<Option<Url>>;
    fn storage_type(&self) -> StorageType;
}

/// Local filesystem backend: content lives under a configured root
/// directory, keyed exactly as `keys` above lays out. Writes go through a
/// temp-file-then-rename so a crash mid-write never leaves a partial
/// artifact visible under its final key.
pub struct LocalFsBackend {
    root: PathBuf,
}

impl LocalFsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.split('/').any(|seg| seg == ".." || seg.is_empty()) {
            return Err(StorageError::Backend(anyhow::anyhow!("invalid storage key: {key}")));
        }
        Ok(self.root.join(key))
    }
}

impl ArtifactStore for LocalFsBackend {
    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let parent = path.parent().expect("resolved key always has a parent under root");
        std::fs::create_dir_all(parent).map_err(|source| StorageError::Io {
            path: parent.display().to_string(),
            source,
        })?;

        let tmp = parent.join(format!(".{}.tmp", uuid_like_suffix()));
        std::fs::write(&tmp, data).map_err(|source| StorageError::Io {
            path: tmp.display().to_string(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StorageError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.resolve(key)?;
        std::fs::read(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        })
    }

    fn head(&self, key: &str) -> Result<ObjectMeta> {
        let path = self.resolve(key)?;
        let metadata = std::fs::metadata(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(key.to_string())
            } else {
                StorageError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        })?;
        Ok(ObjectMeta {
            key: key.to_string(),
            size: metadata.len(),
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let base = self.root.join(prefix);
        if !base.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        walk(&self.root, &base, &mut out)?;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    fn presign_get(&self, _key: &str, _ttl: Duration) -> Result<Option<Url>> {
        Ok(None)
    }

    fn storage_type(&self) -> StorageType {
        StorageType::Local
    }
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<ObjectMeta>) -> Result<()> {
    if dir.is_file() {
        let relative = dir
            .strip_prefix(root)
            .expect("walked path is always under root")
            .to_string_lossy()
            .replace('\\', "/");
        let size = std::fs::metadata(dir)
            .map_err(|source| StorageError::Io {
                path: dir.display().to_string(),
                source,
            })?
            .len();
        out.push(ObjectMeta { key: relative, size });
        return Ok(());
    }
    let entries = std::fs::read_dir(dir).map_err(|source| StorageError::Io {
        path: dir.display().to_string(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| StorageError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        walk(root, &entry.path(), out)?;
    }
    Ok(())
}

/// Collision-resistant temp filename suffix without depending on a
/// randomness crate just for this: the current thread id plus a process
/// global counter is unique for the lifetime of one `ldfd` process, which
/// is all an in-flight temp file needs.
fn uuid_like_suffix() -> String {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:?}-{n:x}", std::thread::current().id())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalFsBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalFsBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, store) = backend();
        let key = keys::component_artifact("acme", "base", "kernel", "vmlinuz");
        store.put(&key, b"payload").unwrap();
        assert_eq!(store.get(&key).unwrap(), b"payload");
    }

    #[test]
    fn head_reports_size() {
        let (_dir, store) = backend();
        let key = keys::image_artifact("acme", "base", "qcow2");
        store.put(&key, b"0123456789").unwrap();
        let meta = store.head(&key).unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.key, key);
    }

    #[test]
    fn get_missing_key_is_not_found() {
        let (_dir, store) = backend();
        let err = store.get("distribution/acme/base/kernel/missing").unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[test]
    fn list_returns_keys_under_prefix_only() {
        let (_dir, store) = backend();
        store
            .put(&keys::component_artifact("acme", "base", "kernel", "vmlinuz"), b"a")
            .unwrap();
        store
            .put(&keys::component_artifact("acme", "base", "busybox", "bin"), b"b")
            .unwrap();
        store
            .put(&keys::component_artifact("other", "base", "kernel", "vmlinuz"), b"c")
            .unwrap();

        let under_acme = store.list("distribution/acme").unwrap();
        assert_eq!(under_acme.len(), 2);
        assert!(under_acme.iter().all(|o| o.key.starts_with("distribution/acme")));
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, store) = backend();
        let key = keys::image_artifact("acme", "base", "raw");
        store.put(&key, b"x").unwrap();
        store.delete(&key).unwrap();
        store.delete(&key).unwrap();
        assert!(matches!(store.get(&key).unwrap_err(), StorageError::NotFound(_)));
    }

    #[test]
    fn rejects_path_traversal_keys() {
        let (_dir, store) = backend();
        let err = store.put("../escape", b"x").unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
    }

    #[test]
    fn local_backend_never_presigns() {
        let (_dir, store) = backend();
        let key = keys::image_artifact("acme", "base", "iso");
        store.put(&key, b"x").unwrap();
        assert!(store.presign_get(&key, Duration::from_secs(60)).unwrap().is_none());
    }

    #[test]
    fn list_on_absent_prefix_is_empty_not_error() {
        let (_dir, store) = backend();
        assert!(store.list("distribution/never-written").unwrap().is_empty());
    }
}
