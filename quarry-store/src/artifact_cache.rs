//! Artifact Cache: content-addressed store of built archives, keyed
//! by `(package, fingerprint)`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub name: String,
    pub version: String,
    pub arch: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub files: Vec<String>,
    pub sha256: String,
    #[serde(default)]
    pub recipe: Option<serde_json::Value>,
    #[serde(default)]
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum EvictionPolicy {
    /// Keep at most `max_entries`, evicting least-recently-used first.
    Lru { max_entries: usize },
    /// Evict entries older than `ttl_secs`.
    Ttl { ttl_secs: u64 },
    /// Keep the directory under `max_bytes` total, evicting
    /// least-recently-used first.
    SizeBound { max_bytes: u64 },
}

/// Capability interface for pushing/fetching artifacts to/from a remote
/// cache. The local `ArtifactCache` is a null object that fails closed;
/// a real remote-backed implementation can satisfy this interface without
/// consumers changing.
pub trait RemoteArtifactStore: Send + Sync {
    fn push(&self, name: &str, fingerprint: &str, archive_path: &Path) -> Result<()>;
    fn fetch(&self, name: &str, fingerprint: &str, dest: &Path) -> Result<bool>;
}

pub struct NoRemoteStore;

impl RemoteArtifactStore for NoRemoteStore {
    fn push(&self, name: &str, fingerprint: &str, _archive_path: &Path) -> Result<()> {
        Err(Error::Archive(format!(
            "no remote artifact store configured (push {name}@{fingerprint})"
        )))
    }

    fn fetch(&self, _name: &str, _fingerprint: &str, _dest: &Path) -> Result<bool> {
        Ok(false)
    }
}

pub struct ArtifactCache {
    root: PathBuf,
    remote: Box<dyn RemoteArtifactStore>,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            remote: Box::new(NoRemoteStore),
        }
    }

    pub fn with_remote(mut self, remote: Box<dyn RemoteArtifactStore>) -> Self {
        self.remote = remote;
        self
    }

    fn archive_path(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{name}-{fingerprint}.tar.gz"))
    }

    fn sidecar_path(&self, name: &str, fingerprint: &str) -> PathBuf {
        self.root.join(format!("{name}-{fingerprint}.json"))
    }

    /// Returns the archive path iff both the archive and its metadata
    /// sidecar exist locally.
    pub fn lookup(&self, name: &str, fingerprint: &str) -> Option<PathBuf> {
        let archive = self.archive_path(name, fingerprint);
        let sidecar = self.sidecar_path(name, fingerprint);
        if archive.exists() && sidecar.exists() {
            Some(archive)
        } else {
            None
        }
    }

    /// Like `lookup`, but falls back to the remote store when the artifact
    /// is absent locally.
    pub fn lookup_or_fetch(&self, name: &str, fingerprint: &str) -> Result<Option<PathBuf>> {
        if let Some(path) = self.lookup(name, fingerprint) {
            return Ok(Some(path));
        }
        let dest = self.archive_path(name, fingerprint);
        if self.remote.fetch(name, fingerprint, &dest)? {
            return Ok(Some(dest));
        }
        Ok(None)
    }

    /// Copy `archive_path` and its sidecar into the cache atomically.
    /// Artifacts are immutable once written: storing an existing
    /// `(name, fingerprint)` pair is a no-op success, not a mutation.
    pub fn store(
        &self,
        name: &str,
        fingerprint: &str,
        archive_path: &Path,
        metadata: &ArtifactMetadata,
    ) -> Result<PathBuf> {
        fs::create_dir_all(&self.root)?;
        let dest = self.archive_path(name, fingerprint);
        let sidecar = self.sidecar_path(name, fingerprint);

        if dest.exists() && sidecar.exists() {
            debug!(%name, %fingerprint, "artifact cache: already present");
            return Ok(dest);
        }

        let tmp = self.root.join(format!(".{name}-{fingerprint}.tar.gz.tmp"));
        fs::copy(archive_path, &tmp)?;
        fs::rename(&tmp, &dest)?;

        let sidecar_text = serde_json::to_string_pretty(metadata)?;
        let sidecar_tmp = self.root.join(format!(".{name}-{fingerprint}.json.tmp"));
        fs::write(&sidecar_tmp, sidecar_text)?;
        fs::rename(&sidecar_tmp, &sidecar)?;

        info!(%name, %fingerprint, "artifact cache: stored");
        Ok(dest)
    }

    pub fn push_remote(&self, name: &str, fingerprint: &str) -> Result<()> {
        let archive = self.archive_path(name, fingerprint);
        self.remote.push(name, fingerprint, &archive)
    }

    pub fn metadata(&self, name: &str, fingerprint: &str) -> Result<ArtifactMetadata> {
        let text = fs::read_to_string(self.sidecar_path(name, fingerprint))?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn evict(&self, policy: EvictionPolicy) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        if !self.root.exists() {
            return Ok(entries);
        }
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("gz") {
                let accessed = entry
                    .metadata()
                    .and_then(|m| m.accessed().or_else(|_| m.modified()))
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                entries.push((path, accessed, size));
            }
        }
        entries.sort_by_key(|(_, accessed, _)| *accessed);

        let mut evicted = Vec::new();
        match policy {
            EvictionPolicy::Lru { max_entries } => {
                while entries.len() > max_entries {
                    let (path, _, _) = entries.remove(0);
                    evicted.push(remove_pair(&path)?);
                }
            }
            EvictionPolicy::Ttl { ttl_secs } => {
                let now = SystemTime::now();
                for (path, accessed, _) in &entries {
                    if now.duration_since(*accessed).unwrap_or_default().as_secs() > ttl_secs {
                        evicted.push(remove_pair(path)?);
                    }
                }
            }
            EvictionPolicy::SizeBound { max_bytes } => {
                let mut total: u64 = entries.iter().map(|(_, _, size)| size).sum();
                let mut idx = 0;
                while total > max_bytes && idx < entries.len() {
                    let (path, _, size) = &entries[idx];
                    evicted.push(remove_pair(path)?);
                    total = total.saturating_sub(*size);
                    idx += 1;
                }
            }
        }
        Ok(evicted)
    }
}

fn remove_pair(archive: &Path) -> Result<PathBuf> {
    let sidecar = archive.with_extension("").with_extension("json");
    let _ = fs::remove_file(&sidecar);
    fs::remove_file(archive)?;
    Ok(archive.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_metadata(name: &str) -> ArtifactMetadata {
        ArtifactMetadata {
            name: name.to_string(),
            version: "1.0.0".into(),
            arch: "any".into(),
            created_at: chrono::Utc::now(),
            files: vec!["bin/foo".into()],
            sha256: "deadbeef".into(),
            recipe: None,
            signature: None,
        }
    }

    #[test]
    fn store_then_lookup() {
        let cache_dir = tempdir().unwrap();
        let archive_dir = tempdir().unwrap();
        let archive_path = archive_dir.path().join("foo.tar.gz");
        fs::write(&archive_path, b"fake archive bytes").unwrap();

        let cache = ArtifactCache::new(cache_dir.path());
        cache
            .store("foo", "abc123", &archive_path, &sample_metadata("foo"))
            .unwrap();

        assert!(cache.lookup("foo", "abc123").is_some());
        assert!(cache.lookup("foo", "other-fp").is_none());
    }

    #[test]
    fn store_is_idempotent() {
        let cache_dir = tempdir().unwrap();
        let archive_dir = tempdir().unwrap();
        let archive_path = archive_dir.path().join("foo.tar.gz");
        fs::write(&archive_path, b"fake archive bytes").unwrap();

        let cache = ArtifactCache::new(cache_dir.path());
        let meta = sample_metadata("foo");
        cache.store("foo", "abc123", &archive_path, &meta).unwrap();
        let second = cache.store("foo", "abc123", &archive_path, &meta).unwrap();
        assert!(second.exists());
    }

    #[test]
    fn no_remote_store_fails_closed() {
        let cache = ArtifactCache::new(tempdir().unwrap().path());
        let result = cache.lookup_or_fetch("foo", "abc123").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn lru_eviction() {
        let cache_dir = tempdir().unwrap();
        let archive_dir = tempdir().unwrap();
        let cache = ArtifactCache::new(cache_dir.path());

        for i in 0..3 {
            let archive_path = archive_dir.path().join(format!("p{i}.tar.gz"));
            fs::write(&archive_path, b"bytes").unwrap();
            cache
                .store(&format!("pkg{i}"), "fp", &archive_path, &sample_metadata(&format!("pkg{i}")))
                .unwrap();
        }

        let evicted = cache.evict(EvictionPolicy::Lru { max_entries: 1 }).unwrap();
        assert_eq!(evicted.len(), 2);
    }
}
