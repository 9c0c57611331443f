//! Sandbox: per-build isolated staging directory.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::{Invocation, PrivilegedExecutor};

const STANDARD_DIRS: &[&str] = &[
    "bin",
    "lib",
    "include",
    "share",
    "etc",
    "var",
    "tmp",
    "usr/bin",
    "usr/lib",
    "usr/include",
    "usr/share",
];

#[derive(Debug, Serialize)]
struct SandboxMetadata<'a> {
    recipe_name: &'a str,
    fingerprint: &'a str,
    history: &'a [String],
}

/// Per-build staging directory rooted at `<base>/<name>/`, used as the
/// `DESTDIR` for build-system install steps.
pub struct Sandbox {
    root: PathBuf,
    quota_bytes: Option<u64>,
    operation_log: Vec<String>,
}

impl Sandbox {
    pub fn new(base: impl AsRef<Path>, name: &str) -> Self {
        Self {
            root: base.as_ref().join(name),
            quota_bytes: None,
            operation_log: Vec::new(),
        }
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.quota_bytes = Some(bytes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// (Re)create the directory skeleton. When `clean` is set, any prior
    /// contents are erased first.
    pub fn prepare(&mut self, clean: bool, recipe_name: &str, fingerprint: &str) -> Result<()> {
        if clean && self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        for dir in STANDARD_DIRS {
            fs::create_dir_all(self.root.join(dir))?;
        }

        let metadata = SandboxMetadata {
            recipe_name,
            fingerprint,
            history: &self.operation_log,
        };
        fs::write(
            self.root.join(".metadata.json"),
            serde_json::to_string_pretty(&metadata).map_err(|e| Error::Sandbox(e.to_string()))?,
        )?;

        self.operation_log.push(format!("prepare(clean={clean})"));
        info!(root = %self.root.display(), "sandbox: prepared");
        Ok(())
    }

    /// Execute a command scoped to the sandbox. `DESTDIR` is set to the
    /// sandbox root for callers that expect it. When `privileged` is set,
    /// routes through the Privileged Executor.
    pub fn run(
        &mut self,
        executor: &PrivilegedExecutor,
        argv: &[String],
        extra_env: &[(String, String)],
        cwd: Option<&Path>,
        privileged: bool,
    ) -> Result<crate::executor::ExecResult> {
        let mut env = vec![("DESTDIR".to_string(), self.root.display().to_string())];
        env.extend_from_slice(extra_env);

        let invocation = Invocation {
            argv: argv.to_vec(),
            env,
            cwd: cwd.map(Path::to_path_buf),
            privileged,
        };

        self.operation_log.push(argv.join(" "));
        let profile = crate::executor::ExecProfile::build();
        executor.run(&invocation, profile, true).map_err(Into::into)
    }

    /// Archive current sandbox contents to a timestamped tarball, returning
    /// its path. Used before destructive transitions so they can be undone.
    pub fn snapshot(&self, snapshots_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(snapshots_dir)?;
        let timestamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.fZ");
        let path = snapshots_dir.join(format!("snapshot-{timestamp}.tar.gz"));
        archive_directory(&self.root, &path)?;
        Ok(path)
    }

    /// Erase current contents and recreate them from a snapshot archive.
    pub fn restore(&mut self, archive: &Path) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(&self.root)?;
        let file = fs::File::open(archive)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        tar.unpack(&self.root)?;
        self.operation_log.push(format!("restore({})", archive.display()));
        Ok(())
    }

    /// Produce the distributable artifact archive from sandbox
    /// contents: a gzip tar under a `<name>-<version>/` prefix with an
    /// embedded, self-describing `metadata.json`.
    pub fn archive(
        &self,
        name: &str,
        version: &str,
        recipe_snapshot: Option<serde_json::Value>,
        out_path: &Path,
    ) -> Result<quarry_store::ArtifactMetadata> {
        quarry_store::archive::build(&self.root, name, version, recipe_snapshot, out_path)
            .map_err(|e| Error::Archive(e.to_string()))
    }

    pub fn size(&self) -> Result<u64> {
        Ok(dir_size(&self.root)?)
    }

    pub fn check_quota(&self) -> Result<()> {
        if let Some(limit) = self.quota_bytes {
            let used = self.size()?;
            if used > limit {
                return Err(Error::QuotaExceeded { used, limit });
            }
        }
        Ok(())
    }
}

fn archive_directory(source: &Path, out_path: &Path) -> Result<()> {
    let file = fs::File::create(out_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.append_dir_all(".", source)?;
    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;
    Ok(())
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut total = 0;
    if !path.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += metadata.len();
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn prepare_creates_skeleton() {
        let base = tempdir().unwrap();
        let mut sandbox = Sandbox::new(base.path(), "foo");
        sandbox.prepare(true, "foo", "abc123").unwrap();

        assert!(sandbox.root().join("usr/bin").is_dir());
        assert!(sandbox.root().join(".metadata.json").exists());
    }

    #[test]
    fn quota_enforced() {
        let base = tempdir().unwrap();
        let mut sandbox = Sandbox::new(base.path(), "foo").with_quota(1);
        sandbox.prepare(true, "foo", "abc123").unwrap();
        fs::write(sandbox.root().join("bin/big"), vec![0u8; 1024]).unwrap();
        assert!(sandbox.check_quota().is_err());
    }

    #[test]
    fn snapshot_and_restore_roundtrip() {
        let base = tempdir().unwrap();
        let snapshots = tempdir().unwrap();
        let mut sandbox = Sandbox::new(base.path(), "foo");
        sandbox.prepare(true, "foo", "abc123").unwrap();
        fs::write(sandbox.root().join("bin/marker"), b"hello").unwrap();

        let snap = sandbox.snapshot(snapshots.path()).unwrap();
        fs::remove_file(sandbox.root().join("bin/marker")).unwrap();
        sandbox.restore(&snap).unwrap();

        assert!(sandbox.root().join("bin/marker").exists());
    }
}
