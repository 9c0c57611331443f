//! Transactional Installer: resolve an artifact, verify its digest
//! and optional signature, extract it, back up anything it would overwrite,
//! then swap the new files into place — restoring the backup if anything
//! after that point fails.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use quarry_build::{ExecProfile, HookDispatcher, Invocation, PrivilegedExecutor};
use quarry_store::{archive, Action, HistoryLog, InstalledDb, InstalledRecord};
use tar::Builder;
use tempfile::tempdir;
use tracing::{info, warn};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct InstallerConfig {
    pub install_root: PathBuf,
    pub backup_dir: PathBuf,
    pub allow_downgrade: bool,
    pub force: bool,
    pub backup: bool,
    pub signing_pubkey: Option<PathBuf>,
    pub actor: String,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/"),
            backup_dir: PathBuf::from("/var/lib/quarry/backups"),
            allow_downgrade: false,
            force: false,
            backup: true,
            signing_pubkey: None,
            actor: "quarry".to_string(),
        }
    }
}

/// Install the artifact at `source` (a local path, or an `http(s)://` URL)
/// against the given Installed DB: materialize, extract and verify, check
/// for a downgrade or reinstall, run pre-install hooks, back up anything
/// about to be overwritten, place the new files, record the install, then
/// run post-install hooks. On success the new Installed Record is returned
/// and already persisted; on failure after the backup point, the
/// destination is restored to its prior state and the DB is left untouched.
pub fn install(
    source: &str,
    config: &InstallerConfig,
    db: &InstalledDb,
    history: &HistoryLog,
    hooks: &HookDispatcher,
    executor: &PrivilegedExecutor,
) -> Result<InstalledRecord> {
    let workdir = tempdir()?;
    let archive_path = materialize(source, workdir.path())?;

    let extract_dir = workdir.path().join("payload");
    let metadata = archive::extract(&archive_path, &extract_dir)?;

    if !archive::verify(&archive_path)? {
        return Err(Error::DigestMismatch {
            package: metadata.name.clone(),
            expected: metadata.sha256.clone(),
            computed: "recomputed payload digest did not match".to_string(),
        });
    }

    if let Some(signature) = &metadata.signature {
        verify_signature(&archive_path, signature, config.signing_pubkey.as_deref(), executor)?;
    }

    let dest_paths: Vec<PathBuf> = metadata
        .files
        .iter()
        .map(|relative| config.install_root.join(relative))
        .collect();

    if let Some(existing) = db.get(&metadata.name) {
        let ordering = quarry_recipe::compare_versions(&metadata.version, &existing.version);
        if ordering == Ordering::Less && !config.allow_downgrade {
            return Err(Error::Install {
                package: metadata.name.clone(),
                path: None,
                cause: format!(
                    "refusing downgrade from {} to {} (allow_downgrade not set)",
                    existing.version, metadata.version
                ),
            });
        }
        if ordering == Ordering::Equal && !config.force {
            return Err(Error::Install {
                package: metadata.name.clone(),
                path: None,
                cause: format!("{} {} is already installed", metadata.name, metadata.version),
            });
        }
    }

    let pre_install = hook_commands(&metadata.recipe, "pre_install");
    hooks.dispatch("pre_install", &metadata.name, &pre_install, executor, Some(&extract_dir))?;

    let backup_path = if config.backup {
        backup_existing(&dest_paths, &config.backup_dir)?
    } else {
        None
    };

    if let Err(cause) = place_files(&metadata.files, &extract_dir, &dest_paths, executor) {
        if let Some(backup_path) = &backup_path {
            if let Err(rollback_cause) = restore_backup(backup_path) {
                return Err(Error::InstallRollbackFailed {
                    package: metadata.name.clone(),
                    cause: cause.to_string(),
                    rollback_cause: rollback_cause.to_string(),
                });
            }
        }
        return Err(Error::Install {
            package: metadata.name.clone(),
            path: None,
            cause: cause.to_string(),
        });
    }

    let mut record = InstalledRecord::new(&metadata.name, &metadata.version, dest_paths.clone());
    record.metadata = serde_json::json!({
        "recipe": metadata.recipe,
        "arch": metadata.arch,
        "sha256": metadata.sha256,
    });
    db.put(record.clone());
    db.save()?;

    history.append(
        &config.actor,
        Action::Install,
        &metadata.name,
        serde_json::json!({"version": metadata.version, "files": metadata.files.len()}),
        "ok",
        None,
    )?;

    let post_install = hook_commands(&metadata.recipe, "post_install");
    hooks.dispatch("post_install", &metadata.name, &post_install, executor, Some(&extract_dir))?;

    info!(package = %metadata.name, version = %metadata.version, "installer: install complete");
    Ok(record)
}

fn place_files(
    relative_paths: &[String],
    extract_dir: &Path,
    dest_paths: &[PathBuf],
    executor: &PrivilegedExecutor,
) -> Result<()> {
    for (relative, dest) in relative_paths.iter().zip(dest_paths.iter()) {
        if let Some(parent) = dest.parent() {
            let mkdir = Invocation {
                argv: vec!["mkdir".into(), "-p".into(), parent.to_string_lossy().into_owned()],
                env: vec![],
                cwd: None,
                privileged: true,
            };
            executor.run(&mkdir, ExecProfile::default_profile(), true)?;
        }

        let src = extract_dir.join(relative);
        copy_preserving(&src, dest)?;
    }
    Ok(())
}

fn copy_preserving(src: &Path, dest: &Path) -> Result<()> {
    let file_type = fs::symlink_metadata(src)?.file_type();
    if file_type.is_symlink() {
        let target = fs::read_link(src)?;
        if fs::symlink_metadata(dest).is_ok() {
            fs::remove_file(dest)?;
        }
        std::os::unix::fs::symlink(&target, dest)?;
        return Ok(());
    }

    // `fs::copy` preserves the source's permission bits on Unix; fall back
    // to a plain read/write (the same bytes a tar-stream extraction would
    // produce) if it fails, e.g. across a read-only or cross-device mount.
    if fs::copy(src, dest).is_err() {
        let bytes = fs::read(src)?;
        fs::write(dest, bytes)?;
    }
    Ok(())
}

/// Archive every destination path that currently exists into a timestamped
/// tarball under `backup_dir`, so a failed install (or, via the remover,
/// a failed remove) can be undone.
pub(crate) fn backup_existing(dest_paths: &[PathBuf], backup_dir: &Path) -> Result<Option<PathBuf>> {
    let existing: Vec<&PathBuf> = dest_paths.iter().filter(|p| p.exists()).collect();
    if existing.is_empty() {
        return Ok(None);
    }

    fs::create_dir_all(backup_dir)?;
    let name = format!("backup-{}.tar.gz", Utc::now().format("%Y%m%dT%H%M%S%.f"));
    let backup_path = backup_dir.join(name);

    let file = fs::File::create(&backup_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);
    for path in existing {
        let relative = path.strip_prefix("/").unwrap_or(path);
        builder.append_path_with_name(path, relative)?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?;

    Ok(Some(backup_path))
}

/// Restore a backup tarball produced by [`backup_existing`]. Entries inside
/// the tarball are named relative to the true filesystem root (the leading
/// `/` of each destination path, stripped when the backup was written), so
/// unpacking always targets `/` regardless of the configured install root.
pub(crate) fn restore_backup(backup_path: &Path) -> Result<()> {
    let file = fs::File::open(backup_path)?;
    let decoder = GzDecoder::new(file);
    let mut tar_archive = tar::Archive::new(decoder);
    tar_archive.unpack("/")?;
    Ok(())
}

/// Resolve `source` to a local archive path: a bare path is used as-is, an
/// `http(s)://` URL is downloaded into `workdir`, anything else is an
/// unsupported scheme.
fn materialize(source: &str, workdir: &Path) -> Result<PathBuf> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::blocking::Client::new();
        let response = client
            .get(source)
            .header(reqwest::header::USER_AGENT, "quarry-installer")
            .send()
            .map_err(|e| Error::Install {
                package: "<unresolved>".to_string(),
                path: None,
                cause: format!("fetching {source}: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(Error::Install {
                package: "<unresolved>".to_string(),
                path: None,
                cause: format!("fetching {source}: HTTP {}", response.status()),
            });
        }
        let bytes = response.bytes().map_err(|e| Error::Install {
            package: "<unresolved>".to_string(),
            path: None,
            cause: format!("reading response body for {source}: {e}"),
        })?;
        let filename = source.rsplit('/').next().unwrap_or("artifact.tar.gz");
        let dest = workdir.join(filename);
        fs::write(&dest, &bytes)?;
        Ok(dest)
    } else if let Some((scheme, _)) = source.split_once("://") {
        Err(Error::UnsupportedScheme(scheme.to_string()))
    } else {
        Ok(PathBuf::from(source))
    }
}

/// Verify an artifact's detached minisign signature against a configured
/// public key by shelling out to `minisign -V`. No key configured means the
/// signature can't be checked; that's logged, not treated as fatal, since
/// signing is an optional layer on top of the mandatory digest check above.
fn verify_signature(
    archive_path: &Path,
    signature: &str,
    pubkey_path: Option<&Path>,
    executor: &PrivilegedExecutor,
) -> Result<()> {
    let Some(pubkey_path) = pubkey_path else {
        warn!(archive = %archive_path.display(), "installer: artifact is signed but no public key is configured; skipping verification");
        return Ok(());
    };

    if which::which("minisign").is_err() {
        return Err(Error::Install {
            package: "<unresolved>".to_string(),
            path: Some(archive_path.to_path_buf()),
            cause: "minisign not found on PATH".to_string(),
        });
    }

    let sig_path = archive_path.with_extension("sig");
    fs::write(&sig_path, signature)?;
    let pubkey = fs::read_to_string(pubkey_path)?.trim().to_string();

    let invocation = Invocation {
        argv: vec![
            "minisign".to_string(),
            "-V".to_string(),
            "-P".to_string(),
            pubkey,
            "-m".to_string(),
            archive_path.to_string_lossy().into_owned(),
            "-x".to_string(),
            sig_path.to_string_lossy().into_owned(),
        ],
        env: vec![],
        cwd: None,
        privileged: false,
    };

    let result = executor.run(&invocation, ExecProfile::default_profile(), false);
    let _ = fs::remove_file(&sig_path);

    match result? {
        r if r.success => Ok(()),
        _ => Err(Error::Install {
            package: "<unresolved>".to_string(),
            path: Some(archive_path.to_path_buf()),
            cause: "signature verification failed".to_string(),
        }),
    }
}

pub(crate) fn hook_commands(recipe_snapshot: &Option<serde_json::Value>, stage: &str) -> Vec<String> {
    recipe_snapshot
        .as_ref()
        .and_then(|recipe| recipe.get("hooks"))
        .and_then(|hooks| hooks.get(stage))
        .and_then(|commands| commands.as_array())
        .map(|items| items.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_sample_archive(dir: &Path, name: &str, version: &str) -> PathBuf {
        let payload = dir.join("payload");
        fs::create_dir_all(payload.join("usr/bin")).unwrap();
        fs::write(payload.join("usr/bin/app"), b"#!/bin/sh\necho hi\n").unwrap();
        let out = dir.join("out.tar.gz");
        archive::build(&payload, name, version, None, &out).unwrap();
        out
    }

    #[test]
    fn installs_new_package_and_records_it() {
        let dir = tempdir().unwrap();
        let archive_path = build_sample_archive(dir.path(), "app", "1.0.0");

        let install_root = dir.path().join("root");
        fs::create_dir_all(&install_root).unwrap();
        let config = InstallerConfig {
            install_root: install_root.clone(),
            backup_dir: dir.path().join("backups"),
            ..InstallerConfig::default()
        };

        let db = InstalledDb::load(dir.path().join("installed.json")).unwrap();
        let history = HistoryLog::open(dir.path().join("history.jsonl"));
        let hooks = HookDispatcher::new();
        let executor = PrivilegedExecutor::new();

        let record = install(
            archive_path.to_str().unwrap(),
            &config,
            &db,
            &history,
            &hooks,
            &executor,
        )
        .unwrap();

        assert_eq!(record.name, "app");
        assert!(install_root.join("usr/bin/app").exists());
        assert!(db.get("app").is_some());
        assert_eq!(history.read_all().unwrap().len(), 1);
    }

    #[test]
    fn refuses_reinstall_of_same_version_without_force() {
        let dir = tempdir().unwrap();
        let archive_path = build_sample_archive(dir.path(), "app", "1.0.0");

        let install_root = dir.path().join("root");
        fs::create_dir_all(&install_root).unwrap();
        let config = InstallerConfig {
            install_root: install_root.clone(),
            backup_dir: dir.path().join("backups"),
            ..InstallerConfig::default()
        };

        let db = InstalledDb::load(dir.path().join("installed.json")).unwrap();
        let history = HistoryLog::open(dir.path().join("history.jsonl"));
        let hooks = HookDispatcher::new();
        let executor = PrivilegedExecutor::new();

        install(archive_path.to_str().unwrap(), &config, &db, &history, &hooks, &executor).unwrap();

        let result = install(archive_path.to_str().unwrap(), &config, &db, &history, &hooks, &executor);
        assert!(result.is_err());
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let dir = tempdir().unwrap();
        let config = InstallerConfig {
            install_root: dir.path().join("root"),
            backup_dir: dir.path().join("backups"),
            ..InstallerConfig::default()
        };
        let db = InstalledDb::load(dir.path().join("installed.json")).unwrap();
        let history = HistoryLog::open(dir.path().join("history.jsonl"));
        let hooks = HookDispatcher::new();
        let executor = PrivilegedExecutor::new();

        let result = install("ftp://example.com/pkg.tar.gz", &config, &db, &history, &hooks, &executor);
        assert!(matches!(result, Err(Error::UnsupportedScheme(scheme)) if scheme == "ftp"));
    }
}
