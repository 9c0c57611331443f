//! Artifact archive format: a gzip-compressed tar with a top-level
//! `<name>-<version>/` prefix, the package's files at their
//! installation-relative paths, and an embedded `metadata.json` carrying a
//! self-describing digest.
//!
//! The digest covers the sorted `(relative_path, file_bytes)` stream of
//! every declared payload file — the same canonical-stream idiom
//! `quarry_recipe::fingerprint` uses for recipes — computed before
//! `metadata.json` is appended as the archive's last entry. This sidesteps
//! the literal self-hash paradox a whole-file digest would hit (the digest
//! can't describe its own bytes): the field is filled in only after every
//! other entry has been written, and `verify()` recomputes the identical
//! stream to check it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tar::{Builder, Header};

use crate::artifact_cache::ArtifactMetadata;
use crate::error::{Error, Result};

const CHUNK_SIZE: usize = 8 * 1024;

/// Build an artifact archive from `payload_root`, which is expected to
/// contain the package's files at their installation-relative paths (as a
/// built sandbox does). `.metadata.json` bookkeeping files at the payload
/// root are skipped. Returns the metadata document embedded in the archive.
pub fn build(
    payload_root: &Path,
    name: &str,
    version: &str,
    recipe_snapshot: Option<serde_json::Value>,
    out_path: &Path,
) -> Result<ArtifactMetadata> {
    let mut files = Vec::new();
    collect_files(payload_root, payload_root, &mut files);
    files.sort();

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let prefix = format!("{name}-{version}");
    let file = File::create(out_path)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    let mut hasher = Sha256::new();
    for relative in &files {
        let full_path = payload_root.join(relative);
        let bytes = fs::read(&full_path)?;
        hash_entry(&mut hasher, relative, &bytes);

        let mut header = Header::new_gnu();
        header.set_size(bytes.len() as u64);
        header.set_mode(file_mode(&full_path));
        header.set_cksum();
        let archive_name = format!("{prefix}/{relative}");
        builder.append_data(&mut header, archive_name, Cursor::new(&bytes))?;
    }

    let digest = hex(hasher.finalize());
    let metadata = ArtifactMetadata {
        name: name.to_string(),
        version: version.to_string(),
        arch: "any".to_string(),
        created_at: chrono::Utc::now(),
        files: files.clone(),
        sha256: digest,
        recipe: recipe_snapshot,
        signature: None,
    };

    let metadata_json = serde_json::to_vec_pretty(&metadata)?;
    let mut header = Header::new_gnu();
    header.set_size(metadata_json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, format!("{prefix}/metadata.json"), Cursor::new(&metadata_json))?;

    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;

    Ok(metadata)
}

/// Extract an archive built by [`build`] into `dest_root`, stripping the
/// top-level `<name>-<version>/` prefix, and return its embedded metadata.
/// Payload files land at `dest_root/<relative_path>`; `metadata.json` itself
/// is not written out.
pub fn extract(archive_path: &Path, dest_root: &Path) -> Result<ArtifactMetadata> {
    let entries = read_entries(archive_path)?;
    let metadata = parse_metadata(&entries)?;

    fs::create_dir_all(dest_root)?;
    for (relative, bytes) in &entries {
        if relative == "metadata.json" {
            continue;
        }
        let dest = dest_root.join(relative);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&dest, bytes)?;
    }

    Ok(metadata)
}

/// Recompute the payload digest of an already-built archive and compare it
/// against the digest embedded in its `metadata.json`.
pub fn verify(archive_path: &Path) -> Result<bool> {
    let entries = read_entries(archive_path)?;
    let metadata = parse_metadata(&entries)?;

    let mut hasher = Sha256::new();
    let mut sorted_files = metadata.files.clone();
    sorted_files.sort();
    for relative in &sorted_files {
        let bytes = entries
            .get(relative)
            .ok_or_else(|| Error::Archive(format!("declared file missing from archive: {relative}")))?;
        hash_entry(&mut hasher, relative, bytes);
    }

    Ok(hex(hasher.finalize()) == metadata.sha256)
}

fn hash_entry(hasher: &mut Sha256, relative: &str, bytes: &[u8]) {
    hasher.update(relative.as_bytes());
    for chunk in bytes.chunks(CHUNK_SIZE) {
        hasher.update(chunk);
    }
}

/// Read every entry of the archive into memory, keyed by its path with the
/// top-level `<name>-<version>/` prefix stripped.
fn read_entries(archive_path: &Path) -> Result<HashMap<String, Vec<u8>>> {
    let file = File::open(archive_path)?;
    let decoder = GzDecoder::new(file);
    let mut tar = tar::Archive::new(decoder);

    let mut entries = HashMap::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut components = path.components();
        components.next(); // drop the `<name>-<version>` prefix
        let relative: PathBuf = components.collect();
        if relative.as_os_str().is_empty() {
            continue;
        }
        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes)?;
        entries.insert(relative.to_string_lossy().into_owned(), bytes);
    }
    Ok(entries)
}

fn parse_metadata(entries: &HashMap<String, Vec<u8>>) -> Result<ArtifactMetadata> {
    let bytes = entries
        .get("metadata.json")
        .ok_or_else(|| Error::Archive("archive has no metadata.json entry".to_string()))?;
    Ok(serde_json::from_slice(bytes)?)
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };
    for entry in read_dir.flatten() {
        let path = entry.path();
        let is_bookkeeping = path.file_name().and_then(|n| n.to_str()) == Some(".metadata.json");
        if is_bookkeeping {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, out);
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().into_owned());
        }
    }
}

#[cfg(unix)]
fn file_mode(path: &Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|m| m.permissions().mode())
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Path) -> u32 {
    0o644
}

fn hex(bytes: impl AsRef<[u8]>) -> String {
    let mut s = String::with_capacity(bytes.as_ref().len() * 2);
    for b in bytes.as_ref() {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn build_then_verify_roundtrip() {
        let payload = tempdir().unwrap();
        fs::create_dir_all(payload.path().join("usr/bin")).unwrap();
        fs::write(payload.path().join("usr/bin/foo"), b"#!/bin/sh\necho hi\n").unwrap();
        fs::write(payload.path().join(".metadata.json"), b"{}").unwrap();

        let out = payload.path().join("out.tar.gz");
        let metadata = build(payload.path(), "foo", "1.0.0", None, &out).unwrap();

        assert_eq!(metadata.files, vec!["usr/bin/foo".to_string()]);
        assert!(verify(&out).unwrap());
    }

    #[test]
    fn verify_detects_tampering() {
        // Hand-build an archive whose metadata.json claims a digest that
        // doesn't match the payload entry actually present.
        let dir = tempdir().unwrap();
        let out = dir.path().join("tampered.tar.gz");
        let file = File::create(&out).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = Builder::new(encoder);

        let payload = b"real content";
        let mut header = Header::new_gnu();
        header.set_size(payload.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "foo-1.0.0/data", Cursor::new(payload))
            .unwrap();

        let bogus_metadata = ArtifactMetadata {
            name: "foo".into(),
            version: "1.0.0".into(),
            arch: "any".into(),
            created_at: chrono::Utc::now(),
            files: vec!["data".to_string()],
            sha256: "0".repeat(64),
            recipe: None,
            signature: None,
        };
        let meta_bytes = serde_json::to_vec(&bogus_metadata).unwrap();
        let mut header = Header::new_gnu();
        header.set_size(meta_bytes.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "foo-1.0.0/metadata.json", Cursor::new(&meta_bytes))
            .unwrap();

        let encoder = builder.into_inner().unwrap();
        encoder.finish().unwrap().flush().unwrap();

        assert!(!verify(&out).unwrap());
    }

    #[test]
    fn extract_strips_prefix() {
        let payload = tempdir().unwrap();
        fs::create_dir_all(payload.path().join("etc")).unwrap();
        fs::write(payload.path().join("etc/conf"), b"hello").unwrap();
        let out = payload.path().join("out.tar.gz");
        build(payload.path(), "foo", "2.0.0", None, &out).unwrap();

        let dest = tempdir().unwrap();
        let metadata = extract(&out, dest.path()).unwrap();
        assert_eq!(metadata.version, "2.0.0");
        assert_eq!(fs::read_to_string(dest.path().join("etc/conf")).unwrap(), "hello");
        assert!(!dest.path().join("metadata.json").exists());
    }
}
