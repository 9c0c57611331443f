//! Content-addressed fingerprint computation.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::recipe::Recipe;

const CHUNK_SIZE: usize = 8 * 1024;

/// Compute the fingerprint of a recipe and its source tree.
///
/// The canonical byte stream is: the recipe serialized as JSON with sorted
/// keys, followed by either the literal bytes of every file the recipe's
/// manifest declares (sorted lexicographically by relative path), or, when
/// no manifest is declared, a `"<relative_path>:<mtime>"` record per file
/// under the source directory (also sorted). Streamed through SHA-256 in
/// 8 KiB chunks.
pub fn fingerprint(recipe: &Recipe) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_recipe_json(recipe)?.as_bytes());

    if recipe.manifest_files.is_empty() {
        hash_tree_fallback(&recipe.source_dir, &mut hasher)?;
    } else {
        hash_manifest_files(&recipe.source_dir, &recipe.manifest_files, &mut hasher)?;
    }

    Ok(hex::encode(hasher.finalize()))
}

fn canonical_recipe_json(recipe: &Recipe) -> Result<String> {
    let value = serde_json::to_value(recipe)?;
    let sorted = sort_json_keys(value);
    Ok(serde_json::to_string(&sorted)?)
}

fn sort_json_keys(value: serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_json_keys(map[&key].clone()));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_json_keys).collect()),
        other => other,
    }
}

fn hash_manifest_files(source_dir: &Path, files: &[String], hasher: &mut Sha256) -> Result<()> {
    let mut sorted: Vec<&String> = files.iter().collect();
    sorted.sort();

    for relative in sorted {
        let path = source_dir.join(relative);
        match stream_file(&path, hasher) {
            Ok(()) => {}
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                hasher.update(format!("__missing__:{relative}").as_bytes());
            }
            Err(Error::Io(e)) => return Err(Error::UnreadableManifest(relative.clone(), e)),
            Err(other) => return Err(other),
        }
    }
    Ok(())
}

fn hash_tree_fallback(source_dir: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut entries = Vec::new();
    collect_files(source_dir, source_dir, &mut entries)?;
    entries.sort();

    for relative in entries {
        let path = source_dir.join(&relative);
        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        hasher.update(format!("{relative}:{mtime}").as_bytes());
    }
    Ok(())
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else if let Ok(relative) = path.strip_prefix(root) {
            out.push(relative.to_string_lossy().into_owned());
        }
    }
    Ok(())
}

fn stream_file(path: &Path, hasher: &mut Sha256) -> Result<()> {
    let mut file = File::open(path)?;
    let mut buffer = [0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(())
}

/// Minimal hex encoding to avoid pulling in a dedicated crate for it; SHA-256
/// digests are fixed-size so this never needs to handle arbitrary input.
mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let mut s = String::with_capacity(bytes.as_ref().len() * 2);
        for b in bytes.as_ref() {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn make_recipe(dir: &Path, manifest: Vec<&str>) -> Recipe {
        Recipe {
            name: "foo".into(),
            version: "1.0.0".into(),
            build_system: None,
            summary: None,
            description: None,
            homepage: None,
            source: None,
            update_regex: None,
            dependencies: Default::default(),
            manifest_files: manifest.into_iter().map(String::from).collect(),
            hooks: Default::default(),
            keywords: vec![],
            provides: vec![],
            metadata: Default::default(),
            source_dir: dir.to_path_buf(),
        }
    }

    #[test]
    fn deterministic_across_calls() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:\n").unwrap();
        std::fs::write(dir.path().join("main.c"), "int main(){}").unwrap();
        let recipe = make_recipe(dir.path(), vec!["Makefile", "main.c"]);

        let a = fingerprint(&recipe).unwrap();
        let b = fingerprint(&recipe).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sensitive_to_file_change() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:\n").unwrap();
        std::fs::write(dir.path().join("main.c"), "int main(){}").unwrap();
        let recipe = make_recipe(dir.path(), vec!["Makefile", "main.c"]);
        let before = fingerprint(&recipe).unwrap();

        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.path().join("main.c"))
            .unwrap();
        writeln!(f, "// changed").unwrap();

        let after = fingerprint(&recipe).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn missing_manifest_file_contributes_marker() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:\n").unwrap();
        let recipe = make_recipe(dir.path(), vec!["Makefile", "does-not-exist.c"]);
        // should not error; missing file contributes a literal marker
        let result = fingerprint(&recipe);
        assert!(result.is_ok());
    }

    #[test]
    fn sensitive_to_recipe_field_change() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("Makefile"), "all:\n").unwrap();
        let mut recipe = make_recipe(dir.path(), vec!["Makefile"]);
        let before = fingerprint(&recipe).unwrap();
        recipe.version = "2.0.0".into();
        let after = fingerprint(&recipe).unwrap();
        assert_ne!(before, after);
    }
}
