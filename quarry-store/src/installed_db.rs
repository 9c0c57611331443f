//! Installed Database: durable name → Installed Record mapping,
//! persisted as a single JSON document, written atomically.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledRecord {
    pub name: String,
    pub version: String,
    pub installed_at: DateTime<Utc>,
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl InstalledRecord {
    pub fn new(name: impl Into<String>, version: impl Into<String>, files: Vec<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            installed_at: Utc::now(),
            files,
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Document {
    #[serde(flatten)]
    records: HashMap<String, InstalledRecord>,
}

/// Guards the in-memory map and the on-disk file with one mutex: concurrent
/// writers inside this process serialize through it. External concurrent
/// writers to the same file are not supported.
pub struct InstalledDb {
    path: PathBuf,
    inner: Mutex<Document>,
}

impl InstalledDb {
    /// Load the database from `path`, treating a missing file as empty.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let document = if path.exists() {
            let text = fs::read_to_string(&path)?;
            if text.trim().is_empty() {
                Document::default()
            } else {
                serde_json::from_str(&text)?
            }
        } else {
            Document::default()
        };

        Ok(Self {
            path,
            inner: Mutex::new(document),
        })
    }

    /// Persist the current in-memory state: write to a temp file in the same
    /// directory, then rename over the target path.
    pub fn save(&self) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let text = serde_json::to_string_pretty(&*guard)?;
        drop(guard);

        let dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        fs::create_dir_all(&dir)?;

        let tmp_path = dir.join(format!(
            ".{}.tmp",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "installed_db".to_string())
        ));
        fs::write(&tmp_path, text)?;
        fs::rename(&tmp_path, &self.path).map_err(Error::AtomicRename)?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<InstalledRecord> {
        self.inner.lock().unwrap().records.get(name).cloned()
    }

    /// Insert or replace a record; returns the previous record if any
    /// (upgrades replace the prior Installed Record).
    pub fn put(&self, record: InstalledRecord) -> Option<InstalledRecord> {
        self.inner
            .lock()
            .unwrap()
            .records
            .insert(record.name.clone(), record)
    }

    pub fn remove(&self, name: &str) -> Option<InstalledRecord> {
        self.inner.lock().unwrap().records.remove(name)
    }

    pub fn list(&self) -> Vec<InstalledRecord> {
        self.inner.lock().unwrap().records.values().cloned().collect()
    }

    /// Every absolute path claimed by some record, paired with the owning
    /// package name. Used to enforce the no-double-owner invariant.
    pub fn owner_map(&self) -> HashMap<PathBuf, String> {
        let guard = self.inner.lock().unwrap();
        let mut map = HashMap::new();
        for record in guard.records.values() {
            for file in &record.files {
                map.insert(file.clone(), record.name.clone());
            }
        }
        map
    }

    /// Package names that declare `name` in their recipe snapshot's
    /// dependencies, consulting only the Installed DB per the open-question
    /// resolution in DESIGN.md.
    pub fn reverse_dependents(&self, name: &str) -> Vec<String> {
        let guard = self.inner.lock().unwrap();
        guard
            .records
            .values()
            .filter(|record| {
                record
                    .metadata
                    .get("recipe")
                    .and_then(|r| r.get("dependencies"))
                    .map(|deps| mentions(deps, name))
                    .unwrap_or(false)
            })
            .map(|r| r.name.clone())
            .collect()
    }
}

fn mentions(deps: &serde_json::Value, name: &str) -> bool {
    let in_list = |list: &serde_json::Value| {
        list.as_array()
            .map(|items| {
                items.iter().any(|item| {
                    item.as_str() == Some(name)
                        || item.get("name").and_then(|n| n.as_str()) == Some(name)
                })
            })
            .unwrap_or(false)
    };
    deps.get("build").map(in_list).unwrap_or(false) || deps.get("runtime").map(in_list).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_remove_roundtrip() {
        let dir = tempdir().unwrap();
        let db = InstalledDb::load(dir.path().join("installed.json")).unwrap();

        let record = InstalledRecord::new("foo", "1.0.0", vec![PathBuf::from("/usr/bin/foo")]);
        assert!(db.put(record).is_none());
        assert_eq!(db.get("foo").unwrap().version, "1.0.0");

        let removed = db.remove("foo");
        assert!(removed.is_some());
        assert!(db.get("foo").is_none());
    }

    #[test]
    fn save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("installed.json");
        let db = InstalledDb::load(&path).unwrap();
        db.put(InstalledRecord::new("foo", "1.0.0", vec![]));
        db.save().unwrap();

        let reloaded = InstalledDb::load(&path).unwrap();
        assert_eq!(reloaded.get("foo").unwrap().name, "foo");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempdir().unwrap();
        let db = InstalledDb::load(dir.path().join("does-not-exist.json")).unwrap();
        assert!(db.list().is_empty());
    }

    #[test]
    fn owner_map_detects_conflicts() {
        let dir = tempdir().unwrap();
        let db = InstalledDb::load(dir.path().join("installed.json")).unwrap();
        db.put(InstalledRecord::new(
            "foo",
            "1.0.0",
            vec![PathBuf::from("/usr/bin/shared")],
        ));
        let owners = db.owner_map();
        assert_eq!(owners.get(&PathBuf::from("/usr/bin/shared")).unwrap(), "foo");
    }
}
