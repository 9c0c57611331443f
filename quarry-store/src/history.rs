//! History Event log: append-only line-delimited JSON.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Install,
    Remove,
    Upgrade,
    Sync,
    Deepclean,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: Action,
    pub package: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub result: String,
    #[serde(default)]
    pub note: Option<String>,
}

pub struct HistoryLog {
    path: PathBuf,
    lock: Mutex<()>,
    next_id: Mutex<u64>,
}

impl HistoryLog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
            next_id: Mutex::new(1),
        }
    }

    /// Append one record, guarded by a process-wide mutex so concurrent
    /// writers from multiple workers never interleave partial lines.
    pub fn append(
        &self,
        actor: &str,
        action: Action,
        package: &str,
        details: serde_json::Value,
        result: &str,
        note: Option<&str>,
    ) -> Result<HistoryEvent> {
        let _guard = self.lock.lock().unwrap();

        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            let id = format!("h{}-{}", Utc::now().timestamp(), *next_id);
            *next_id += 1;
            id
        };

        let event = HistoryEvent {
            id,
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action,
            package: package.to_string(),
            details,
            result: result.to_string(),
            note: note.map(String::from),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&event)?)?;

        Ok(event)
    }

    pub fn read_all(&self) -> Result<Vec<HistoryEvent>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        let mut events = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str(line)?);
        }
        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::open(dir.path().join("history.jsonl"));

        log.append(
            "cli",
            Action::Install,
            "foo",
            serde_json::json!({"version": "1.0.0"}),
            "ok",
            None,
        )
        .unwrap();
        log.append("cli", Action::Remove, "foo", serde_json::json!({}), "ok", None)
            .unwrap();

        let events = log.read_all().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].action, Action::Install);
        assert_eq!(events[1].action, Action::Remove);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempdir().unwrap();
        let log = HistoryLog::open(dir.path().join("does-not-exist.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
