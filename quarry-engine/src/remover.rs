//! Remover: the inverse of the Transactional Installer. Checks
//! reverse dependents, backs up the files about to disappear, removes them,
//! and drops the Installed Record — restoring from the just-made backup if
//! anything goes wrong partway through.

use std::path::PathBuf;

use quarry_build::{ExecProfile, HookDispatcher, Invocation, PrivilegedExecutor};
use quarry_store::{Action, HistoryLog, InstalledDb, InstalledRecord};
use tracing::info;

use crate::error::{Error, Result};
use crate::installer::{backup_existing, hook_commands, restore_backup};

#[derive(Debug, Clone)]
pub struct RemoverConfig {
    pub install_root: PathBuf,
    pub backup_dir: PathBuf,
    pub force: bool,
    pub backup: bool,
    pub actor: String,
}

impl Default for RemoverConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from("/"),
            backup_dir: PathBuf::from("/var/lib/quarry/backups"),
            force: false,
            backup: true,
            actor: "quarry".to_string(),
        }
    }
}

/// Remove `name`: check for reverse dependents, run pre-remove hooks, back
/// up the installed files, delete them, drop the Installed Record, then run
/// post-remove hooks. Returns the deleted Installed Record on success.
pub fn remove(
    name: &str,
    config: &RemoverConfig,
    db: &InstalledDb,
    history: &HistoryLog,
    hooks: &HookDispatcher,
    executor: &PrivilegedExecutor,
) -> Result<InstalledRecord> {
    let record = db
        .get(name)
        .ok_or_else(|| Error::Remove {
            package: name.to_string(),
            cause: "no such package is installed".to_string(),
        })?;

    let dependents = db.reverse_dependents(name);
    if !dependents.is_empty() && !config.force {
        return Err(Error::ReverseDependents(name.to_string(), dependents));
    }

    let pre_remove = hook_commands(&record.metadata.get("recipe").cloned(), "pre_remove");
    hooks.dispatch("pre_remove", name, &pre_remove, executor, None)?;

    let backup_path = if config.backup {
        backup_existing(&record.files, &config.backup_dir)?
    } else {
        None
    };

    if let Err(cause) = remove_files(&record.files, executor) {
        if let Some(backup_path) = &backup_path {
            if let Err(rollback_cause) = restore_backup(backup_path) {
                return Err(Error::InstallRollbackFailed {
                    package: name.to_string(),
                    cause: cause.to_string(),
                    rollback_cause: rollback_cause.to_string(),
                });
            }
        }
        return Err(Error::Remove {
            package: name.to_string(),
            cause: cause.to_string(),
        });
    }

    db.remove(name);
    db.save()?;

    history.append(
        &config.actor,
        Action::Remove,
        name,
        serde_json::json!({"version": record.version}),
        "ok",
        None,
    )?;

    let post_remove = hook_commands(&record.metadata.get("recipe").cloned(), "post_remove");
    hooks.dispatch("post_remove", name, &post_remove, executor, None)?;

    info!(package = name, "remover: remove complete");
    Ok(record)
}

fn remove_files(files: &[PathBuf], executor: &PrivilegedExecutor) -> Result<()> {
    for file in files {
        if !file.exists() {
            continue;
        }
        let invocation = Invocation {
            argv: vec!["rm".to_string(), "-f".to_string(), file.to_string_lossy().into_owned()],
            env: vec![],
            cwd: None,
            privileged: true,
        };
        executor.run(&invocation, ExecProfile::default_profile(), true)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn install_fixture(root: &std::path::Path, db: &InstalledDb, name: &str) {
        let dest = root.join("usr/bin").join(name);
        fs::create_dir_all(dest.parent().unwrap()).unwrap();
        fs::write(&dest, b"binary").unwrap();
        let mut record = InstalledRecord::new(name, "1.0.0", vec![dest]);
        record.metadata = serde_json::json!({"recipe": {"dependencies": {"build": [], "runtime": []}}});
        db.put(record);
    }

    #[test]
    fn removes_package_with_no_dependents() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let db = InstalledDb::load(dir.path().join("installed.json")).unwrap();
        install_fixture(&root, &db, "app");

        let config = RemoverConfig {
            install_root: root.clone(),
            backup_dir: dir.path().join("backups"),
            ..RemoverConfig::default()
        };
        let history = HistoryLog::open(dir.path().join("history.jsonl"));
        let hooks = HookDispatcher::new();
        let executor = PrivilegedExecutor::new();

        let removed = remove("app", &config, &db, &history, &hooks, &executor).unwrap();
        assert_eq!(removed.name, "app");
        assert!(db.get("app").is_none());
        assert!(!root.join("usr/bin/app").exists());
    }

    #[test]
    fn refuses_removal_with_dependents_unless_forced() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(&root).unwrap();

        let db = InstalledDb::load(dir.path().join("installed.json")).unwrap();
        install_fixture(&root, &db, "lib");

        let mut app_record = InstalledRecord::new("app", "1.0.0", vec![]);
        app_record.metadata = serde_json::json!({
            "recipe": {"dependencies": {"build": [], "runtime": ["lib"]}}
        });
        db.put(app_record);

        let config = RemoverConfig {
            install_root: root.clone(),
            backup_dir: dir.path().join("backups"),
            ..RemoverConfig::default()
        };
        let history = HistoryLog::open(dir.path().join("history.jsonl"));
        let hooks = HookDispatcher::new();
        let executor = PrivilegedExecutor::new();

        let result = remove("lib", &config, &db, &history, &hooks, &executor);
        assert!(matches!(result, Err(Error::ReverseDependents(_, _))));

        let config = RemoverConfig {
            force: true,
            ..config
        };
        remove("lib", &config, &db, &history, &hooks, &executor).unwrap();
        assert!(db.get("lib").is_none());
    }
}
