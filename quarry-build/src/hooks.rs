//! Hook Dispatcher: runs named lifecycle hooks from in-process
//! registrations, recipe-declared commands, and directory-discovered
//! scripts, in that order.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use glob::glob;
use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::executor::{ExecProfile, Invocation, PrivilegedExecutor};

pub const STAGES: &[&str] = &[
    "pre_prepare",
    "post_prepare",
    "pre_build",
    "post_build",
    "pre_install",
    "post_install",
    "pre_remove",
    "post_remove",
    "pre_upgrade",
    "post_upgrade",
    "pre_sync",
    "post_sync",
    "pre_deepclean",
    "post_deepclean",
    "pre_auto",
    "post_auto",
    "pre_auto_pkg",
    "post_auto_pkg",
    "on_fail_pkg",
    "on_recover_pkg",
];

pub type Callback = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// A hooks directory is scanned for `<stage>.sh`-style scripts; each
/// executable file matching the stage name is run in filename order.
pub struct HookDispatcher {
    global_hooks_path: Option<PathBuf>,
    callbacks: std::collections::HashMap<String, Vec<Callback>>,
}

impl HookDispatcher {
    pub fn new() -> Self {
        Self {
            global_hooks_path: None,
            callbacks: std::collections::HashMap::new(),
        }
    }

    pub fn with_global_hooks_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.global_hooks_path = Some(path.into());
        self
    }

    /// Register a global, in-process callback for `stage`. Evaluated before
    /// recipe-declared commands and directory-discovered scripts.
    pub fn register(&mut self, stage: &str, callback: impl Fn(&str) -> Result<()> + Send + Sync + 'static) {
        self.callbacks
            .entry(stage.to_string())
            .or_default()
            .push(Box::new(callback));
    }

    /// Run every hook for `stage`: registered callbacks, then
    /// `recipe_commands` (shell-command strings declared by the recipe),
    /// then any directory-discovered global scripts. A failure at any point
    /// is fatal for the stage.
    pub fn dispatch(
        &self,
        stage: &str,
        package: &str,
        recipe_commands: &[String],
        executor: &PrivilegedExecutor,
        cwd: Option<&Path>,
    ) -> Result<()> {
        if let Some(callbacks) = self.callbacks.get(stage) {
            for callback in callbacks {
                callback(package).map_err(|e| Error::Hook {
                    stage: stage.to_string(),
                    cause: e.to_string(),
                })?;
            }
        }

        for command in recipe_commands {
            self.run_command(stage, command, executor, cwd)?;
        }

        if let Some(global_dir) = &self.global_hooks_path {
            let pattern = format!("{}/{}*", global_dir.display(), stage);
            let mut scripts: Vec<PathBuf> = glob(&pattern)
                .map_err(quarry_recipe::Error::from)?
                .filter_map(std::result::Result::ok)
                .filter(|p| is_executable(p))
                .collect();
            scripts.sort();
            for script in scripts {
                let command = script.to_string_lossy().into_owned();
                self.run_command(stage, &command, executor, cwd)?;
            }
        }

        Ok(())
    }

    fn run_command(
        &self,
        stage: &str,
        command: &str,
        executor: &PrivilegedExecutor,
        cwd: Option<&Path>,
    ) -> Result<()> {
        let script_path = write_temp_script(stage, command)?;
        let invocation = Invocation {
            argv: vec![script_path.to_string_lossy().into_owned()],
            env: vec![],
            cwd: cwd.map(Path::to_path_buf),
            privileged: false,
        };

        let result = executor.run(&invocation, ExecProfile::default_profile(), false);
        let _ = fs::remove_file(&script_path);

        match result {
            Ok(r) if r.success => Ok(()),
            Ok(r) => {
                let last = r.last();
                error!(stage, command, "hook: command failed");
                Err(Error::Hook {
                    stage: stage.to_string(),
                    cause: format!("exit {:?}: {}", last.exit_code, last.stderr),
                })
            }
            Err(e) => Err(Error::Hook {
                stage: stage.to_string(),
                cause: e.to_string(),
            }),
        }
    }
}

impl Default for HookDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn write_temp_script(stage: &str, command: &str) -> Result<PathBuf> {
    // Each call gets its own unique file (not just keyed by stage+pid): two
    // packages in the same process can run the same stage concurrently, and
    // a shared path would race on write/exec/remove.
    let named = tempfile::Builder::new()
        .prefix(&format!("quarry-hook-{stage}-"))
        .tempfile()?;
    let (file, path) = named.keep().map_err(|e| Error::Io(e.error))?;
    let script = format!("#!/bin/sh\nset -e\n{command}\n");
    drop(file);
    fs::write(&path, script)?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms)?;
    Ok(path)
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn callback_runs_before_recipe_commands() {
        let executor = PrivilegedExecutor::new();
        let mut dispatcher = HookDispatcher::new();
        let calls: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));

        let calls_clone = Arc::clone(&calls);
        dispatcher.register("pre_build", move |_pkg| {
            calls_clone.lock().unwrap().push("callback".to_string());
            Ok(())
        });

        dispatcher
            .dispatch("pre_build", "foo", &["true".to_string()], &executor, None)
            .unwrap();

        assert_eq!(calls.lock().unwrap().as_slice(), &["callback".to_string()]);
    }

    #[test]
    fn failing_recipe_command_is_fatal() {
        let executor = PrivilegedExecutor::new();
        let dispatcher = HookDispatcher::new();
        let result = dispatcher.dispatch(
            "pre_build",
            "foo",
            &["exit 1".to_string()],
            &executor,
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn directory_discovered_scripts_run_in_order() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("marker");
        let script_path = dir.path().join("post_build-01.sh");
        fs::write(&script_path, format!("#!/bin/sh\necho ran >> {}\n", marker.display())).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();

        let executor = PrivilegedExecutor::new();
        let dispatcher = HookDispatcher::new().with_global_hooks_path(dir.path());
        dispatcher.dispatch("post_build", "foo", &[], &executor, None).unwrap();

        assert!(marker.exists());
    }

    #[test]
    fn unknown_stage_with_no_hooks_is_a_noop() {
        let executor = PrivilegedExecutor::new();
        let dispatcher = HookDispatcher::new();
        dispatcher.dispatch("pre_sync", "foo", &[], &executor, None).unwrap();
    }
}
