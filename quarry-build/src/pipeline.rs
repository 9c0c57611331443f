//! Build Pipeline: per-package state machine from fingerprint through
//! cache probe, sandboxed build, archiving, and cache store.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use quarry_recipe::{fingerprint, Recipe};
use quarry_store::{ArtifactCache, ArtifactMetadata};
use tracing::info;

use crate::adapters::command_sequence;
use crate::error::{Error, Result};
use crate::executor::PrivilegedExecutor;
use crate::hooks::HookDispatcher;
use crate::sandbox::Sandbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Fingerprinted,
    CacheHit,
    SandboxPrepared,
    PreBuildHooks,
    BuildSystemInvoked,
    PostBuildHooks,
    SandboxSnapshot,
    InstallIntoSandbox,
    PostInstallHooks,
    Archived,
    Cached,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct BuildResult {
    pub success: bool,
    pub artifact_path: Option<PathBuf>,
    pub fingerprint: String,
    pub duration: Duration,
    pub cache_hit: bool,
    pub error: Option<String>,
}

pub struct BuildPipelineConfig {
    pub sandbox_base: PathBuf,
    pub snapshot_dir: PathBuf,
    pub output_dir: PathBuf,
    pub max_attempts: u32,
}

/// Run the full build pipeline for `recipe`, starting from the cache probe
/// and falling through to a sandboxed build when there's no hit.
pub fn run(
    recipe: &Recipe,
    config: &BuildPipelineConfig,
    cache: &ArtifactCache,
    executor: &PrivilegedExecutor,
    hooks: &HookDispatcher,
) -> Result<BuildResult> {
    let attempts = config.max_attempts.max(1);

    let mut last_error = None;
    for attempt in 0..attempts {
        match run_once(recipe, config, cache, executor, hooks) {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = Some(e);
                if attempt + 1 < attempts {
                    info!(package = %recipe.name, attempt, "pipeline: retrying after failure");
                }
            }
        }
    }

    let cause = last_error.map(|e| e.to_string()).unwrap_or_default();
    let _ = hooks.dispatch("on_fail_pkg", &recipe.name, &[], executor, None);
    Err(Error::Build {
        package: recipe.name.clone(),
        stage: "build".to_string(),
        cause,
    })
}

fn run_once(
    recipe: &Recipe,
    config: &BuildPipelineConfig,
    cache: &ArtifactCache,
    executor: &PrivilegedExecutor,
    hooks: &HookDispatcher,
) -> Result<BuildResult> {
    let start = Instant::now();
    let mut stage = Stage::Idle;

    let fp = fingerprint(recipe).map_err(Error::Recipe)?;
    stage = Stage::Fingerprinted;

    if let Some(path) = cache.lookup(&recipe.name, &fp) {
        info!(package = %recipe.name, fingerprint = %fp, "pipeline: cache hit");
        return Ok(BuildResult {
            success: true,
            artifact_path: Some(path),
            fingerprint: fp,
            duration: start.elapsed(),
            cache_hit: true,
            error: None,
        });
    }
    let _ = stage;
    stage = Stage::CacheHit;

    let mut sandbox = Sandbox::new(&config.sandbox_base, &recipe.name);
    let stage_result: Result<(PathBuf, quarry_store::ArtifactMetadata)> = (|| {
        sandbox
            .prepare(true, &recipe.name, &fp)
            .map_err(|e| to_build_error(recipe, Stage::SandboxPrepared, e))?;
        stage = Stage::SandboxPrepared;

        let recipe_hooks = |name: &str| recipe.hooks.get(name).cloned().unwrap_or_default();

        hooks
            .dispatch("pre_build", &recipe.name, &recipe_hooks("pre_build"), executor, Some(&recipe.source_dir))
            .map_err(|e| to_build_error(recipe, Stage::PreBuildHooks, e))?;
        stage = Stage::PreBuildHooks;

        let build_system = recipe.auto_detect_build_system();
        let node_script = recipe
            .metadata
            .get("node_script")
            .and_then(|v| v.as_str());
        let all_steps = command_sequence(build_system, &recipe.source_dir, node_script);
        let (build_steps, install_steps): (Vec<_>, Vec<_>) =
            all_steps.into_iter().partition(|step| !step.needs_destdir);

        let run_step = |step: &crate::adapters::Step, executor: &PrivilegedExecutor, sandbox: &mut Sandbox| -> Result<()> {
            let cwd = step
                .relative_cwd
                .as_ref()
                .map(|rel| recipe.source_dir.join(rel))
                .unwrap_or_else(|| recipe.source_dir.clone());
            if let Some(parent) = step.relative_cwd.as_ref() {
                let full = recipe.source_dir.join(parent);
                std::fs::create_dir_all(&full).map_err(Error::Io)?;
            }
            sandbox.run(executor, &step.argv, &[], Some(&cwd), step.needs_destdir).map(|_| ())
        };

        for step in &build_steps {
            run_step(step, executor, &mut sandbox)
                .map_err(|e| to_build_error(recipe, Stage::BuildSystemInvoked, e))?;
        }
        stage = Stage::BuildSystemInvoked;

        hooks
            .dispatch("post_build", &recipe.name, &recipe_hooks("post_build"), executor, Some(&recipe.source_dir))
            .map_err(|e| to_build_error(recipe, Stage::PostBuildHooks, e))?;
        stage = Stage::PostBuildHooks;

        // Snapshot before installing into the sandbox, so a failed
        // `install`/`DESTDIR` step can be rolled back to the built-but-not-
        // installed state rather than leaving a partially staged tree.
        let snapshot_path = sandbox
            .snapshot(&config.snapshot_dir)
            .map_err(|e| to_build_error(recipe, Stage::SandboxSnapshot, e))?;
        stage = Stage::SandboxSnapshot;

        for step in &install_steps {
            if let Err(e) = run_step(step, executor, &mut sandbox) {
                let _ = sandbox.restore(&snapshot_path);
                return Err(to_build_error(recipe, Stage::InstallIntoSandbox, e));
            }
        }
        stage = Stage::InstallIntoSandbox;

        hooks
            .dispatch(
                "post_install",
                &recipe.name,
                &recipe_hooks("post_install"),
                executor,
                Some(&recipe.source_dir),
            )
            .map_err(|e| {
                let _ = sandbox.restore(&snapshot_path);
                to_build_error(recipe, Stage::PostInstallHooks, e)
            })?;
        stage = Stage::PostInstallHooks;

        std::fs::create_dir_all(&config.output_dir).map_err(Error::Io)?;
        let archive_path = config.output_dir.join(format!("{}-{}.tar.gz", recipe.name, fp));
        let recipe_snapshot = serde_json::to_value(recipe).ok();
        let metadata = sandbox
            .archive(&recipe.name, &recipe.version, recipe_snapshot, &archive_path)
            .map_err(|e| to_build_error(recipe, Stage::Archived, e))?;
        stage = Stage::Archived;

        Ok((archive_path, metadata))
    })();

    let (archive_path, metadata) = match stage_result {
        Ok(pair) => pair,
        Err(e) => {
            let _ = stage;
            return Err(e);
        }
    };

    let stored = cache
        .store(&recipe.name, &fp, &archive_path, &metadata)
        .map_err(|e| to_build_error(recipe, Stage::Cached, Error::Archive(e.to_string())))?;

    Ok(BuildResult {
        success: true,
        artifact_path: Some(stored),
        fingerprint: fp,
        duration: start.elapsed(),
        cache_hit: false,
        error: None,
    })
}

fn to_build_error(recipe: &Recipe, stage: Stage, cause: Error) -> Error {
    Error::Build {
        package: recipe.name.clone(),
        stage: format!("{stage:?}"),
        cause: cause.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_recipe(dir: &Path) -> Recipe {
        std::fs::write(dir.join("Makefile"), "all:\n\t@true\ninstall:\n\t@true\n").unwrap();
        let mut recipe: Recipe = quarry_recipe::Recipe::parse(
            "name: foo\nversion: 1.0.0\nmanifest_files:\n  - Makefile\n",
            "yaml",
        )
        .unwrap();
        recipe.source_dir = dir.to_path_buf();
        recipe
    }

    #[test]
    fn cache_hit_short_circuits() {
        let workdir = tempdir().unwrap();
        let recipe = sample_recipe(workdir.path());
        let cache_dir = tempdir().unwrap();
        let cache = ArtifactCache::new(cache_dir.path());

        let fp = fingerprint(&recipe).unwrap();
        let fake_archive = workdir.path().join("pre-existing.tar.gz");
        std::fs::write(&fake_archive, b"bytes").unwrap();
        let meta = ArtifactMetadata {
            name: recipe.name.clone(),
            version: recipe.version.clone(),
            arch: "any".into(),
            created_at: chrono::Utc::now(),
            files: vec![],
            sha256: String::new(),
            recipe: None,
            signature: None,
        };
        cache.store(&recipe.name, &fp, &fake_archive, &meta).unwrap();

        let config = BuildPipelineConfig {
            sandbox_base: workdir.path().join("sandbox"),
            snapshot_dir: workdir.path().join("snapshots"),
            output_dir: workdir.path().join("out"),
            max_attempts: 1,
        };
        let executor = PrivilegedExecutor::new();
        let hooks = HookDispatcher::new();

        let result = run(&recipe, &config, &cache, &executor, &hooks).unwrap();
        assert!(result.cache_hit);
    }
}
