//! Upgrade Orchestrator: find installed packages whose recipe now
//! declares a strictly newer version, levelize just that candidate set, and
//! work through it a level at a time with a bounded worker pool — cache hit
//! or build-then-install per package, immediate DB visibility for later
//! levels, and a written report at the end.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use quarry_build::{BuildPipelineConfig, HookDispatcher, PrivilegedExecutor};
use quarry_recipe::{Recipe, RecipeIndex};
use quarry_store::{Action, ArtifactCache, HistoryLog, InstalledDb};
use serde::Serialize;
use tracing::info;

use crate::error::Result;
use crate::graph::{DependencyGraph, PkgId};
use crate::installer::InstallerConfig;

#[derive(Debug, Clone)]
pub struct UpgradeConfig {
    pub concurrency: usize,
    pub force: Vec<String>,
    pub report_dir: PathBuf,
    pub sandbox_base: PathBuf,
    pub snapshot_dir: PathBuf,
    pub build_output_dir: PathBuf,
    pub installer: InstallerConfig,
}

impl Default for UpgradeConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            force: Vec::new(),
            report_dir: PathBuf::from("/var/lib/quarry/reports"),
            sandbox_base: PathBuf::from("/var/lib/quarry/sandboxes"),
            snapshot_dir: PathBuf::from("/var/lib/quarry/snapshots"),
            build_output_dir: PathBuf::from("/var/lib/quarry/artifacts/pending"),
            installer: InstallerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reason")]
pub enum UpgradeReason {
    VersionUpdated { old_version: String, new_version: String },
    Forced,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeCandidate {
    pub name: String,
    pub from_version: String,
    pub to_version: String,
    pub reason: UpgradeReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageOutcome {
    pub name: String,
    pub success: bool,
    pub cache_hit: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpgradeReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub candidates: Vec<UpgradeCandidate>,
    pub levels: Vec<Vec<String>>,
    pub results: Vec<PackageOutcome>,
}

/// Run one upgrade pass: detect candidates, levelize their dependency
/// subgraph, and work through each level with at most `config.concurrency`
/// packages building or installing at once.
pub fn run(
    index: &mut RecipeIndex,
    db: &InstalledDb,
    cache: &ArtifactCache,
    history: &HistoryLog,
    hooks: &HookDispatcher,
    executor: &PrivilegedExecutor,
    config: &UpgradeConfig,
) -> Result<UpgradeReport> {
    let started_at = Utc::now();
    let candidates = detect_candidates(index, db, config)?;

    let (graph, ids, levels) = levelize_candidates(index, &candidates)?;

    let mut failed: HashSet<String> = HashSet::new();
    let mut results: Vec<PackageOutcome> = Vec::new();

    for level in &levels {
        let (runnable, blocked): (Vec<String>, Vec<String>) = level.iter().cloned().partition(|name| {
            !graph
                .dependencies(ids[name])
                .iter()
                .any(|dep_id| failed.contains(graph.name(*dep_id)))
        });

        for name in &blocked {
            failed.insert(name.clone());
            results.push(PackageOutcome {
                name: name.clone(),
                success: false,
                cache_hit: false,
                error: Some("skipped: an upstream dependency failed to upgrade".to_string()),
            });
        }

        let level_results = process_level(&runnable, index, db, cache, history, hooks, executor, config)?;
        for outcome in level_results {
            if !outcome.success {
                failed.insert(outcome.name.clone());
            }
            results.push(outcome);
        }
    }

    let finished_at = Utc::now();
    let report = UpgradeReport {
        started_at,
        finished_at,
        candidates,
        levels,
        results,
    };
    write_report(&report, &config.report_dir)?;

    let succeeded = report.results.iter().filter(|r| r.success).count();
    history.append(
        "quarry",
        Action::Upgrade,
        "*",
        serde_json::json!({"candidates": report.candidates.len(), "succeeded": succeeded}),
        if succeeded == report.results.len() { "ok" } else { "partial" },
        None,
    )?;

    info!(
        candidates = report.candidates.len(),
        succeeded,
        failed = report.results.len() - succeeded,
        "upgrade orchestrator: pass complete"
    );

    Ok(report)
}

fn detect_candidates(
    index: &mut RecipeIndex,
    db: &InstalledDb,
    config: &UpgradeConfig,
) -> Result<Vec<UpgradeCandidate>> {
    let mut candidates = Vec::new();
    for record in db.list() {
        let Some(recipe) = index.find(&record.name)? else {
            continue;
        };
        let forced = config.force.iter().any(|name| name == &record.name);
        let ordering = quarry_recipe::compare_versions(&recipe.version, &record.version);

        if ordering == Ordering::Greater {
            candidates.push(UpgradeCandidate {
                name: record.name.clone(),
                from_version: record.version.clone(),
                to_version: recipe.version.clone(),
                reason: UpgradeReason::VersionUpdated {
                    old_version: record.version.clone(),
                    new_version: recipe.version.clone(),
                },
            });
        } else if forced {
            candidates.push(UpgradeCandidate {
                name: record.name.clone(),
                from_version: record.version.clone(),
                to_version: recipe.version.clone(),
                reason: UpgradeReason::Forced,
            });
        }
    }
    Ok(candidates)
}

fn levelize_candidates(
    index: &mut RecipeIndex,
    candidates: &[UpgradeCandidate],
) -> Result<(DependencyGraph, HashMap<String, PkgId>, Vec<Vec<String>>)> {
    let mut graph = DependencyGraph::new();
    let names: HashSet<String> = candidates.iter().map(|c| c.name.clone()).collect();
    let mut ids: HashMap<String, PkgId> = HashMap::new();
    for name in &names {
        ids.insert(name.clone(), graph.intern(name));
    }

    for name in &names {
        if let Some(recipe) = index.find(name)? {
            for dep in recipe.dependencies.build.iter().chain(recipe.dependencies.runtime.iter()) {
                if names.contains(&dep.name) {
                    graph.add_edge(ids[name], ids[&dep.name]);
                }
            }
        }
    }

    let all_ids: Vec<PkgId> = names.iter().map(|name| ids[name]).collect();
    let levels = graph
        .levelize(&all_ids)
        .iter()
        .map(|level| level.iter().map(|id| graph.name(*id).to_string()).collect())
        .collect();

    Ok((graph, ids, levels))
}

fn process_level(
    names: &[String],
    index: &mut RecipeIndex,
    db: &InstalledDb,
    cache: &ArtifactCache,
    history: &HistoryLog,
    hooks: &HookDispatcher,
    executor: &PrivilegedExecutor,
    config: &UpgradeConfig,
) -> Result<Vec<PackageOutcome>> {
    let mut recipes: HashMap<String, Recipe> = HashMap::new();
    for name in names {
        if let Some(recipe) = index.find(name)? {
            recipes.insert(name.clone(), recipe.clone());
        }
    }

    let concurrency = config.concurrency.max(1);
    let mut outcomes = Vec::new();

    for chunk in names.chunks(concurrency) {
        let chunk_results: Vec<PackageOutcome> = std::thread::scope(|scope| {
            let handles: Vec<_> = chunk
                .iter()
                .map(|name| {
                    let recipe = recipes.get(name).cloned();
                    let name = name.clone();
                    scope.spawn(move || match recipe {
                        Some(recipe) => upgrade_one(recipe, db, cache, history, hooks, executor, config),
                        None => PackageOutcome {
                            name,
                            success: false,
                            cache_hit: false,
                            error: Some("recipe no longer resolvable".to_string()),
                        },
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("upgrade worker panicked")).collect()
        });
        outcomes.extend(chunk_results);
    }

    Ok(outcomes)
}

fn upgrade_one(
    recipe: Recipe,
    db: &InstalledDb,
    cache: &ArtifactCache,
    history: &HistoryLog,
    hooks: &HookDispatcher,
    executor: &PrivilegedExecutor,
    config: &UpgradeConfig,
) -> PackageOutcome {
    let name = recipe.name.clone();

    let outcome: Result<bool> = (|| {
        // `run_pipeline` already probes the Artifact Cache before it sandboxes
        // a build, so there is nothing to gain by looking the cache up twice.
        let pipeline_config = BuildPipelineConfig {
            sandbox_base: config.sandbox_base.clone(),
            snapshot_dir: config.snapshot_dir.clone(),
            output_dir: config.build_output_dir.clone(),
            max_attempts: 1,
        };
        let build_result = quarry_build::run_pipeline(&recipe, &pipeline_config, cache, executor, hooks)?;
        let cache_hit = build_result.cache_hit;
        let archive_path = build_result.artifact_path.ok_or_else(|| crate::error::Error::Build {
            package: recipe.name.clone(),
            stage: "build".to_string(),
            cause: "pipeline reported success with no artifact path".to_string(),
        })?;

        let mut installer_config = config.installer.clone();
        installer_config.force = true;
        crate::installer::install(
            &archive_path.to_string_lossy(),
            &installer_config,
            db,
            history,
            hooks,
            executor,
        )?;

        Ok(cache_hit)
    })();

    match outcome {
        Ok(cache_hit) => PackageOutcome {
            name,
            success: true,
            cache_hit,
            error: None,
        },
        Err(e) => {
            let _ = hooks.dispatch("on_fail_pkg", &name, &[], executor, None);
            PackageOutcome {
                name,
                success: false,
                cache_hit: false,
                error: Some(e.to_string()),
            }
        }
    }
}

fn write_report(report: &UpgradeReport, report_dir: &std::path::Path) -> Result<()> {
    std::fs::create_dir_all(report_dir)?;
    let filename = format!("upgrade-{}.json", report.finished_at.format("%Y%m%dT%H%M%S%.f"));
    let path = report_dir.join(filename);
    std::fs::write(&path, serde_json::to_vec_pretty(report)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_store::InstalledRecord;
    use std::fs;
    use tempfile::tempdir;

    fn write_recipe(root: &std::path::Path, name: &str, version: &str, depends: &[&str]) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("Makefile"), "all:\n\t@true\ninstall:\n\t@true\n").unwrap();
        let deps: String = depends.iter().map(|d| format!("  - {d}\n")).collect();
        let body = if depends.is_empty() {
            format!("name: {name}\nversion: {version}\nmanifest_files:\n  - Makefile\n")
        } else {
            format!("name: {name}\nversion: {version}\ndepends:\n{deps}manifest_files:\n  - Makefile\n")
        };
        fs::write(dir.join("recipe.yaml"), body).unwrap();
    }

    #[test]
    fn detects_version_bump_as_candidate() {
        let recipes_root = tempdir().unwrap();
        write_recipe(recipes_root.path(), "lib", "1.1.0", &[]);

        let mut index = RecipeIndex::new(recipes_root.path());
        index.refresh(false).unwrap();

        let store_dir = tempdir().unwrap();
        let db = InstalledDb::load(store_dir.path().join("installed.json")).unwrap();
        db.put(InstalledRecord::new("lib", "1.0.0", vec![]));

        let config = UpgradeConfig::default();
        let candidates = detect_candidates(&mut index, &db, &config).unwrap();

        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name, "lib");
        assert_eq!(candidates[0].to_version, "1.1.0");
    }

    #[test]
    fn levelizes_candidate_subgraph() {
        let recipes_root = tempdir().unwrap();
        write_recipe(recipes_root.path(), "lib", "1.1.0", &[]);
        write_recipe(recipes_root.path(), "app", "2.0.0", &["lib"]);

        let mut index = RecipeIndex::new(recipes_root.path());
        index.refresh(false).unwrap();

        let candidates = vec![
            UpgradeCandidate {
                name: "lib".to_string(),
                from_version: "1.0.0".to_string(),
                to_version: "1.1.0".to_string(),
                reason: UpgradeReason::VersionUpdated {
                    old_version: "1.0.0".to_string(),
                    new_version: "1.1.0".to_string(),
                },
            },
            UpgradeCandidate {
                name: "app".to_string(),
                from_version: "1.0.0".to_string(),
                to_version: "2.0.0".to_string(),
                reason: UpgradeReason::VersionUpdated {
                    old_version: "1.0.0".to_string(),
                    new_version: "2.0.0".to_string(),
                },
            },
        ];

        let (_, _, levels) = levelize_candidates(&mut index, &candidates).unwrap();
        assert_eq!(levels, vec![vec!["lib".to_string()], vec!["app".to_string()]]);
    }
}
