//! quarry CLI — thin external wrapper over the build & install transaction
//! engine. Wires argv to `quarry-recipe`, `quarry-store`, `quarry-build`, and
//! `quarry-engine`; carries no engine behavior of its own. Every verb
//! defaults to a dry plan and only mutates state with `--execute`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;
use quarry::{init_logging, success, Config, LogLevel};
use quarry_build::{BuildPipelineConfig, HookDispatcher, PrivilegedExecutor};
use quarry_engine::{
    install as engine_install, remove as engine_remove, run_upgrade, DependencyMode, InstallerConfig,
    RemoverConfig, ResolveOptions, Resolver, UpgradeConfig,
};
use quarry_recipe::{IndexCacheDb, RecipeIndex};
use quarry_store::{ArtifactCache, HistoryLog, InstalledDb};
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
enum CliError {
    #[error("recipe error: {0}")]
    Recipe(#[from] quarry_recipe::Error),
    #[error("store error: {0}")]
    Store(#[from] quarry_store::Error),
    #[error("build error: {0}")]
    Build(#[from] quarry_build::Error),
    #[error("engine error: {0}")]
    Engine(#[from] quarry_engine::Error),
    #[error("config error: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

type CliResult<T> = std::result::Result<T, CliError>;

/// Source-based package build & install transaction engine.
#[derive(Parser)]
#[command(name = "quarry")]
#[command(about = "Build and install transaction engine for a source-based package manager", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to a `Config` YAML document; falls back to built-in defaults.
    #[arg(long, global = true)]
    conf: Option<PathBuf>,

    /// Log level for CLI output.
    #[arg(long, value_enum, default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build one or more packages (and their unbuilt dependencies), without installing them.
    Build(PackagesArgs),
    /// Install a built artifact (local path or http(s) URL) into the configured install root.
    Install(InstallArgs),
    /// Remove an installed package.
    Remove(PackageArgs),
    /// Upgrade installed packages whose recipe now declares a newer version.
    Upgrade(PackagesArgs),
    /// Rebuild a package, bypassing the artifact cache.
    Rebuild(PackageArgs),
    /// Rebuild every currently installed package from its recipe.
    RebuildSystem(ExecuteArgs),
    /// Search the recipe index.
    Search(SearchArgs),
    /// Show recipe and install-state details for one package.
    Info(PackageArgs),
    /// Print the append-only history log.
    History(HistoryArgs),
    /// Evict unreferenced artifacts from the cache and stale sandboxes.
    Deepclean(ExecuteArgs),
}

#[derive(Parser)]
struct PackagesArgs {
    /// Package names; omit to target every recipe in the index (build/upgrade) or every installed package (rebuild-system semantics via `upgrade --force`).
    packages: Vec<String>,
    #[command(flatten)]
    execute: ExecuteArgs,
    #[arg(long, default_value_t = 4)]
    concurrency: usize,
}

#[derive(Parser)]
struct PackageArgs {
    package: String,
    #[command(flatten)]
    execute: ExecuteArgs,
}

#[derive(Parser)]
struct InstallArgs {
    /// Local artifact path or an http(s):// URL.
    source: String,
    #[command(flatten)]
    execute: ExecuteArgs,
    #[arg(long)]
    allow_downgrade: bool,
}

#[derive(Parser)]
struct ExecuteArgs {
    /// Apply changes; default is a dry plan.
    #[arg(long)]
    execute: bool,
    #[arg(long)]
    force: bool,
}

#[derive(Parser)]
struct SearchArgs {
    term: String,
    #[arg(long)]
    fuzzy: bool,
}

#[derive(Parser)]
struct HistoryArgs {
    #[arg(long, default_value_t = 20)]
    limit: usize,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    let config = match load_config(cli.conf.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration: {e}");
            std::process::exit(2);
        }
    };

    let result = match cli.command {
        Commands::Build(args) => cmd_build(&config, &args),
        Commands::Install(args) => cmd_install(&config, &args),
        Commands::Remove(args) => cmd_remove(&config, &args),
        Commands::Upgrade(args) => cmd_upgrade(&config, &args, false),
        Commands::Rebuild(args) => cmd_rebuild(&config, &args),
        Commands::RebuildSystem(args) => cmd_rebuild_system(&config, &args),
        Commands::Search(args) => cmd_search(&config, &args),
        Commands::Info(args) => cmd_info(&config, &args),
        Commands::History(args) => cmd_history(&config, &args),
        Commands::Deepclean(args) => cmd_deepclean(&config, &args),
    };

    if let Err(e) = result {
        error!("{e}");
        std::process::exit(exit_code_for(&e));
    }
}

fn exit_code_for(e: &CliError) -> i32 {
    match e {
        CliError::Config(_) => 2,
        _ => 1,
    }
}

fn load_config(path: Option<&std::path::Path>) -> CliResult<Config> {
    match path {
        Some(path) => {
            let text = std::fs::read_to_string(path)?;
            Ok(Config::from_yaml(&text)?)
        }
        None => Ok(Config::default()),
    }
}

fn open_index(config: &Config) -> CliResult<RecipeIndex> {
    let cache = IndexCacheDb::open(&config.recipe_index_cache_path)?;
    let mut index = RecipeIndex::new(&config.recipes_root).with_cache(cache);
    index.refresh(false)?;
    Ok(index)
}

fn open_db(config: &Config) -> CliResult<InstalledDb> {
    Ok(InstalledDb::load(&config.installed_db_path)?)
}

fn open_history(config: &Config) -> HistoryLog {
    HistoryLog::open(&config.history_log_path)
}

fn open_cache(config: &Config) -> ArtifactCache {
    ArtifactCache::new(&config.artifact_cache_root)
}

fn open_hooks(config: &Config) -> HookDispatcher {
    HookDispatcher::new().with_global_hooks_path(&config.global_hooks_dir)
}

fn pipeline_config(config: &Config, retries: u32) -> BuildPipelineConfig {
    BuildPipelineConfig {
        sandbox_base: config.sandbox_root.clone(),
        snapshot_dir: config.snapshot_dir.clone(),
        output_dir: config.build_output_dir.clone(),
        max_attempts: retries.max(1),
    }
}

fn installer_config(config: &Config, force: bool, allow_downgrade: bool) -> InstallerConfig {
    InstallerConfig {
        install_root: config.install_root.clone(),
        backup_dir: config.backup_dir.clone(),
        allow_downgrade: allow_downgrade || config.allow_downgrade,
        force,
        backup: config.backup_on_install,
        signing_pubkey: None,
        actor: "quarry-cli".to_string(),
    }
}

/// Resolve `targets` (or every indexed recipe, if empty) into a leveled
/// plan and drive the Build Pipeline a level at a time, `concurrency`
/// packages in flight per level — the same level-barrier discipline
/// `quarry-engine::upgrade` uses for its own worker pool.
fn cmd_build(config: &Config, args: &PackagesArgs) -> CliResult<()> {
    let mut index = open_index(config)?;
    let targets = if args.packages.is_empty() {
        index.list().iter().map(|r| r.name.clone()).collect()
    } else {
        args.packages.clone()
    };

    let plan = {
        let mut resolver = Resolver::new(&mut index);
        resolver.resolve(&targets, &ResolveOptions::new(DependencyMode::Both))?
    };

    if let Some(cycle) = &plan.cycle {
        error!("dependency cycle detected: {}", cycle.join(" -> "));
    }
    if !plan.missing.is_empty() {
        error!("missing recipes: {}", plan.missing.join(", "));
    }

    info!(levels = plan.levels.len(), packages = plan.package_count(), "build: plan resolved");
    for (i, level) in plan.levels.iter().enumerate() {
        println!("level {i}: {}", level.join(", "));
    }

    if !args.execute.execute {
        println!("{}", "dry run: pass --execute to build these packages".yellow());
        return Ok(());
    }

    let cache = open_cache(config);
    let executor = PrivilegedExecutor::new();
    let hooks = open_hooks(config);
    let pipeline = pipeline_config(config, config.default_build_retries);

    for level in &plan.levels {
        let mut recipes = Vec::new();
        for name in level {
            if let Some(recipe) = index.find(name)? {
                recipes.push(recipe.clone());
            }
        }

        let concurrency = args.concurrency.max(1);
        for chunk in recipes.chunks(concurrency) {
            let outcomes: Vec<(String, CliResult<()>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|recipe| {
                        let recipe = recipe.clone();
                        let cache = &cache;
                        let executor = &executor;
                        let hooks = &hooks;
                        let pipeline = &pipeline;
                        scope.spawn(move || {
                            let name = recipe.name.clone();
                            let result = quarry_build::run_pipeline(&recipe, pipeline, cache, executor, hooks)
                                .map(|_| ())
                                .map_err(CliError::from);
                            (name, result)
                        })
                    })
                    .collect();
                handles.into_iter().map(|h| h.join().expect("build worker panicked")).collect()
            });

            for (name, outcome) in outcomes {
                match outcome {
                    Ok(()) => success(&format!("{name}: built")),
                    Err(e) => error!("{name}: {e}"),
                }
            }
        }
    }

    Ok(())
}

fn cmd_install(config: &Config, args: &InstallArgs) -> CliResult<()> {
    if !args.execute.execute {
        println!(
            "would install {} into {} (pass --execute to apply)",
            args.source,
            config.install_root.display()
        );
        return Ok(());
    }

    let db = open_db(config)?;
    let history = open_history(config);
    let hooks = open_hooks(config);
    let executor = PrivilegedExecutor::new();
    let installer_config = installer_config(config, args.execute.force, args.allow_downgrade);

    let record = engine_install(&args.source, &installer_config, &db, &history, &hooks, &executor)?;
    success(&format!("installed {} {}", record.name, record.version));
    Ok(())
}

fn cmd_remove(config: &Config, args: &PackageArgs) -> CliResult<()> {
    if !args.execute.execute {
        println!("would remove {} (pass --execute to apply)", args.package);
        return Ok(());
    }

    let db = open_db(config)?;
    let history = open_history(config);
    let hooks = open_hooks(config);
    let executor = PrivilegedExecutor::new();
    let remover_config = RemoverConfig {
        install_root: config.install_root.clone(),
        backup_dir: config.backup_dir.clone(),
        force: args.execute.force,
        backup: config.backup_on_install,
        actor: "quarry-cli".to_string(),
    };

    let record = engine_remove(&args.package, &remover_config, &db, &history, &hooks, &executor)?;
    success(&format!("removed {} {}", record.name, record.version));
    Ok(())
}

fn cmd_upgrade(config: &Config, args: &PackagesArgs, force_all: bool) -> CliResult<()> {
    let mut index = open_index(config)?;
    let db = open_db(config)?;
    let cache = open_cache(config);
    let history = open_history(config);
    let hooks = open_hooks(config);
    let executor = PrivilegedExecutor::new();

    let force = if force_all {
        db.list().into_iter().map(|r| r.name).collect()
    } else if args.execute.force {
        args.packages.clone()
    } else {
        Vec::new()
    };

    let upgrade_config = UpgradeConfig {
        concurrency: args.concurrency.max(1),
        force,
        report_dir: config.report_dir.clone(),
        sandbox_base: config.sandbox_root.clone(),
        snapshot_dir: config.snapshot_dir.clone(),
        build_output_dir: config.build_output_dir.clone(),
        installer: installer_config(config, true, config.allow_downgrade),
    };

    if !args.execute.execute {
        println!("{}", "dry run: pass --execute to upgrade candidates".yellow());
    }

    let report = run_upgrade(&mut index, &db, &cache, &history, &hooks, &executor, &upgrade_config)?;
    println!(
        "candidates: {}, succeeded: {}, failed: {}",
        report.candidates.len(),
        report.results.iter().filter(|r| r.success).count(),
        report.results.iter().filter(|r| !r.success).count(),
    );
    for outcome in &report.results {
        if outcome.success {
            success(&format!("{}: upgraded", outcome.name));
        } else if let Some(cause) = &outcome.error {
            error!("{}: {cause}", outcome.name);
        }
    }
    Ok(())
}

fn cmd_rebuild(config: &Config, args: &PackageArgs) -> CliResult<()> {
    let mut index = open_index(config)?;
    let Some(recipe) = index.find(&args.package)?.cloned() else {
        return Err(CliError::Other(format!("no such recipe: {}", args.package)));
    };

    if !args.execute.execute {
        println!("would rebuild {} bypassing the artifact cache (pass --execute to apply)", recipe.name);
        return Ok(());
    }

    let fp = quarry_recipe::fingerprint(&recipe)?;
    let cache = open_cache(config);
    // Evicting the specific entry before building forces a miss; the
    // pipeline is otherwise cache-probe-first.
    let _ = std::fs::remove_file(config.artifact_cache_root.join(format!("{}-{fp}.tar.gz", recipe.name)));
    let _ = std::fs::remove_file(config.artifact_cache_root.join(format!("{}-{fp}.json", recipe.name)));

    let executor = PrivilegedExecutor::new();
    let hooks = open_hooks(config);
    let pipeline = pipeline_config(config, config.default_build_retries);
    let result = quarry_build::run_pipeline(&recipe, &pipeline, &cache, &executor, &hooks)?;
    success(&format!("{}: rebuilt (fingerprint {})", recipe.name, result.fingerprint));
    Ok(())
}

fn cmd_rebuild_system(config: &Config, args: &ExecuteArgs) -> CliResult<()> {
    let packages = PackagesArgs {
        packages: Vec::new(),
        execute: ExecuteArgs {
            execute: args.execute,
            force: true,
        },
        concurrency: config.worker_count,
    };
    cmd_upgrade(config, &packages, true)
}

fn cmd_search(config: &Config, args: &SearchArgs) -> CliResult<()> {
    let index = open_index(config)?;
    let results = index.search(&args.term, args.fuzzy);
    if results.is_empty() {
        println!("no matches for {:?}", args.term);
        return Ok(());
    }
    for (recipe, score) in results {
        let summary = recipe.summary.as_ref().map(|s| s.0.as_str()).unwrap_or("");
        println!("{:<24} {:<10} {:.2}  {}", recipe.name, recipe.version, score, summary);
    }
    Ok(())
}

fn cmd_info(config: &Config, args: &PackageArgs) -> CliResult<()> {
    let mut index = open_index(config)?;
    let db = open_db(config)?;

    match index.find(&args.package)? {
        Some(recipe) => {
            println!("name: {}", recipe.name);
            println!("version: {}", recipe.version);
            println!("build_system: {:?}", recipe.auto_detect_build_system());
            println!(
                "build deps: {}",
                recipe.dependencies.build.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
            );
            println!(
                "runtime deps: {}",
                recipe.dependencies.runtime.iter().map(|d| d.name.as_str()).collect::<Vec<_>>().join(", ")
            );
        }
        None => println!("no recipe found for {}", args.package),
    }

    match db.get(&args.package) {
        Some(record) => println!("installed: {} ({} files)", record.version, record.files.len()),
        None => println!("installed: no"),
    }
    Ok(())
}

fn cmd_history(config: &Config, args: &HistoryArgs) -> CliResult<()> {
    let history = open_history(config);
    let events = history.read_all()?;
    for event in events.iter().rev().take(args.limit) {
        println!(
            "{} {:<8} {:?} {:<16} {}",
            event.timestamp.format("%Y-%m-%dT%H:%M:%SZ"),
            event.result,
            event.action,
            event.package,
            event.actor
        );
    }
    Ok(())
}

/// Evict artifact cache entries and per-package sandboxes that neither the
/// recipe index nor the Installed Database reference any more, wrapped in
/// `pre_deepclean`/`post_deepclean` hooks the way the original `deepclean`
/// sweep wraps its cache/orphan/sandbox pass.
fn cmd_deepclean(config: &Config, args: &ExecuteArgs) -> CliResult<()> {
    let db = open_db(config)?;
    let index = open_index(config)?;
    let hooks = open_hooks(config);
    let executor = PrivilegedExecutor::new();

    let mut live_names: std::collections::HashSet<String> = db.list().into_iter().map(|r| r.name).collect();
    live_names.extend(index.list().iter().map(|r| r.name.clone()));

    hooks.dispatch("pre_deepclean", "deepclean", &[], &executor, None)?;

    let mut stale_cache = Vec::new();
    if config.artifact_cache_root.exists() {
        for entry in std::fs::read_dir(&config.artifact_cache_root)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(name) = stem.split('-').next() else {
                continue;
            };
            if !live_names.contains(name) {
                stale_cache.push(path);
            }
        }
    }

    let mut stale_sandboxes = Vec::new();
    if config.sandbox_root.exists() {
        for entry in std::fs::read_dir(&config.sandbox_root)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !live_names.contains(name) {
                stale_sandboxes.push(path);
            }
        }
    }

    if stale_cache.is_empty() && stale_sandboxes.is_empty() {
        println!("nothing to clean");
        hooks.dispatch("post_deepclean", "deepclean", &[], &executor, None)?;
        return Ok(());
    }

    if !args.execute {
        println!(
            "{} stale cache entries and {} stale sandboxes would be removed (pass --execute to apply)",
            stale_cache.len(),
            stale_sandboxes.len()
        );
        for path in stale_cache.iter().chain(stale_sandboxes.iter()) {
            println!("  {}", path.display());
        }
        hooks.dispatch("post_deepclean", "deepclean", &[], &executor, None)?;
        return Ok(());
    }

    for path in &stale_cache {
        let _ = std::fs::remove_file(path);
    }
    for path in &stale_sandboxes {
        let _ = std::fs::remove_dir_all(path);
    }
    success(&format!(
        "deepclean: removed {} stale cache entries and {} stale sandboxes",
        stale_cache.len(),
        stale_sandboxes.len()
    ));

    hooks.dispatch("post_deepclean", "deepclean", &[], &executor, None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_maps_config_errors_to_two() {
        let e = CliError::Other("boom".to_string());
        assert_eq!(exit_code_for(&e), 1);
    }
}
