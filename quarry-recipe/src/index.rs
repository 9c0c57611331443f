//! Recipe Index: directory scan, mtime-aware reload, and search.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use glob::glob;
use tracing::{debug, info};

use crate::cache_db::IndexCacheDb;
use crate::error::Result;
use crate::recipe::Recipe;

const RECIPE_FILENAMES: &[&str] = &["recipe.yaml", "recipe.yml", "recipe.json"];

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub recipe: Recipe,
    pub path: PathBuf,
    pub mtime: u64,
}

pub struct RecipeIndex {
    root: PathBuf,
    entries: HashMap<String, IndexEntry>,
    cache: Option<IndexCacheDb>,
}

impl RecipeIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            entries: HashMap::new(),
            cache: None,
        }
    }

    /// Attach a persisted mtime-keyed cache so repeated process starts avoid
    /// re-parsing every unchanged recipe.
    pub fn with_cache(mut self, cache: IndexCacheDb) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Scan `<root>/<name>/recipe.{yaml,yml,json}` and (re)populate the index.
    /// Unchanged entries (matching mtime) are served from the persisted
    /// cache when attached.
    pub fn refresh(&mut self, force: bool) -> Result<()> {
        if force {
            self.entries.clear();
        }

        let mut found_paths = Vec::new();
        for filename in RECIPE_FILENAMES {
            let pattern = format!("{}/*/{}", self.root.display(), filename);
            for entry in glob(&pattern)? {
                if let Ok(path) = entry {
                    found_paths.push(path);
                }
            }
        }

        for path in found_paths {
            let mtime = mtime_secs(&path);
            let name = package_name(&path);

            if !force {
                if let Some(existing) = self.entries.get(&name) {
                    if existing.mtime == mtime {
                        continue;
                    }
                }
            }

            if let Some(cache) = &self.cache {
                if let Some(mut cached) = cache.lookup(&name, mtime)? {
                    debug!(package = %name, "recipe index: cache hit");
                    // source_dir is #[serde(skip)], so it doesn't survive the
                    // JSON round-trip through the cache; restore it the same
                    // way Recipe::from_file does.
                    cached.source_dir = path
                        .parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| PathBuf::from("."));
                    self.entries.insert(
                        name.clone(),
                        IndexEntry {
                            recipe: cached,
                            path: path.clone(),
                            mtime,
                        },
                    );
                    continue;
                }
            }

            info!(package = %name, path = %path.display(), "recipe index: parsing");
            let recipe = Recipe::from_file(&path)?;
            if let Some(cache) = &self.cache {
                cache.store(&name, mtime, &recipe)?;
            }
            self.entries.insert(
                name.clone(),
                IndexEntry {
                    recipe,
                    path,
                    mtime,
                },
            );
        }

        Ok(())
    }

    pub fn list(&self) -> Vec<&Recipe> {
        self.entries.values().map(|e| &e.recipe).collect()
    }

    /// Look up a recipe, reparsing first if its source file's mtime has
    /// advanced since the last load.
    pub fn find(&mut self, name: &str) -> Result<Option<&Recipe>> {
        if let Some(entry) = self.entries.get(name) {
            let current_mtime = mtime_secs(&entry.path);
            if current_mtime != entry.mtime {
                let recipe = Recipe::from_file(&entry.path)?;
                if let Some(cache) = &self.cache {
                    cache.store(name, current_mtime, &recipe)?;
                }
                self.entries.insert(
                    name.to_string(),
                    IndexEntry {
                        recipe,
                        path: entry.path.clone(),
                        mtime: current_mtime,
                    },
                );
            }
        }
        Ok(self.entries.get(name).map(|e| &e.recipe))
    }

    /// Name-exact/substring/summary/keyword/fuzzy scoring, picking the
    /// maximum score per name and returning results ordered descending.
    pub fn search(&self, term: &str, fuzzy: bool) -> Vec<(&Recipe, f64)> {
        let term_lower = term.to_lowercase();
        let mut scored: Vec<(&Recipe, f64)> = Vec::new();

        for entry in self.entries.values() {
            let recipe = &entry.recipe;
            let mut score: f64 = 0.0;

            if recipe.name.eq_ignore_ascii_case(term) {
                score = score.max(1.0);
            }
            if recipe.name.to_lowercase().contains(&term_lower) {
                score = score.max(0.8);
            }
            if let Some(summary) = &recipe.summary {
                if summary.0.to_lowercase().contains(&term_lower) {
                    score = score.max(0.7);
                }
            }
            if recipe
                .keywords
                .iter()
                .any(|k| k.to_lowercase() == term_lower)
            {
                score = score.max(0.75);
            }
            if fuzzy && score == 0.0 && fuzzy_match(&recipe.name.to_lowercase(), &term_lower) {
                score = score.max(0.65);
            }

            if score > 0.0 {
                scored.push((recipe, score));
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
        scored
    }

    /// Names of every indexed recipe that declares `name` as a build or
    /// runtime dependency.
    pub fn reverse_dependencies(&self, name: &str) -> Vec<&str> {
        self.entries
            .values()
            .filter(|e| {
                e.recipe
                    .dependencies
                    .build
                    .iter()
                    .chain(e.recipe.dependencies.runtime.iter())
                    .any(|d| d.name == name)
            })
            .map(|e| e.recipe.name.as_str())
            .collect()
    }
}

fn mtime_secs(path: &Path) -> u64 {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn package_name(recipe_path: &Path) -> String {
    recipe_path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Cheap subsequence-based fuzzy match: every character of `term` appears in
/// `name`, in order, not necessarily contiguous.
fn fuzzy_match(name: &str, term: &str) -> bool {
    let mut chars = name.chars();
    term.chars().all(|c| chars.any(|n| n == c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_recipe(root: &Path, name: &str, version: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("recipe.yaml"),
            format!("name: {name}\nversion: {version}\n"),
        )
        .unwrap();
    }

    #[test]
    fn scans_and_lists() {
        let root = tempdir().unwrap();
        write_recipe(root.path(), "foo", "1.0.0");
        write_recipe(root.path(), "bar", "2.0.0");

        let mut index = RecipeIndex::new(root.path());
        index.refresh(false).unwrap();
        assert_eq!(index.list().len(), 2);
    }

    #[test]
    fn find_reparses_on_mtime_change() {
        let root = tempdir().unwrap();
        write_recipe(root.path(), "foo", "1.0.0");

        let mut index = RecipeIndex::new(root.path());
        index.refresh(false).unwrap();
        assert_eq!(index.find("foo").unwrap().unwrap().version, "1.0.0");

        std::thread::sleep(std::time::Duration::from_millis(1100));
        write_recipe(root.path(), "foo", "2.0.0");
        assert_eq!(index.find("foo").unwrap().unwrap().version, "2.0.0");
    }

    #[test]
    fn search_scoring() {
        let root = tempdir().unwrap();
        write_recipe(root.path(), "foobar", "1.0.0");
        let mut index = RecipeIndex::new(root.path());
        index.refresh(false).unwrap();

        let results = index.search("foobar", false);
        assert_eq!(results[0].1, 1.0);

        let results = index.search("foo", false);
        assert_eq!(results[0].1, 0.8);
    }

    #[test]
    fn reverse_dependencies() {
        let root = tempdir().unwrap();
        let dir = root.path().join("app");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("recipe.yaml"),
            "name: app\nversion: 1.0.0\ndepends:\n  - lib\n",
        )
        .unwrap();
        write_recipe(root.path(), "lib", "1.0.0");

        let mut index = RecipeIndex::new(root.path());
        index.refresh(false).unwrap();
        assert_eq!(index.reverse_dependencies("lib"), vec!["app"]);
    }
}
