//! Resolver & Scheduler: walk a recipe index from a set of target
//! names to a leveled build plan, flagging missing recipes, unsatisfied
//! version constraints, and dependency cycles along the way.

use std::collections::{HashSet, VecDeque};

use quarry_recipe::{Dependency, RecipeIndex};
use regex::Regex;

use crate::error::{Error, Result};
use crate::graph::{DependencyGraph, PkgId};

/// Which edges of a recipe's `dependencies` map to walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyMode {
    Build,
    Runtime,
    Both,
}

#[derive(Debug, Default, Clone)]
pub struct ResolveOptions {
    pub mode_runtime: bool,
    pub mode_build: bool,
    pub include: Option<Regex>,
    pub exclude: Option<Regex>,
}

impl ResolveOptions {
    pub fn new(mode: DependencyMode) -> Self {
        Self {
            mode_runtime: matches!(mode, DependencyMode::Runtime | DependencyMode::Both),
            mode_build: matches!(mode, DependencyMode::Build | DependencyMode::Both),
            include: None,
            exclude: None,
        }
    }

    pub fn with_include(mut self, pattern: Regex) -> Self {
        self.include = Some(pattern);
        self
    }

    pub fn with_exclude(mut self, pattern: Regex) -> Self {
        self.exclude = Some(pattern);
        self
    }

    fn passes_filters(&self, name: &str) -> bool {
        if let Some(include) = &self.include {
            if !include.is_match(name) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        true
    }
}

impl Default for DependencyMode {
    fn default() -> Self {
        DependencyMode::Both
    }
}

/// The resolved, leveled build plan: each inner `Vec` is a level, workable
/// in parallel, and every dependency of a package in level `k` lives in a
/// strictly earlier level.
#[derive(Debug, Clone)]
pub struct Plan {
    pub levels: Vec<Vec<String>>,
    pub missing: Vec<String>,
    pub cycle: Option<Vec<String>>,
}

impl Plan {
    pub fn package_count(&self) -> usize {
        self.levels.iter().map(Vec::len).sum()
    }
}

pub struct Resolver<'a> {
    index: &'a mut RecipeIndex,
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a mut RecipeIndex) -> Self {
        Self { index }
    }

    /// Resolve the transitive closure of `targets`, applying `options`'
    /// dependency-mode and include/exclude filters.
    ///
    /// Missing recipes are collected rather than aborting resolution
    /// outright, since a missing recipe is a single-package concern; a
    /// version constraint that the resolved recipe can't satisfy is a hard
    /// error, since the caller cannot make progress without knowing which
    /// version to use.
    pub fn resolve(&mut self, targets: &[String], options: &ResolveOptions) -> Result<Plan> {
        let mut graph = DependencyGraph::new();
        let mut missing = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = targets.iter().cloned().collect();

        for target in targets {
            graph.intern(target);
        }

        while let Some(name) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let id = graph.intern(&name);

            let recipe = match self.index.find(&name)? {
                Some(recipe) => recipe.clone(),
                None => {
                    graph.mark_missing(id);
                    missing.push(name);
                    continue;
                }
            };

            for dep in dependencies_for(&recipe.dependencies, options) {
                if !options.passes_filters(&dep.name) {
                    continue;
                }

                if let Some(constraint) = &dep.constraint {
                    if let Some(dep_recipe) = self.index.find(&dep.name)? {
                        if !constraint.matches(&dep_recipe.version) {
                            return Err(Error::UnsatisfiedConstraint {
                                package: recipe.name.clone(),
                                constraint: format!(
                                    "{} {}{}",
                                    dep.name, constraint.op, constraint.version
                                ),
                                found: dep_recipe.version.clone(),
                            });
                        }
                    }
                }

                let dep_id = graph.intern(&dep.name);
                graph.add_edge(id, dep_id);
                if !visited.contains(&dep.name) {
                    queue.push_back(dep.name.clone());
                }
            }
        }

        let all_nodes: Vec<PkgId> = graph.node_ids().collect();
        let cycle = graph
            .find_cycle(&all_nodes)
            .map(|ids| ids.iter().map(|id| graph.name(*id).to_string()).collect());

        let levels: Vec<Vec<String>> = graph
            .levelize(&all_nodes)
            .iter()
            .map(|level| level.iter().map(|id| graph.name(*id).to_string()).collect())
            .collect();

        Ok(Plan {
            levels,
            missing,
            cycle,
        })
    }
}

fn dependencies_for<'a>(
    deps: &'a quarry_recipe::Dependencies,
    options: &ResolveOptions,
) -> Vec<&'a Dependency> {
    let mut out = Vec::new();
    if options.mode_build {
        out.extend(deps.build.iter());
    }
    if options.mode_runtime {
        out.extend(deps.runtime.iter());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_recipe::RecipeIndex;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_recipe(root: &Path, name: &str, version: &str, depends: &[&str]) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        let deps = depends
            .iter()
            .map(|d| format!("  - {d}\n"))
            .collect::<String>();
        let body = if depends.is_empty() {
            format!("name: {name}\nversion: {version}\n")
        } else {
            format!("name: {name}\nversion: {version}\ndepends:\n{deps}")
        };
        std::fs::write(dir.join("recipe.yaml"), body).unwrap();
    }

    #[test]
    fn orders_a_b_c_chain() {
        let root = tempdir().unwrap();
        write_recipe(root.path(), "c", "1.0.0", &[]);
        write_recipe(root.path(), "b", "1.0.0", &["c"]);
        write_recipe(root.path(), "a", "1.0.0", &["b"]);

        let mut index = RecipeIndex::new(root.path());
        index.refresh(false).unwrap();

        let mut resolver = Resolver::new(&mut index);
        let options = ResolveOptions::new(DependencyMode::Both);
        let plan = resolver
            .resolve(&["a".to_string()], &options)
            .unwrap();

        assert_eq!(plan.levels, vec![vec!["c"], vec!["b"], vec!["a"]]);
        assert!(plan.missing.is_empty());
        assert!(plan.cycle.is_none());
    }

    #[test]
    fn surfaces_cycle_as_single_level() {
        let root = tempdir().unwrap();
        write_recipe(root.path(), "a", "1.0.0", &["b"]);
        write_recipe(root.path(), "b", "1.0.0", &["a"]);

        let mut index = RecipeIndex::new(root.path());
        index.refresh(false).unwrap();

        let mut resolver = Resolver::new(&mut index);
        let options = ResolveOptions::new(DependencyMode::Both);
        let plan = resolver
            .resolve(&["a".to_string()], &options)
            .unwrap();

        assert!(plan.cycle.is_some());
        assert_eq!(plan.levels.len(), 1);
        assert_eq!(plan.levels[0].len(), 2);
    }

    #[test]
    fn flags_missing_recipe() {
        let root = tempdir().unwrap();
        write_recipe(root.path(), "app", "1.0.0", &["ghost"]);

        let mut index = RecipeIndex::new(root.path());
        index.refresh(false).unwrap();

        let mut resolver = Resolver::new(&mut index);
        let options = ResolveOptions::new(DependencyMode::Both);
        let plan = resolver
            .resolve(&["app".to_string()], &options)
            .unwrap();

        assert_eq!(plan.missing, vec!["ghost".to_string()]);
    }
}
