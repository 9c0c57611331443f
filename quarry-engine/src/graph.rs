//! Dependency graph: packages interned to small integer IDs over an
//! adjacency-list DAG, simplified to the one operation this engine needs:
//! level-at-a-time topological peeling.

use std::collections::{HashMap, HashSet};

/// Interned package identifier, cheap to copy and use as a map key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PkgId(pub u32);

#[derive(Debug, Default)]
pub struct DependencyGraph {
    names: Vec<String>,
    ids: HashMap<String, PkgId>,
    /// node -> the nodes it depends on (edge direction: dependent -> dependency).
    edges: HashMap<PkgId, Vec<PkgId>>,
    missing: HashSet<PkgId>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `name`, returning its existing ID if already known.
    pub fn intern(&mut self, name: &str) -> PkgId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = PkgId(self.names.len() as u32);
        self.names.push(name.to_string());
        self.ids.insert(name.to_string(), id);
        self.edges.entry(id).or_default();
        id
    }

    pub fn name(&self, id: PkgId) -> &str {
        &self.names[id.0 as usize]
    }

    pub fn mark_missing(&mut self, id: PkgId) {
        self.missing.insert(id);
    }

    pub fn is_missing(&self, id: PkgId) -> bool {
        self.missing.contains(&id)
    }

    pub fn add_edge(&mut self, dependent: PkgId, dependency: PkgId) {
        let edges = self.edges.entry(dependent).or_default();
        if !edges.contains(&dependency) {
            edges.push(dependency);
        }
    }

    pub fn dependencies(&self, id: PkgId) -> &[PkgId] {
        self.edges.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_ids(&self) -> impl Iterator<Item = PkgId> + '_ {
        (0..self.names.len() as u32).map(PkgId)
    }

    /// DFS cycle search over `roots`. Returns the first cycle found, as the
    /// sequence of node names that form it, or `None` if the subgraph
    /// reachable from `roots` is acyclic.
    pub fn find_cycle(&self, roots: &[PkgId]) -> Option<Vec<PkgId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: HashMap<PkgId, Color> = HashMap::new();
        let mut stack: Vec<PkgId> = Vec::new();

        fn visit(
            node: PkgId,
            graph: &DependencyGraph,
            color: &mut HashMap<PkgId, Color>,
            stack: &mut Vec<PkgId>,
        ) -> Option<Vec<PkgId>> {
            color.insert(node, Color::Gray);
            stack.push(node);

            for &dep in graph.dependencies(node) {
                match color.get(&dep).copied().unwrap_or(Color::White) {
                    Color::White => {
                        if let Some(cycle) = visit(dep, graph, color, stack) {
                            return Some(cycle);
                        }
                    }
                    Color::Gray => {
                        let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<PkgId> = stack[start..].to_vec();
                        cycle.push(dep);
                        return Some(cycle);
                    }
                    Color::Black => {}
                }
            }

            stack.pop();
            color.insert(node, Color::Black);
            None
        }

        for &root in roots {
            if color.get(&root).copied().unwrap_or(Color::White) == Color::White {
                if let Some(cycle) = visit(root, self, &mut color, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Kahn-style repeated peel of `nodes` into levels: a level contains
    /// every node whose dependencies (restricted to `nodes`) have all
    /// already been placed in an earlier level. Ties within a level are
    /// broken by lexicographic name for determinism. If no node is ready
    /// (a cycle among the remainder), the whole remainder is emitted as one
    /// level rather than silently dropping edges.
    pub fn levelize(&self, nodes: &[PkgId]) -> Vec<Vec<PkgId>> {
        let node_set: HashSet<PkgId> = nodes.iter().copied().collect();
        let mut remaining: HashSet<PkgId> = node_set.clone();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let mut ready: Vec<PkgId> = remaining
                .iter()
                .copied()
                .filter(|id| {
                    self.dependencies(*id)
                        .iter()
                        .filter(|dep| node_set.contains(dep))
                        .all(|dep| !remaining.contains(dep))
                })
                .collect();

            if ready.is_empty() {
                ready = remaining.iter().copied().collect();
            }

            ready.sort_by(|a, b| self.name(*a).cmp(self.name(*b)));
            for id in &ready {
                remaining.remove(id);
            }
            levels.push(ready);
        }

        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levelize_orders_dependencies_first() {
        let mut graph = DependencyGraph::new();
        let a = graph.intern("a");
        let b = graph.intern("b");
        let c = graph.intern("c");
        graph.add_edge(a, b);
        graph.add_edge(b, c);

        let levels = graph.levelize(&[a, b, c]);
        let names: Vec<Vec<&str>> = levels
            .iter()
            .map(|level| level.iter().map(|id| graph.name(*id)).collect())
            .collect();
        assert_eq!(names, vec![vec!["c"], vec!["b"], vec!["a"]]);
    }

    #[test]
    fn levelize_breaks_ties_lexicographically() {
        let mut graph = DependencyGraph::new();
        let z = graph.intern("z");
        let a = graph.intern("a");
        let m = graph.intern("m");

        let levels = graph.levelize(&[z, a, m]);
        assert_eq!(levels.len(), 1);
        let names: Vec<&str> = levels[0].iter().map(|id| graph.name(*id)).collect();
        assert_eq!(names, vec!["a", "m", "z"]);
    }

    #[test]
    fn cycle_detected_and_surfaced_as_one_level() {
        let mut graph = DependencyGraph::new();
        let a = graph.intern("a");
        let b = graph.intern("b");
        graph.add_edge(a, b);
        graph.add_edge(b, a);

        assert!(graph.find_cycle(&[a, b]).is_some());

        let levels = graph.levelize(&[a, b]);
        assert_eq!(levels.len(), 1);
        assert_eq!(levels[0].len(), 2);
    }
}
