//! The engine's dependency graph and cycle detection.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::key::Fingerprint;

/// Directed edges from requester to requested key.
///
/// `insert_edge` atomically checks whether the new edge would close a loop
/// and reports the full cycle before the edge is recorded, so a cyclic
/// request is rejected before its evaluation is ever dispatched.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    edges: Mutex<HashMap<Fingerprint, HashSet<Fingerprint>>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `parent` requested `child`.
    ///
    /// On success returns `Ok(())`. If a path from `child` back to `parent`
    /// already exists, returns the keys on the would-be cycle in request
    /// order, starting and ending with `parent`.
    pub fn insert_edge(
        &self,
        parent: Fingerprint,
        child: Fingerprint,
    ) -> Result<(), Vec<Fingerprint>> {
        let mut edges = self.edges.lock().expect("dependency graph lock poisoned");
        if let Some(path) = Self::find_path(&edges, child, parent) {
            // path runs child -> ... -> parent; prepending parent yields the
            // cycle in request order.
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(parent);
            cycle.extend(path);
            return Err(cycle);
        }
        edges.entry(parent).or_default().insert(child);
        Ok(())
    }

    /// Depth-first search for a path from `from` to `to` along request
    /// edges. Returns the node sequence including both endpoints.
    fn find_path(
        edges: &HashMap<Fingerprint, HashSet<Fingerprint>>,
        from: Fingerprint,
        to: Fingerprint,
    ) -> Option<Vec<Fingerprint>> {
        let mut visited = HashSet::new();
        let mut path = Vec::new();
        if Self::visit(edges, from, to, &mut visited, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    fn visit(
        edges: &HashMap<Fingerprint, HashSet<Fingerprint>>,
        node: Fingerprint,
        target: Fingerprint,
        visited: &mut HashSet<Fingerprint>,
        path: &mut Vec<Fingerprint>,
    ) -> bool {
        if !visited.insert(node) {
            return false;
        }
        path.push(node);
        if node == target {
            return true;
        }
        if let Some(next) = edges.get(&node) {
            for &child in next {
                if Self::visit(edges, child, target, visited, path) {
                    return true;
                }
            }
        }
        path.pop();
        false
    }

    /// Number of recorded requester nodes.
    pub fn len(&self) -> usize {
        self.edges.lock().expect("dependency graph lock poisoned").len()
    }

    /// Whether no edges are recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
