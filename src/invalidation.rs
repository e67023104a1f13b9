//! Cascading invalidation over the reverse dependency graph.
//!
//! When an answer changes, every transitive dependent's cached score and
//! explanation is stale. The walk collects the reverse closure; the caller
//! clears results for each collected id in one state transition.

use std::collections::HashSet;

use tracing::warn;

use crate::graph::DependencyGraph;

/// Default bound on traversal depth. The visited set already guards against
/// cycles; the depth bound is a second net for malformed graphs.
pub const DEFAULT_MAX_DEPTH: usize = 10;

/// Collect the transitive set of dependents of `changed_id`.
///
/// The changed question itself is not part of the result. A node already on
/// the current path is skipped with a warning rather than revisited, so a
/// cyclic graph terminates; nodes deeper than `max_depth` are dropped with a
/// warning.
pub fn invalidation_set(
    changed_id: &str,
    graph: &DependencyGraph,
    max_depth: usize,
) -> HashSet<String> {
    let mut collected = HashSet::new();
    let mut path: Vec<&str> = vec![changed_id];
    walk(changed_id, graph, max_depth, 0, &mut path, &mut collected);
    collected
}

fn walk<'g>(
    node: &'g str,
    graph: &'g DependencyGraph,
    max_depth: usize,
    depth: usize,
    path: &mut Vec<&'g str>,
    collected: &mut HashSet<String>,
) {
    if depth >= max_depth {
        warn!(node, max_depth, "Invalidation depth limit reached; dropping deeper dependents");
        return;
    }

    for dependent in graph.dependents(node) {
        if path.iter().any(|p| *p == dependent.as_str()) {
            warn!(
                dependent = dependent.as_str(),
                "Cycle encountered during invalidation; skipping revisit"
            );
            continue;
        }
        collected.insert(dependent.clone());
        path.push(dependent);
        walk(dependent, graph, max_depth, depth + 1, path, collected);
        path.pop();
    }
}
