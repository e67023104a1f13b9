//! Dependency graph construction and validation.
//!
//! The graph is derived once from the loaded question set: forward adjacency
//! maps a question to the ids its scoring context depends on, reverse
//! adjacency maps a question to its dependents. Validation runs at load time
//! and reports problems without making the session unusable; questions caught
//! in a cycle or behind a missing reference simply never become fully
//! answered.

use std::collections::{HashMap, HashSet, VecDeque};

use serde::Serialize;
use tracing::warn;

use crate::question::{Question, QuestionSet, QuestionType};

/// Warn when the longest dependency chain exceeds this many links.
const DEPTH_WARNING_THRESHOLD: usize = 6;

/// Forward and reverse adjacency over question ids.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// Authoring order of all question ids.
    order: Vec<String>,
    /// question id -> ids it depends on (answer + meta), authoring order kept.
    forward: HashMap<String, Vec<String>>,
    /// question id -> ids that depend on it.
    reverse: HashMap<String, Vec<String>>,
    /// Ids that exist in the question set.
    known: HashSet<String>,
}

impl DependencyGraph {
    /// Build adjacency from the question list. `internal`-typed questions are
    /// indexed by id but contribute no edges in either direction.
    pub fn build(questions: &[Question]) -> Self {
        let mut graph = DependencyGraph::default();
        let internal: HashSet<&str> = questions
            .iter()
            .filter(|q| q.question_type == QuestionType::Internal)
            .map(|q| q.id.as_str())
            .collect();

        for q in questions {
            graph.order.push(q.id.clone());
            graph.known.insert(q.id.clone());
            graph.forward.entry(q.id.clone()).or_default();
            graph.reverse.entry(q.id.clone()).or_default();
        }

        for q in questions {
            if internal.contains(q.id.as_str()) {
                continue;
            }
            let deps: Vec<&str> = q
                .answer_dependencies()
                .chain(q.meta_dependencies())
                .filter(|dep| !internal.contains(dep))
                .collect();
            for dep in deps {
                let fwd = graph.forward.entry(q.id.clone()).or_default();
                if !fwd.iter().any(|d| d == dep) {
                    fwd.push(dep.to_string());
                }
                let rev = graph.reverse.entry(dep.to_string()).or_default();
                if !rev.iter().any(|d| d == q.id.as_str()) {
                    rev.push(q.id.clone());
                }
            }
        }

        graph
    }

    pub fn contains(&self, id: &str) -> bool {
        self.known.contains(id)
    }

    /// Ids this question depends on. Missing references are kept so callers
    /// treat them as permanently unsatisfied.
    pub fn dependencies(&self, id: &str) -> &[String] {
        self.forward.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ids that directly depend on this question.
    pub fn dependents(&self, id: &str) -> &[String] {
        self.reverse.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn ids(&self) -> &[String] {
        &self.order
    }
}

// =============================================================================
// Validation
// =============================================================================

/// Aggregate statistics from a validation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphStats {
    pub total_questions: usize,
    pub questions_with_deps: usize,
    pub missing_references: Vec<String>,
    pub forward_references: usize,
    pub circular_dependencies: Vec<Vec<String>>,
    pub max_depth: usize,
}

/// Result of validating a dependency graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub stats: GraphStats,
    /// Kahn order over the forward graph; `None` when a cycle prevents a
    /// complete sort.
    pub topo_order: Option<Vec<String>>,
    /// Dependency level per question: 0 for roots, 1 + max(level of deps)
    /// otherwise. Cyclic questions are absent.
    pub levels: HashMap<String, usize>,
}

impl GraphReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Ids that sit on at least one reported cycle.
    pub fn cyclic_ids(&self) -> HashSet<String> {
        self.stats
            .circular_dependencies
            .iter()
            .flatten()
            .cloned()
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Unvisited,
    Visiting,
    Done,
}

/// Run every validation check over the graph. Checks are independent; all of
/// them always run.
pub fn validate(set: &QuestionSet, graph: &DependencyGraph) -> GraphReport {
    let mut report = GraphReport::default();
    report.stats.total_questions = set.questions.len();
    report.stats.questions_with_deps = set
        .questions
        .iter()
        .filter(|q| !graph.dependencies(&q.id).is_empty())
        .count();

    check_missing_references(graph, &mut report);
    check_forward_references(set, graph, &mut report);
    detect_cycles(graph, &mut report);
    topological_sort(graph, &mut report);
    let cyclic = report.cyclic_ids();
    compute_depths(graph, &cyclic, &mut report);

    if !report.is_valid() {
        warn!(
            errors = report.errors.len(),
            cycles = report.stats.circular_dependencies.len(),
            "Question set has configuration errors"
        );
    }

    report
}

fn check_missing_references(graph: &DependencyGraph, report: &mut GraphReport) {
    for id in graph.ids() {
        for dep in graph.dependencies(id) {
            if !graph.contains(dep) {
                report
                    .errors
                    .push(format!("{id} references unknown question {dep}"));
                report.stats.missing_references.push(dep.clone());
            }
        }
    }
}

fn check_forward_references(set: &QuestionSet, graph: &DependencyGraph, report: &mut GraphReport) {
    for (pos, id) in graph.ids().iter().enumerate() {
        for dep in graph.dependencies(id) {
            if let Some(dep_pos) = set.position(dep) {
                if dep_pos > pos {
                    report.stats.forward_references += 1;
                    report.warnings.push(format!(
                        "{id} depends on {dep}, which appears later in authoring order"
                    ));
                }
            }
        }
    }
}

/// Depth-first traversal over the reverse graph with an explicit visit-state
/// table; every back-edge yields the full cycle path.
fn detect_cycles(graph: &DependencyGraph, report: &mut GraphReport) {
    let mut state: HashMap<&str, Visit> = graph
        .ids()
        .iter()
        .map(|id| (id.as_str(), Visit::Unvisited))
        .collect();
    let mut seen_cycles: HashSet<Vec<String>> = HashSet::new();

    for start in graph.ids() {
        if state[start.as_str()] != Visit::Unvisited {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        dfs_cycles(graph, start, &mut state, &mut path, &mut seen_cycles, report);
    }
}

fn dfs_cycles<'g>(
    graph: &'g DependencyGraph,
    node: &'g str,
    state: &mut HashMap<&'g str, Visit>,
    path: &mut Vec<&'g str>,
    seen: &mut HashSet<Vec<String>>,
    report: &mut GraphReport,
) {
    state.insert(node, Visit::Visiting);
    path.push(node);

    for next in graph.dependents(node) {
        match state.get(next.as_str()).copied().unwrap_or(Visit::Done) {
            Visit::Unvisited => dfs_cycles(graph, next, state, path, seen, report),
            Visit::Visiting => {
                let from = path.iter().position(|n| *n == next.as_str()).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[from..].iter().map(|n| n.to_string()).collect();
                cycle.push(next.to_string());
                // The walk follows dependent edges; flip so the arrows read
                // "depends on".
                cycle.reverse();
                // Rotations of the same cycle all canonicalize to one key.
                if seen.insert(canonical_cycle(&cycle)) {
                    report
                        .errors
                        .push(format!("circular dependency: {}", cycle.join(" -> ")));
                    report.stats.circular_dependencies.push(cycle);
                }
            }
            Visit::Done => {}
        }
    }

    path.pop();
    state.insert(node, Visit::Done);
}

fn canonical_cycle(cycle: &[String]) -> Vec<String> {
    // Drop the repeated closing node, rotate so the smallest id leads.
    let body = &cycle[..cycle.len() - 1];
    let min = body
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    body[min..].iter().chain(body[..min].iter()).cloned().collect()
}

/// Kahn's algorithm over in-degrees derived from the forward graph. Ready
/// nodes are taken in authoring order so the output is deterministic.
fn topological_sort(graph: &DependencyGraph, report: &mut GraphReport) {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    for id in graph.ids() {
        let degree = graph
            .dependencies(id)
            .iter()
            .filter(|dep| graph.contains(dep))
            .count();
        in_degree.insert(id.as_str(), degree);
    }

    let mut queue: VecDeque<&str> = graph
        .ids()
        .iter()
        .filter(|id| in_degree[id.as_str()] == 0)
        .map(String::as_str)
        .collect();
    let mut sorted: Vec<String> = Vec::with_capacity(graph.ids().len());

    while let Some(node) = queue.pop_front() {
        sorted.push(node.to_string());
        for dependent in graph.dependents(node) {
            if let Some(d) = in_degree.get_mut(dependent.as_str()) {
                *d -= 1;
                if *d == 0 {
                    queue.push_back(dependent.as_str());
                }
            }
        }
    }

    if sorted.len() == graph.ids().len() {
        report.topo_order = Some(sorted);
    } else {
        report.topo_order = None;
    }
}

fn compute_depths(
    graph: &DependencyGraph,
    cyclic: &HashSet<String>,
    report: &mut GraphReport,
) {
    let mut memo: HashMap<&str, usize> = HashMap::new();

    fn depth_of<'g>(
        graph: &'g DependencyGraph,
        id: &'g str,
        cyclic: &HashSet<String>,
        memo: &mut HashMap<&'g str, usize>,
    ) -> usize {
        if let Some(&d) = memo.get(id) {
            return d;
        }
        let d = graph
            .dependencies(id)
            .iter()
            .filter(|dep| graph.contains(dep) && !cyclic.contains(dep.as_str()))
            .map(|dep| depth_of(graph, dep, cyclic, memo) + 1)
            .max()
            .unwrap_or(0);
        memo.insert(id, d);
        d
    }

    let mut max_depth = 0;
    for id in graph.ids() {
        if cyclic.contains(id) {
            continue;
        }
        let d = depth_of(graph, id, cyclic, &mut memo);
        report.levels.insert(id.clone(), d);
        max_depth = max_depth.max(d);
    }
    report.stats.max_depth = max_depth;

    if max_depth > DEPTH_WARNING_THRESHOLD {
        report.warnings.push(format!(
            "longest dependency chain is {max_depth} links; evaluation rounds may take several passes"
        ));
    }
}
