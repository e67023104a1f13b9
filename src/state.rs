//! Per-question lifecycle state and the session's mutable maps.
//!
//! All answer/score/explanation/state mutation funnels through
//! [`SessionState`]; the orchestrator is the only writer. Consumers see the
//! maps only through an immutable [`Snapshot`] produced at commit time, so a
//! new score is never observable next to a stale state.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::graph::DependencyGraph;
use crate::question::{is_answered, AnswerValue, Question, QuestionSet};

/// Lifecycle state of a single question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionState {
    Unanswered,
    PartiallyAnswered,
    FullyAnswered,
}

/// Pure state computation for one question.
///
/// Rules, in order:
/// 1. no usable answer -> `Unanswered`;
/// 2. score-exempt questions waive the score requirement (they are never
///    scored, so requiring one would wedge their dependents);
/// 3. no dependencies -> `FullyAnswered` once a score exists;
/// 4. otherwise `FullyAnswered` only when every dependency is fully answered
///    and a score exists.
pub fn compute_state(
    question: &Question,
    graph: &DependencyGraph,
    answers: &HashMap<String, AnswerValue>,
    scores: &HashMap<String, f64>,
    states: &HashMap<String, QuestionState>,
) -> QuestionState {
    let answered = answers
        .get(&question.id)
        .map(is_answered)
        .unwrap_or(false);
    if !answered {
        return QuestionState::Unanswered;
    }

    let deps = graph.dependencies(&question.id);
    let deps_satisfied = deps.iter().all(|dep| {
        states.get(dep.as_str()) == Some(&QuestionState::FullyAnswered)
    });

    if question.score_exempt {
        return if deps_satisfied {
            QuestionState::FullyAnswered
        } else {
            QuestionState::PartiallyAnswered
        };
    }

    let scored = scores.contains_key(&question.id);
    if deps_satisfied && scored {
        QuestionState::FullyAnswered
    } else {
        QuestionState::PartiallyAnswered
    }
}

// =============================================================================
// Session state
// =============================================================================

/// Immutable view of the session published at each commit.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub answers: HashMap<String, AnswerValue>,
    pub scores: HashMap<String, f64>,
    pub explanations: HashMap<String, String>,
    pub states: HashMap<String, QuestionState>,
    /// Per-question scoring failures from the last round that touched them.
    pub failures: HashMap<String, String>,
}

/// The session's working maps. Scores and explanations only ever change
/// together; [`SessionState::set_result`] and [`SessionState::clear_result`]
/// are the only mutation paths for the pair.
#[derive(Debug, Default)]
pub struct SessionState {
    answers: HashMap<String, AnswerValue>,
    scores: HashMap<String, f64>,
    explanations: HashMap<String, String>,
    states: HashMap<String, QuestionState>,
    failures: HashMap<String, String>,
    /// Serialized answer at the time of the last successful evaluation,
    /// used to suppress re-scoring unchanged answers.
    last_evaluated: HashMap<String, String>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_answer(&mut self, id: impl Into<String>, value: AnswerValue) {
        self.answers.insert(id.into(), value);
    }

    pub fn answers(&self) -> &HashMap<String, AnswerValue> {
        &self.answers
    }

    pub fn answer(&self, id: &str) -> Option<&AnswerValue> {
        self.answers.get(id)
    }

    pub fn score(&self, id: &str) -> Option<f64> {
        self.scores.get(id).copied()
    }

    pub fn scores(&self) -> &HashMap<String, f64> {
        &self.scores
    }

    pub fn explanation(&self, id: &str) -> Option<&str> {
        self.explanations.get(id).map(String::as_str)
    }

    pub fn state(&self, id: &str) -> QuestionState {
        self.states
            .get(id)
            .copied()
            .unwrap_or(QuestionState::Unanswered)
    }

    pub fn failure(&self, id: &str) -> Option<&str> {
        self.failures.get(id).map(String::as_str)
    }

    /// Record a successful evaluation: score and explanation land together,
    /// any failure flag clears, and the answer fingerprint is remembered.
    pub fn set_result(&mut self, id: &str, score: f64, explanation: impl Into<String>) {
        self.scores.insert(id.to_string(), score);
        self.explanations.insert(id.to_string(), explanation.into());
        self.failures.remove(id);
        if let Some(answer) = self.answers.get(id) {
            self.last_evaluated.insert(id.to_string(), answer.to_string());
        }
    }

    /// Record a derived score (calculation output). Derived targets have no
    /// explanation; an existing one for the same id is dropped so the pair
    /// stays consistent.
    pub fn set_derived_score(&mut self, id: &str, score: f64) {
        self.scores.insert(id.to_string(), score);
        self.explanations.remove(id);
    }

    /// Drop a derived target ahead of recomputation. A rule whose inputs are
    /// no longer present must not leave its previous output behind.
    pub fn clear_derived_score(&mut self, id: &str) {
        self.scores.remove(id);
        self.explanations.remove(id);
    }

    /// Invalidate a cached result: score and explanation clear together,
    /// along with the failure flag and the evaluation fingerprint.
    pub fn clear_result(&mut self, id: &str) {
        self.scores.remove(id);
        self.explanations.remove(id);
        self.failures.remove(id);
        self.last_evaluated.remove(id);
    }

    pub fn set_failure(&mut self, id: &str, message: impl Into<String>) {
        self.failures.insert(id.to_string(), message.into());
    }

    /// Whether the current answer matches the one scored last time.
    pub fn answer_unchanged_since_evaluation(&self, id: &str) -> bool {
        match (self.answers.get(id), self.last_evaluated.get(id)) {
            (Some(current), Some(previous)) => current.to_string() == *previous,
            _ => false,
        }
    }

    /// Recompute every question's state to a fixed point.
    ///
    /// `FullyAnswered` propagates along dependency chains, so a single sweep
    /// in map order is not enough; sweeps repeat until nothing changes,
    /// bounded by the question count plus one (a cycle can never promote, so
    /// the bound is safe).
    pub fn recompute_states(&mut self, set: &QuestionSet, graph: &DependencyGraph) {
        let max_sweeps = set.questions.len() + 1;
        for _ in 0..max_sweeps {
            let mut changed = false;
            for question in &set.questions {
                let next = compute_state(question, graph, &self.answers, &self.scores, &self.states);
                let prev = self.states.insert(question.id.clone(), next);
                if prev != Some(next) {
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    /// Build the immutable snapshot for publication.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::new(Snapshot {
            answers: self.answers.clone(),
            scores: self.scores.clone(),
            explanations: self.explanations.clone(),
            states: self.states.clone(),
            failures: self.failures.clone(),
        })
    }

    /// Ids that are answered, not score-exempt, and have no score yet.
    /// Startup reconciliation seeds its first round from this.
    pub fn answered_unscored(&self, set: &QuestionSet) -> Vec<String> {
        set.questions
            .iter()
            .filter(|q| !q.score_exempt)
            .filter(|q| {
                self.answers
                    .get(&q.id)
                    .map(is_answered)
                    .unwrap_or(false)
            })
            .filter(|q| !self.scores.contains_key(&q.id))
            .map(|q| q.id.clone())
            .collect()
    }

    /// Ready questions: answered, not fully answered, not score-exempt, not
    /// on `excluded`, with every dependency fully answered and no score yet.
    pub fn ready_questions(
        &self,
        set: &QuestionSet,
        graph: &DependencyGraph,
        excluded: &HashSet<String>,
    ) -> Vec<String> {
        set.questions
            .iter()
            .filter(|q| !q.score_exempt && !excluded.contains(&q.id))
            .filter(|q| self.state(&q.id) == QuestionState::PartiallyAnswered)
            .filter(|q| !self.scores.contains_key(&q.id))
            .filter(|q| {
                graph.dependencies(&q.id).iter().all(|dep| {
                    self.state(dep) == QuestionState::FullyAnswered
                })
            })
            .map(|q| q.id.clone())
            .collect()
    }
}
