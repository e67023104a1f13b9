//! Evaluation orchestrator.
//!
//! Owns the session maps and drives rounds: an answer change (or startup
//! reconciliation) enqueues a trigger; a round invalidates stale results,
//! scores the immediately affected questions, then repeatedly scores whatever
//! became ready until a fixpoint, applies the calculation rules, and commits
//! everything as one observable state transition.
//!
//! Rounds run to completion under a single coordinator; all mutation of the
//! score/explanation/state maps happens here, so no external locking is
//! needed. Within a round, mutually-independent ready questions are scored
//! concurrently, bounded by the progress tracker's cap.

use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::calculation::{self, CalculationRule};
use crate::graph::{self, DependencyGraph, GraphReport};
use crate::invalidation::invalidation_set;
use crate::progress::{CompletionReason, ProgressTracker};
use crate::question::{
    is_answered, readable_answer, AnswerValue, Question, QuestionSet, QuestionType,
};
use crate::scorer::{ScoreRequest, Scorer, ScorerClient};
use crate::state::{QuestionState, SessionState, Snapshot};

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Safety valve on the fixpoint loop.
    pub max_passes: usize,
    /// Depth bound handed to the invalidation walk.
    pub invalidation_max_depth: usize,
    /// Base instructions for the scoring model. Empty means the built-in
    /// default prompt.
    pub system_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_passes: 10,
            invalidation_max_depth: crate::invalidation::DEFAULT_MAX_DEPTH,
            system_prompt: String::new(),
        }
    }
}

// =============================================================================
// Round reporting
// =============================================================================

/// Why the fixpoint loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStop {
    /// No trigger was pending.
    NoTrigger,
    /// No more questions could make progress.
    Fixpoint,
    /// The pass ceiling was hit before a fixpoint.
    PassLimit,
}

/// What one round did.
#[derive(Debug, Clone, Serialize)]
pub struct RoundReport {
    pub scored: Vec<String>,
    /// question id -> short failure description.
    pub failed: Vec<(String, String)>,
    pub invalidated: Vec<String>,
    /// Triggers skipped because the same question was already in flight.
    pub skipped_in_flight: Vec<String>,
    pub passes: usize,
    pub stop: RoundStop,
}

impl RoundReport {
    fn empty(stop: RoundStop) -> Self {
        Self {
            scored: Vec::new(),
            failed: Vec::new(),
            invalidated: Vec::new(),
            skipped_in_flight: Vec::new(),
            passes: 0,
            stop,
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown question id: {0}")]
    UnknownQuestion(String),
}

// =============================================================================
// Snapshot sinks
// =============================================================================

/// Receives the full session snapshot after each commit.
pub trait SnapshotSink: Send + Sync {
    fn publish(&self, snapshot: &Snapshot);
}

/// Discards every snapshot.
pub struct NoopSnapshotSink;

impl SnapshotSink for NoopSnapshotSink {
    fn publish(&self, _snapshot: &Snapshot) {}
}

/// Appends each committed snapshot as one JSON line.
pub struct JsonlSnapshotSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonlSnapshotSink {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl SnapshotSink for JsonlSnapshotSink {
    fn publish(&self, snapshot: &Snapshot) {
        let mut writer = self.writer.lock().expect("snapshot sink poisoned");
        match serde_json::to_string(snapshot) {
            Ok(line) => {
                if let Err(err) = writeln!(writer, "{line}").and_then(|_| writer.flush()) {
                    warn!(error = %err, "Failed to write snapshot");
                }
            }
            Err(err) => warn!(error = %err, "Failed to serialize snapshot"),
        }
    }
}

// =============================================================================
// Orchestrator
// =============================================================================

enum Trigger {
    /// An answer changed: invalidate dependents, re-score.
    AnswerChanged(String),
    /// Startup reconciliation: score if unscored, no invalidation.
    Reconcile(String),
}

pub struct Orchestrator<S> {
    set: QuestionSet,
    graph: DependencyGraph,
    report: GraphReport,
    /// Questions on a dependency cycle: never scheduled.
    cyclic: HashSet<String>,
    rules: Vec<CalculationRule>,
    client: ScorerClient<S>,
    tracker: ProgressTracker,
    session: SessionState,
    config: OrchestratorConfig,
    sink: Arc<dyn SnapshotSink>,
    pending: VecDeque<Trigger>,
    latest: Arc<Snapshot>,
}

impl<S: Scorer> Orchestrator<S> {
    pub fn new(set: QuestionSet, client: ScorerClient<S>) -> Self {
        Self::with_config(
            set,
            client,
            ProgressTracker::default(),
            OrchestratorConfig::default(),
        )
    }

    pub fn with_config(
        set: QuestionSet,
        client: ScorerClient<S>,
        tracker: ProgressTracker,
        config: OrchestratorConfig,
    ) -> Self {
        let graph = DependencyGraph::build(&set.questions);
        let report = graph::validate(&set, &graph);
        let cyclic = report.cyclic_ids();
        let rules = calculation::parse_rules(&set.calculations);

        Self {
            set,
            graph,
            report,
            cyclic,
            rules,
            client,
            tracker,
            session: SessionState::new(),
            config,
            sink: Arc::new(NoopSnapshotSink),
            pending: VecDeque::new(),
            latest: Arc::new(Snapshot::default()),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = sink;
        self
    }

    /// The load-time validation report.
    pub fn graph_report(&self) -> &GraphReport {
        &self.report
    }

    /// The last committed snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.latest.clone()
    }

    /// Record an answer without triggering a round (bulk restore at startup).
    pub fn load_answer(
        &mut self,
        id: &str,
        value: AnswerValue,
    ) -> Result<(), SessionError> {
        if self.set.find(id).is_none() {
            return Err(SessionError::UnknownQuestion(id.to_string()));
        }
        self.session.set_answer(id, value);
        Ok(())
    }

    /// Record an answer change and enqueue it for the next round.
    pub fn note_answer(
        &mut self,
        id: &str,
        value: AnswerValue,
    ) -> Result<(), SessionError> {
        self.load_answer(id, value)?;
        self.pending.push_back(Trigger::AnswerChanged(id.to_string()));
        Ok(())
    }

    /// Enqueue every answered, unscored question for scoring. Used once at
    /// session start when answers were restored from elsewhere.
    pub fn schedule_startup_reconciliation(&mut self) {
        for id in self.session.answered_unscored(&self.set) {
            self.pending.push_back(Trigger::Reconcile(id));
        }
    }

    /// Whether a round is waiting to run.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Run one round over all pending triggers. Errors local to a question
    /// never abort the round; they land in the report and the failure map.
    pub async fn run_round(&mut self) -> RoundReport {
        if self.pending.is_empty() {
            return RoundReport::empty(RoundStop::NoTrigger);
        }

        let mut report = RoundReport::empty(RoundStop::Fixpoint);

        // Collect the initial scoring set and invalidate stale dependents.
        let mut initial: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut invalidated: HashSet<String> = HashSet::new();

        while let Some(trigger) = self.pending.pop_front() {
            match trigger {
                Trigger::AnswerChanged(id) => {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if self.session.answer_unchanged_since_evaluation(&id) {
                        debug!(id = id.as_str(), "Answer unchanged since last evaluation; skipping");
                        continue;
                    }
                    for stale in
                        invalidation_set(&id, &self.graph, self.config.invalidation_max_depth)
                    {
                        invalidated.insert(stale);
                    }
                    self.session.clear_result(&id);
                    if self.should_score(&id) {
                        initial.push(id);
                    }
                }
                Trigger::Reconcile(id) => {
                    if !seen.insert(id.clone()) {
                        continue;
                    }
                    if self.session.score(&id).is_none() && self.should_score(&id) {
                        initial.push(id);
                    }
                }
            }
        }

        for id in &invalidated {
            self.session.clear_result(id);
        }
        report.invalidated = invalidated.into_iter().collect();
        report.invalidated.sort();

        self.session.recompute_states(&self.set, &self.graph);

        // Score the immediately affected questions.
        self.score_batch(initial, &mut report).await;
        self.session.recompute_states(&self.set, &self.graph);

        // Fixpoint loop: keep scoring whatever became ready. Questions that
        // failed this round stay excluded until the next trigger.
        let mut excluded: HashSet<String> = self.cyclic.clone();
        excluded.extend(report.failed.iter().map(|(id, _)| id.clone()));

        for pass in 1..=self.config.max_passes {
            report.passes = pass;

            let ready = self.session.ready_questions(&self.set, &self.graph, &excluded);
            if ready.is_empty() {
                report.stop = RoundStop::Fixpoint;
                break;
            }
            debug!(pass, ready = ready.len(), "Scoring ready questions");

            let failed_before = report.failed.len();
            let scored_before = report.scored.len();
            self.score_batch(ready, &mut report).await;
            excluded.extend(report.failed[failed_before..].iter().map(|(id, _)| id.clone()));

            self.session.recompute_states(&self.set, &self.graph);

            if report.scored.len() == scored_before && report.failed.len() == failed_before {
                // Every candidate was refused (in flight elsewhere); there is
                // no progress to be made this round.
                report.stop = RoundStop::Fixpoint;
                break;
            }
            if pass == self.config.max_passes {
                report.stop = RoundStop::PassLimit;
                warn!(max_passes = pass, "Fixpoint loop hit the pass ceiling");
            }
        }

        // Derived scores, then one atomic commit.
        self.apply_calculations();
        self.session.recompute_states(&self.set, &self.graph);
        self.commit();

        info!(
            scored = report.scored.len(),
            failed = report.failed.len(),
            invalidated = report.invalidated.len(),
            passes = report.passes,
            stop = ?report.stop,
            "Round complete"
        );
        report
    }

    /// Whether this question may be scheduled for scoring at all.
    fn should_score(&self, id: &str) -> bool {
        let Some(question) = self.set.find(id) else {
            return false;
        };
        if question.score_exempt {
            return false;
        }
        if self.cyclic.contains(id) {
            warn!(id, "Question sits on a dependency cycle; refusing to schedule");
            return false;
        }
        self.session
            .answer(id)
            .map(is_answered)
            .unwrap_or(false)
    }

    /// Score a set of questions concurrently, bounded by the tracker cap.
    /// Results merge into the session; states are the caller's business.
    async fn score_batch(&mut self, ids: Vec<String>, report: &mut RoundReport) {
        if ids.is_empty() {
            return;
        }

        let mut tasks: Vec<(String, ScoreRequest)> = Vec::with_capacity(ids.len());
        for id in ids {
            if !self.tracker.start_evaluation(&id) {
                report.skipped_in_flight.push(id);
                continue;
            }
            let req = self.build_request(&id);
            tasks.push((id, req));
        }

        let per_call_timeout = self.tracker.evaluation_timeout();
        let concurrency = self.tracker.max_concurrent().max(1);
        let client = &self.client;
        let tracker = self.tracker.clone();

        let results = stream::iter(tasks.into_iter().map(|(id, req)| {
            let tracker = tracker.clone();
            async move {
                match timeout(per_call_timeout, client.score(&req)).await {
                    Ok(Ok(outcome)) => {
                        tracker.complete_evaluation(&id, CompletionReason::Success);
                        Some((id, Ok(outcome)))
                    }
                    Ok(Err(err)) => {
                        tracker.complete_evaluation(&id, CompletionReason::Failure);
                        Some((id, Err(format!("{}: {err}", err.code()))))
                    }
                    // The call is cancelled here, but its in-flight entry
                    // stays put: the reap below force-completes and reports
                    // it as the failed attempt.
                    Err(_) => None,
                }
            }
        }))
        .buffer_unordered(concurrency)
        .collect::<Vec<_>>()
        .await;

        for id in self.tracker.reap_timed_out() {
            self.session.set_failure(&id, "timeout: evaluation exceeded budget");
            report
                .failed
                .push((id, "timeout: evaluation exceeded budget".to_string()));
        }

        for (id, result) in results.into_iter().flatten() {
            match result {
                Ok(outcome) => {
                    self.session.set_result(&id, outcome.score, outcome.explanation);
                    report.scored.push(id);
                }
                Err(message) => {
                    warn!(id = id.as_str(), message = message.as_str(), "Scoring failed");
                    self.session.set_failure(&id, message.clone());
                    report.failed.push((id, message));
                }
            }
        }
    }

    /// Assemble the scorer request for one question from the current answers.
    fn build_request(&self, id: &str) -> ScoreRequest {
        let question = self
            .set
            .find(id)
            .expect("scoring a question that was validated to exist");

        let answer_text = self
            .session
            .answer(id)
            .map(|v| readable_answer(question, v))
            .unwrap_or_default();

        let mut req = ScoreRequest::new(
            self.config.system_prompt.clone(),
            id,
            question.text.clone(),
            answer_text,
        );
        if let Some(extra) = question.prompt_add.as_deref() {
            req = req.with_additional_context(extra);
        }

        for meta_id in question.meta_dependencies() {
            if let Some((label, value)) = self.context_entry(meta_id) {
                req = req.with_meta(label, value);
            }
        }

        if question.includes_all_answers() {
            for other in &self.set.questions {
                if other.id == question.id || other.question_type == QuestionType::Internal {
                    continue;
                }
                if let Some((label, value)) = self.context_entry(&other.id) {
                    req = req.with_context_answer(label, value);
                }
            }
        } else {
            for dep_id in question.answer_dependencies() {
                if let Some((label, value)) = self.context_entry(dep_id) {
                    req = req.with_context_answer(label, value);
                }
            }
        }

        req
    }

    /// Question text and readable answer for a context id, when it is
    /// answered. Missing references resolve to nothing.
    fn context_entry(&self, id: &str) -> Option<(String, String)> {
        let question = self.set.find(id)?;
        let answer = self.session.answer(id)?;
        if !is_answered(answer) {
            return None;
        }
        Some((question.text.clone(), readable_answer(question, answer)))
    }

    fn apply_calculations(&mut self) {
        if self.rules.is_empty() {
            return;
        }
        // Derived targets are recomputed from scratch each round: a rule
        // whose inputs have since been cleared must leave no stale value
        // behind for later rules or the published snapshot.
        for rule in &self.rules {
            self.session.clear_derived_score(&rule.target);
        }
        let derived = calculation::apply(self.session.scores(), &self.rules);
        for (id, value) in derived {
            if self.session.score(&id) != Some(value) {
                self.session.set_derived_score(&id, value);
            }
        }
    }

    /// Publish scores, explanations, and states as one transition.
    fn commit(&mut self) {
        let snapshot = self.session.snapshot();
        self.latest = snapshot.clone();
        self.sink.publish(&snapshot);
    }

    /// Convenience accessors for tests and embedding callers.
    pub fn state(&self, id: &str) -> QuestionState {
        self.session.state(id)
    }

    pub fn score(&self, id: &str) -> Option<f64> {
        self.session.score(id)
    }

    pub fn explanation(&self, id: &str) -> Option<&str> {
        self.session.explanation(id)
    }

    pub fn failure(&self, id: &str) -> Option<&str> {
        self.session.failure(id)
    }

    pub fn question(&self, id: &str) -> Option<&Question> {
        self.set.find(id)
    }
}
