use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use scoreflow::orchestrator::{Orchestrator, OrchestratorConfig, RoundStop, SnapshotSink};
use scoreflow::progress::{ProgressConfig, ProgressTracker};
use scoreflow::question::QuestionSet;
use scoreflow::scorer::{
    ScoreOutcome, ScoreRequest, Scorer, ScorerClient, ScorerConfig, ScorerError,
};
use scoreflow::state::{QuestionState, Snapshot};

// =============================================================================
// Scripted scorer
// =============================================================================

#[derive(Default)]
struct Script {
    /// Fixed score per question id; everything else gets 50.
    scores: HashMap<String, f64>,
    /// Ids that fail with a non-retriable provider error.
    failing: Vec<String>,
    /// Artificial latency per call.
    delay: Option<Duration>,
}

#[derive(Clone, Default)]
struct ScriptedScorer {
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<ScoreRequest>>>,
}

impl ScriptedScorer {
    fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn called_ids(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.question_id.clone())
            .collect()
    }

    fn calls_for(&self, id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.question_id == id)
            .count()
    }

    fn last_request_for(&self, id: &str) -> Option<ScoreRequest> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.question_id == id)
            .cloned()
    }
}

#[async_trait]
impl Scorer for ScriptedScorer {
    async fn score(&self, req: &ScoreRequest) -> Result<ScoreOutcome, ScorerError> {
        self.calls.lock().unwrap().push(req.clone());
        if let Some(delay) = self.script.delay {
            tokio::time::sleep(delay).await;
        }
        if self.script.failing.iter().any(|id| id == &req.question_id) {
            return Err(ScorerError::provider("scripted failure"));
        }
        let score = self
            .script
            .scores
            .get(&req.question_id)
            .copied()
            .unwrap_or(50.0);
        Ok(ScoreOutcome {
            score,
            explanation: format!("scripted explanation for {}", req.question_id),
        })
    }
}

fn no_backoff() -> ScorerConfig {
    ScorerConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(4),
        max_jitter: Duration::ZERO,
    }
}

fn orchestrator_with(
    set: QuestionSet,
    scorer: ScriptedScorer,
) -> Orchestrator<ScriptedScorer> {
    Orchestrator::with_config(
        set,
        ScorerClient::with_config(scorer, no_backoff()),
        ProgressTracker::default(),
        OrchestratorConfig::default(),
    )
}

fn chain_set() -> QuestionSet {
    // A has no dependencies, B depends on A, C depends on B.
    QuestionSet::from_json(
        &json!({
            "questions": [
                {"id": "A", "text": "Question A", "question_type": "text"},
                {"id": "B", "text": "Question B", "question_type": "text",
                 "ai_context": {"include_answers": ["A"]}},
                {"id": "C", "text": "Question C", "question_type": "text",
                 "ai_context": {"include_answers": ["B"]}}
            ]
        })
        .to_string(),
    )
    .unwrap()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn chain_scores_in_dependency_order_one_call_each() {
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(chain_set(), scorer.clone());

    orch.note_answer("A", json!("answer a")).unwrap();
    orch.run_round().await;
    orch.note_answer("B", json!("answer b")).unwrap();
    orch.run_round().await;
    assert_eq!(orch.state("A"), QuestionState::FullyAnswered);
    assert_eq!(orch.state("B"), QuestionState::FullyAnswered);

    // A and B are already scored; answering C triggers exactly one call.
    orch.note_answer("C", json!("answer c")).unwrap();
    let report = orch.run_round().await;

    assert_eq!(report.scored, vec!["C".to_string()]);
    assert_eq!(scorer.calls_for("A"), 1);
    assert_eq!(scorer.calls_for("B"), 1);
    assert_eq!(scorer.calls_for("C"), 1);
    assert_eq!(orch.state("C"), QuestionState::FullyAnswered);
}

#[tokio::test]
async fn startup_reconciliation_scores_all_answered_questions() {
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(chain_set(), scorer.clone());

    for id in ["A", "B", "C"] {
        orch.load_answer(id, json!(format!("answer {id}"))).unwrap();
    }
    orch.schedule_startup_reconciliation();
    let report = orch.run_round().await;

    assert_eq!(report.scored.len(), 3);
    assert_eq!(report.failed.len(), 0);
    for id in ["A", "B", "C"] {
        assert_eq!(scorer.calls_for(id), 1);
        assert_eq!(orch.state(id), QuestionState::FullyAnswered, "{id}");
    }
}

#[tokio::test]
async fn answer_change_invalidates_and_rescores_transitive_dependents() {
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(chain_set(), scorer.clone());

    for id in ["A", "B", "C"] {
        orch.note_answer(id, json!(format!("answer {id}"))).unwrap();
    }
    orch.run_round().await;
    assert_eq!(orch.state("C"), QuestionState::FullyAnswered);

    // Changing A clears B and C (score + explanation together) and the
    // fixpoint loop re-scores them in dependency order.
    orch.note_answer("A", json!("revised answer a")).unwrap();
    let report = orch.run_round().await;

    assert_eq!(report.invalidated, vec!["B".to_string(), "C".to_string()]);
    assert_eq!(scorer.calls_for("A"), 2);
    assert_eq!(scorer.calls_for("B"), 2);
    assert_eq!(scorer.calls_for("C"), 2);
    for id in ["A", "B", "C"] {
        assert_eq!(orch.state(id), QuestionState::FullyAnswered, "{id}");
        assert!(orch.score(id).is_some());
        assert!(orch.explanation(id).is_some());
    }

    // B was re-scored only after A, and C only after B.
    let order = scorer.called_ids();
    let last = |id: &str| order.iter().rposition(|c| c == id).unwrap();
    assert!(last("A") < last("B"));
    assert!(last("B") < last("C"));
}

#[tokio::test]
async fn unchanged_answer_does_not_rescore() {
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(chain_set(), scorer.clone());

    orch.note_answer("A", json!("same answer")).unwrap();
    orch.run_round().await;
    assert_eq!(scorer.calls_for("A"), 1);

    orch.note_answer("A", json!("same answer")).unwrap();
    let report = orch.run_round().await;

    assert_eq!(scorer.calls_for("A"), 1);
    assert!(report.scored.is_empty());
    assert!(report.invalidated.is_empty());
}

#[tokio::test]
async fn cycle_members_are_never_scheduled_and_never_complete() {
    let set = QuestionSet::from_json(
        &json!({
            "questions": [
                {"id": "A", "text": "a", "question_type": "text",
                 "ai_context": {"include_answers": ["C"]}},
                {"id": "B", "text": "b", "question_type": "text",
                 "ai_context": {"include_answers": ["A"]}},
                {"id": "C", "text": "c", "question_type": "text",
                 "ai_context": {"include_answers": ["B"]}},
                {"id": "FREE", "text": "free-standing", "question_type": "text"}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(set, scorer.clone());

    assert!(!orch.graph_report().is_valid());
    assert_eq!(orch.graph_report().stats.circular_dependencies.len(), 1);

    for id in ["A", "B", "C", "FREE"] {
        orch.note_answer(id, json!("answer")).unwrap();
    }
    let report = orch.run_round().await;

    // The session stays usable for unaffected questions.
    assert_eq!(report.scored, vec!["FREE".to_string()]);
    assert_eq!(orch.state("FREE"), QuestionState::FullyAnswered);
    for id in ["A", "B", "C"] {
        assert_eq!(scorer.calls_for(id), 0, "{id}");
        assert_eq!(orch.state(id), QuestionState::PartiallyAnswered, "{id}");
    }
    assert_eq!(report.stop, RoundStop::Fixpoint);
}

#[tokio::test]
async fn missing_reference_leaves_dependent_partially_answered() {
    let set = QuestionSet::from_json(
        &json!({
            "questions": [
                {"id": "Q", "text": "q", "question_type": "text",
                 "ai_context": {"include_answers": ["GONE"]}}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(set, scorer.clone());

    orch.note_answer("Q", json!("answer")).unwrap();
    orch.run_round().await;

    // Scored (the answer itself is evaluable) but never fully answered.
    assert_eq!(scorer.calls_for("Q"), 1);
    assert!(orch.score("Q").is_some());
    assert_eq!(orch.state("Q"), QuestionState::PartiallyAnswered);
}

#[tokio::test]
async fn scoring_failure_sets_flag_and_leaves_question_scoreable() {
    let scorer = ScriptedScorer::new(Script {
        failing: vec!["B".into()],
        ..Script::default()
    });
    let mut orch = orchestrator_with(chain_set(), scorer.clone());

    orch.note_answer("A", json!("a")).unwrap();
    orch.note_answer("B", json!("b")).unwrap();
    let report = orch.run_round().await;

    assert_eq!(report.scored, vec!["A".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "B");
    assert!(orch.score("B").is_none());
    assert!(orch.failure("B").is_some());
    assert_eq!(orch.state("B"), QuestionState::PartiallyAnswered);
    // The failure does not spin the fixpoint loop to its ceiling.
    assert_eq!(report.stop, RoundStop::Fixpoint);

    // A later trigger makes the question scoreable again.
    let calls_before = scorer.calls_for("B");
    orch.note_answer("B", json!("b revised")).unwrap();
    orch.run_round().await;
    assert_eq!(scorer.calls_for("B"), calls_before + 1);
}

#[tokio::test]
async fn calculation_rules_apply_after_the_loop() {
    let set = QuestionSet::from_json(
        &json!({
            "questions": [
                {"id": "A", "text": "a", "question_type": "text"},
                {"id": "B", "text": "b", "question_type": "text"}
            ],
            "calculations": ["TOTAL = A + B"]
        })
        .to_string(),
    )
    .unwrap();
    let scorer = ScriptedScorer::new(Script {
        scores: HashMap::from([("A".to_string(), 40.0), ("B".to_string(), 60.0)]),
        ..Script::default()
    });
    let mut orch = orchestrator_with(set, scorer.clone());

    // Only A answered: TOTAL's inputs are incomplete, so it is omitted.
    orch.note_answer("A", json!("a")).unwrap();
    orch.run_round().await;
    assert_eq!(orch.score("A"), Some(40.0));
    assert_eq!(orch.score("TOTAL"), None);

    orch.note_answer("B", json!("b")).unwrap();
    orch.run_round().await;
    assert_eq!(orch.score("TOTAL"), Some(100.0));
    assert!(orch.snapshot().scores.contains_key("TOTAL"));
}

#[tokio::test]
async fn derived_score_is_dropped_when_an_input_disappears() {
    let set = QuestionSet::from_json(
        &json!({
            "questions": [
                {"id": "A", "text": "a", "question_type": "text"},
                {"id": "B", "text": "b", "question_type": "text"}
            ],
            "calculations": ["TOTAL = A + B", "DOUBLE = TOTAL * 2"]
        })
        .to_string(),
    )
    .unwrap();
    let scorer = ScriptedScorer::new(Script {
        scores: HashMap::from([("A".to_string(), 40.0), ("B".to_string(), 60.0)]),
        ..Script::default()
    });
    let mut orch = orchestrator_with(set, scorer.clone());

    orch.note_answer("A", json!("a")).unwrap();
    orch.note_answer("B", json!("b")).unwrap();
    orch.run_round().await;
    assert_eq!(orch.score("TOTAL"), Some(100.0));
    assert_eq!(orch.score("DOUBLE"), Some(200.0));

    // Clearing A's answer drops its score and A is never re-scored; the
    // rules no longer fire, and neither derived value may linger in the
    // published snapshot.
    orch.note_answer("A", json!("")).unwrap();
    orch.run_round().await;
    assert_eq!(orch.score("A"), None);
    assert_eq!(orch.score("B"), Some(60.0));
    assert_eq!(orch.score("TOTAL"), None);
    assert_eq!(orch.score("DOUBLE"), None);
    assert!(!orch.snapshot().scores.contains_key("TOTAL"));
}

#[tokio::test]
async fn meta_context_flows_into_requests_without_scoring_the_meta_question() {
    let set = QuestionSet::from_json(
        &json!({
            "questions": [
                {"id": "MET.LOC", "text": "Where is the business located?",
                 "question_type": "text", "score_exempt": true},
                {"id": "SG01", "text": "What is your growth plan?",
                 "question_type": "text",
                 "ai_context": {"include_meta": ["MET.LOC"]}}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(set, scorer.clone());

    orch.note_answer("MET.LOC", json!("Berlin")).unwrap();
    orch.note_answer("SG01", json!("open two stores")).unwrap();
    orch.run_round().await;

    assert_eq!(scorer.calls_for("MET.LOC"), 0);
    assert_eq!(orch.state("MET.LOC"), QuestionState::FullyAnswered);
    assert_eq!(orch.state("SG01"), QuestionState::FullyAnswered);

    let req = scorer.last_request_for("SG01").unwrap();
    assert_eq!(
        req.meta.get("Where is the business located?").map(String::as_str),
        Some("Berlin")
    );
}

#[tokio::test]
async fn all_sentinel_pulls_every_other_answered_question_into_context() {
    let set = QuestionSet::from_json(
        &json!({
            "questions": [
                {"id": "A", "text": "Question A", "question_type": "text"},
                {"id": "B", "text": "Question B", "question_type": "text"},
                {"id": "SUM", "text": "Summary question", "question_type": "textarea",
                 "ai_context": {"include_answers": ["all"]}}
            ]
        })
        .to_string(),
    )
    .unwrap();
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(set, scorer.clone());

    // `all` creates no graph edges, so SUM must not be invalidated by A.
    assert!(orch.graph_report().is_valid());

    orch.note_answer("A", json!("alpha")).unwrap();
    orch.note_answer("B", json!("beta")).unwrap();
    orch.note_answer("SUM", json!("summary")).unwrap();
    orch.run_round().await;

    let req = scorer.last_request_for("SUM").unwrap();
    assert_eq!(req.contextual_answers.len(), 2);
    assert_eq!(
        req.contextual_answers.get("Question A").map(String::as_str),
        Some("alpha")
    );
    assert_eq!(orch.state("SUM"), QuestionState::FullyAnswered);
}

#[tokio::test]
async fn hung_scorer_times_out_and_question_stays_partial() {
    let scorer = ScriptedScorer::new(Script {
        delay: Some(Duration::from_millis(250)),
        ..Script::default()
    });
    let set = QuestionSet::from_json(
        &json!({
            "questions": [{"id": "A", "text": "a", "question_type": "text"}]
        })
        .to_string(),
    )
    .unwrap();
    let tracker = ProgressTracker::new(ProgressConfig {
        max_concurrent: 5,
        evaluation_timeout: Duration::from_millis(20),
    });
    let mut orch = Orchestrator::with_config(
        set,
        ScorerClient::with_config(scorer, no_backoff()),
        tracker,
        OrchestratorConfig::default(),
    );

    orch.note_answer("A", json!("answer")).unwrap();
    let report = orch.run_round().await;

    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].1.contains("timeout"));
    assert!(orch.score("A").is_none());
    assert_eq!(orch.state("A"), QuestionState::PartiallyAnswered);
}

// =============================================================================
// Snapshot consistency
// =============================================================================

#[derive(Default)]
struct CapturingSink {
    snapshots: Mutex<Vec<Snapshot>>,
}

impl SnapshotSink for CapturingSink {
    fn publish(&self, snapshot: &Snapshot) {
        self.snapshots.lock().unwrap().push(snapshot.clone());
    }
}

#[tokio::test]
async fn every_published_snapshot_is_internally_consistent() {
    let sink = Arc::new(CapturingSink::default());
    let scorer = ScriptedScorer::new(Script::default());
    let mut orch = orchestrator_with(chain_set(), scorer.clone()).with_sink(sink.clone());

    orch.note_answer("A", json!("a")).unwrap();
    orch.run_round().await;
    orch.note_answer("B", json!("b")).unwrap();
    orch.note_answer("C", json!("c")).unwrap();
    orch.run_round().await;
    orch.note_answer("A", json!("a revised")).unwrap();
    orch.run_round().await;

    let snapshots = sink.snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 3);
    for snapshot in snapshots.iter() {
        for (id, state) in &snapshot.states {
            if *state == QuestionState::FullyAnswered {
                assert!(snapshot.scores.contains_key(id), "{id} fully answered without score");
                assert!(
                    snapshot.explanations.contains_key(id),
                    "{id} fully answered without explanation"
                );
            }
        }
        // Scores and explanations always move together for scored questions.
        for id in snapshot.explanations.keys() {
            assert!(snapshot.scores.contains_key(id), "{id} explanation without score");
        }
    }
}
