#![forbid(unsafe_code)]

//! # scoreflow
//!
//! Dependency-aware incremental evaluation harness for AI-scored
//! questionnaires.
//!
//! Questions form a directed dependency graph: a question's scoring context
//! can include other questions' answers, so scores must be produced in
//! dependency order, invalidated when upstream answers change, and re-derived
//! without duplicate or overlapping work, all against an external scorer
//! that is non-deterministic and occasionally rate limited.
//!
//! The pieces, leaves first: [`graph`] builds and validates the dependency
//! graph; [`state`] derives per-question lifecycle states; [`invalidation`]
//! computes cascade sets; [`calculation`] evaluates derived-score formulas;
//! [`scorer`] wraps the external model call with bounded-retry backoff;
//! [`progress`] guards concurrency; and [`orchestrator`] drives rounds of the
//! fixpoint scoring loop and commits results atomically.

pub mod calculation;
pub mod graph;
pub mod invalidation;
pub mod orchestrator;
pub mod progress;
pub mod prompts;
pub mod question;
pub mod scorer;
pub mod state;

pub use calculation::{apply as apply_calculations, CalculationRule};
pub use graph::{DependencyGraph, GraphReport};
pub use orchestrator::{
    JsonlSnapshotSink, NoopSnapshotSink, Orchestrator, OrchestratorConfig, RoundReport,
    RoundStop, SnapshotSink,
};
pub use progress::{CompletionReason, ProgressConfig, ProgressTracker};
pub use question::{Question, QuestionSet, QuestionType};
pub use scorer::{
    OpenAiAdapter, ScoreOutcome, ScoreRequest, Scorer, ScorerClient, ScorerConfig, ScorerError,
};
pub use state::{QuestionState, SessionState, Snapshot};
