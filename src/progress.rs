//! In-flight evaluation tracking.
//!
//! Guards against duplicate concurrent evaluation of the same question,
//! bounds total concurrent evaluations, and force-completes entries that
//! outlive their timeout so a hung call can never wedge a question forever.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Why an evaluation left the in-flight set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    Success,
    Failure,
    TimedOut,
    Superseded,
}

#[derive(Debug, Clone)]
pub struct ProgressConfig {
    /// Maximum number of evaluations in flight at once.
    pub max_concurrent: usize,
    /// Per-evaluation budget before force-completion.
    pub evaluation_timeout: Duration,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            evaluation_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    in_flight: HashMap<String, Instant>,
}

/// Shared tracker; clones observe the same in-flight set.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    inner: Arc<Mutex<Inner>>,
    config: ProgressConfig,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(ProgressConfig::default())
    }
}

impl ProgressTracker {
    pub fn new(config: ProgressConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            config,
        }
    }

    pub fn evaluation_timeout(&self) -> Duration {
        self.config.evaluation_timeout
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// Try to claim an evaluation slot for `id`. Returns `false` (and claims
    /// nothing) when the id is already in flight or the concurrency cap is
    /// reached; the caller must not invoke the scorer in that case.
    pub fn start_evaluation(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().expect("progress tracker poisoned");
        if inner.in_flight.contains_key(id) {
            debug!(id, "Evaluation already in flight; refusing duplicate");
            return false;
        }
        if inner.in_flight.len() >= self.config.max_concurrent {
            debug!(
                id,
                in_flight = inner.in_flight.len(),
                "Concurrency cap reached; refusing start"
            );
            return false;
        }
        inner.in_flight.insert(id.to_string(), Instant::now());
        true
    }

    /// Release the slot for `id`. Unknown ids are ignored (the entry may have
    /// been force-completed by a timeout reap in the meantime).
    pub fn complete_evaluation(&self, id: &str, reason: CompletionReason) {
        let mut inner = self.inner.lock().expect("progress tracker poisoned");
        if let Some(started) = inner.in_flight.remove(id) {
            debug!(
                id,
                ?reason,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Evaluation completed"
            );
        }
    }

    /// Force-complete every entry older than the timeout and return their
    /// ids so the orchestrator can treat them as failed attempts.
    pub fn reap_timed_out(&self) -> Vec<String> {
        let mut inner = self.inner.lock().expect("progress tracker poisoned");
        let timeout = self.config.evaluation_timeout;
        let expired: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, started)| started.elapsed() >= timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            inner.in_flight.remove(id);
            warn!(id = id.as_str(), "Evaluation timed out; force-completing");
        }
        expired
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.lock().expect("progress tracker poisoned").in_flight.len()
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.inner
            .lock()
            .expect("progress tracker poisoned")
            .in_flight
            .contains_key(id)
    }
}
