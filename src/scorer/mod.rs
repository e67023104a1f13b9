//! Scorer boundary: one bounded-retry call per question evaluation.

pub mod error;
pub mod openai;
pub mod types;

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

pub use error::ScorerError;
pub use openai::{OpenAiAdapter, Scorer};
pub use types::{Message, Role, ScoreOutcome, ScoreRequest};

/// Retry/backoff discipline around the external scorer.
#[derive(Debug, Clone)]
pub struct ScorerConfig {
    /// Total attempts, first call included.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on the random jitter added to each delay.
    pub max_jitter: Duration,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(500),
        }
    }
}

/// Wraps a [`Scorer`] with bounded-retry exponential backoff.
///
/// Only rate limits and malformed responses are retried; a provider-advertised
/// minimum wait overrides the computed delay when it is longer. Everything
/// else fails on the first attempt. Purely functional from the caller's
/// perspective: no state survives the call.
pub struct ScorerClient<S> {
    scorer: S,
    config: ScorerConfig,
}

impl<S: Scorer> ScorerClient<S> {
    pub fn new(scorer: S) -> Self {
        Self::with_config(scorer, ScorerConfig::default())
    }

    pub fn with_config(scorer: S, config: ScorerConfig) -> Self {
        Self { scorer, config }
    }

    pub async fn score(&self, req: &ScoreRequest) -> Result<ScoreOutcome, ScorerError> {
        let mut attempt = 1u32;

        loop {
            match self.scorer.score(req).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    if !err.is_retryable() || attempt >= self.config.max_attempts {
                        return Err(err);
                    }

                    let delay = self.delay_for(attempt, err.advertised_retry_after());
                    warn!(
                        question_id = req.question_id.as_str(),
                        attempt,
                        code = err.code(),
                        delay_ms = delay.as_millis() as u64,
                        "Scorer attempt failed; backing off"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// `initial_delay * 2^(attempt-1)` capped at `max_delay`, plus jitter;
    /// an advertised minimum wait wins when it is longer.
    fn delay_for(&self, attempt: u32, advertised: Option<Duration>) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        let exponential = self
            .config
            .initial_delay
            .saturating_mul(multiplier)
            .min(self.config.max_delay);

        let jitter = if self.config.max_jitter.is_zero() {
            Duration::ZERO
        } else {
            let cap = self.config.max_jitter.as_millis() as u64;
            Duration::from_millis(rand::thread_rng().gen_range(0..=cap))
        };

        let computed = exponential + jitter;
        match advertised {
            Some(floor) if floor > computed => floor,
            _ => computed,
        }
    }
}
