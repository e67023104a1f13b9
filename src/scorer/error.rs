//! Error types for the scorer boundary.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when calling the external scorer.
#[derive(Debug, Error)]
pub enum ScorerError {
    /// Rate limited. `retry_after` carries the provider-advertised minimum
    /// wait, when one was given.
    #[error("rate limited, advertised retry_after: {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    /// The response did not parse as the expected `{score, explanation}`
    /// structure, or the score was out of range. Retriable: the scorer is
    /// non-deterministic and may produce a well-formed answer next time.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Authorization failure. Permanent.
    #[error("authorization failed: {0}")]
    Auth(String),

    /// Malformed request. Permanent.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Upstream provider failure that is not worth retrying here.
    #[error("provider error: {0}")]
    Provider(String),

    /// HTTP/network error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error (missing API key, bad base URL, ...).
    #[error("configuration error: {0}")]
    Config(String),
}

impl ScorerError {
    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::InvalidResponse(message.into())
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::Provider(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether another attempt can change the outcome. Only rate limiting and
    /// malformed model output qualify; everything else fails immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::InvalidResponse(_)
        )
    }

    /// Provider-advertised minimum wait before the next attempt, if any.
    pub fn advertised_retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Short error code for logging and per-question failure flags.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Auth(_) => "auth_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Provider(_) => "provider_error",
            Self::Http(_) => "http_error",
            Self::Config(_) => "config_error",
        }
    }
}
