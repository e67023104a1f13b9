//! OpenAI-compatible adapter for answer scoring.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::prompts;

use super::error::ScorerError;
use super::types::{Message, ScoreOutcome, ScoreRequest};

// =============================================================================
// TRAIT
// =============================================================================

/// A single scoring attempt against the external model.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, req: &ScoreRequest) -> Result<ScoreOutcome, ScorerError>;
}

// =============================================================================
// OPENAI ADAPTER
// =============================================================================

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

const DEFAULT_MODEL: &str = "gpt-4-1106-preview";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_MAX_TOKENS: u32 = 1024;

/// Adapter for an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiAdapter {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl OpenAiAdapter {
    /// Create from API key with production defaults.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ScorerError> {
        Self::with_config(
            api_key,
            "https://api.openai.com/v1",
            DEFAULT_MODEL,
            Duration::from_secs(120),
        )
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ScorerError> {
        let api_key = std::env::var("SCOREFLOW_API_KEY")
            .map_err(|_| ScorerError::config("SCOREFLOW_API_KEY not set"))?;

        let base_url = std::env::var("SCOREFLOW_BASE_URL")
            .unwrap_or_else(|_| "https://api.openai.com/v1".into());

        let model = std::env::var("SCOREFLOW_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.into());

        let timeout = std::env::var("SCOREFLOW_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Self::with_config(api_key, base_url, model, timeout)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ScorerError> {
        let api_key = api_key.into();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ScorerError::config("invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ScorerError::config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        })
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    /// Minimum wait advertised by the provider on a 429, if any.
    fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        if let Some(ms) = headers
            .get("retry-after-ms")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
        {
            return Some(Duration::from_millis(ms));
        }
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
}

#[derive(Deserialize)]
struct ScoreJson {
    score: Option<f64>,
    explanation: Option<String>,
}

// =============================================================================
// RESPONSE PARSING
// =============================================================================

/// Parse model output into a [`ScoreOutcome`].
///
/// The content should be a bare JSON object, but models sometimes wrap it in
/// prose; the first balanced object is extracted before parsing. Scores
/// outside `[0, 100]` are rejected as invalid responses.
pub fn parse_score_content(raw: &str) -> Result<ScoreOutcome, ScorerError> {
    let json_str = extract_json(raw);
    let parsed: ScoreJson = serde_json::from_str(json_str)
        .map_err(|e| ScorerError::invalid_response(format!("not a score object: {e}")))?;

    let score = parsed
        .score
        .ok_or_else(|| ScorerError::invalid_response("missing 'score'"))?;
    if !score.is_finite() || !(0.0..=100.0).contains(&score) {
        return Err(ScorerError::invalid_response(format!(
            "score out of range [0,100]: {score}"
        )));
    }

    let explanation = parsed
        .explanation
        .ok_or_else(|| ScorerError::invalid_response("missing 'explanation'"))?;

    Ok(ScoreOutcome { score, explanation })
}

/// Extract the first balanced JSON object from a response.
fn extract_json(raw: &str) -> &str {
    let trimmed = raw.trim();
    if let Some(start) = trimmed.find('{') {
        let remainder = &trimmed[start..];
        let mut depth = 0;
        for (i, c) in remainder.char_indices() {
            match c {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &remainder[..=i];
                    }
                }
                _ => {}
            }
        }
    }
    trimmed
}

// =============================================================================
// SCORER IMPL
// =============================================================================

#[async_trait]
impl Scorer for OpenAiAdapter {
    async fn score(&self, req: &ScoreRequest) -> Result<ScoreOutcome, ScorerError> {
        let prompt = prompts::render(req);
        let messages = prompt.to_messages();

        let api_req = ChatApiRequest {
            model: &self.model,
            messages: &messages,
            temperature: DEFAULT_TEMPERATURE,
            max_tokens: DEFAULT_MAX_TOKENS,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let retry_after = Self::retry_after(response.headers());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ScorerError::provider(format!(
                    "response too large: {new_len} bytes"
                )));
            }
            bytes.extend_from_slice(&chunk);
        }
        let body = String::from_utf8_lossy(&bytes).to_string();

        if !status.is_success() {
            let message = serde_json::from_str::<ChatApiResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

            return Err(match status.as_u16() {
                429 => ScorerError::RateLimited { retry_after },
                401 | 403 => ScorerError::auth(message),
                400 | 404 | 422 => ScorerError::invalid_request(message),
                _ => ScorerError::provider(message),
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body)
            .map_err(|e| ScorerError::invalid_response(format!("invalid JSON body: {e}")))?;

        if let Some(error) = parsed.error {
            return Err(ScorerError::provider(error.message.unwrap_or_default()));
        }

        let content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| ScorerError::invalid_response("no content in response"))?;

        parse_score_content(&content)
    }
}
