//! Core types for the scorer boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Everything the scorer needs to evaluate one answer.
///
/// The two context maps are ordered so that prompt rendering is
/// deterministic for a given request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoreRequest {
    /// Base instructions for the scoring model.
    pub system_prompt: String,
    /// Id of the question under evaluation (for logging/attribution only).
    pub question_id: String,
    pub question_text: String,
    /// The user's answer, rendered human-readable.
    pub answer_text: String,
    /// Question-specific extra instructions, if authored.
    #[serde(default)]
    pub additional_context: Option<String>,
    /// Business meta-information: question text -> readable answer.
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
    /// Dependent answers: question text -> readable answer.
    #[serde(default)]
    pub contextual_answers: BTreeMap<String, String>,
}

/// A successful evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutcome {
    /// Score in `[0, 100]`.
    pub score: f64,
    pub explanation: String,
}

/// Chat message role, as the wire format expects it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message sent to the scoring model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

impl ScoreRequest {
    pub fn new(
        system_prompt: impl Into<String>,
        question_id: impl Into<String>,
        question_text: impl Into<String>,
        answer_text: impl Into<String>,
    ) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            question_id: question_id.into(),
            question_text: question_text.into(),
            answer_text: answer_text.into(),
            additional_context: None,
            meta: BTreeMap::new(),
            contextual_answers: BTreeMap::new(),
        }
    }

    pub fn with_additional_context(mut self, context: impl Into<String>) -> Self {
        self.additional_context = Some(context.into());
        self
    }

    pub fn with_meta(mut self, label: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(label.into(), value.into());
        self
    }

    pub fn with_context_answer(
        mut self,
        label: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.contextual_answers.insert(label.into(), value.into());
        self
    }
}
