//! Question-set data model and loading.
//!
//! A question set is a flat, ordered list of questions plus an ordered list of
//! calculation rule strings. Meta questions live in the same list (by
//! convention under a `MET.` id prefix) and are referenced through
//! `ai_context.include_meta`.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sentinel dependency meaning "every other answered question".
pub const ALL_ANSWERS: &str = "all";

/// Errors raised while loading a question set.
#[derive(Debug, Error)]
pub enum QuestionSetError {
    #[error("failed to read question set: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse question set: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("duplicate question id: {0}")]
    DuplicateId(String),
}

/// Kind of input a question accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuestionType {
    #[serde(rename = "yes-no")]
    YesNo,
    #[serde(rename = "choice-single")]
    ChoiceSingle,
    #[serde(rename = "choice-multi")]
    ChoiceMulti,
    #[serde(rename = "numeric")]
    Numeric,
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "textarea")]
    Textarea,
    /// Bookkeeping-only questions: indexed by id but excluded from
    /// dependency edges.
    #[serde(rename = "internal")]
    Internal,
}

/// A selectable option for choice-typed questions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionOption {
    pub code: String,
    pub label: String,
}

/// Which other answers flow into this question's scoring context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiContext {
    /// Ids whose answers are included as context. May contain [`ALL_ANSWERS`].
    #[serde(default)]
    pub include_answers: Vec<String>,
    /// Meta-question ids included as business context.
    #[serde(default)]
    pub include_meta: Vec<String>,
}

/// One questionnaire question. Immutable once the set is loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub position_in_cluster: Option<u32>,
    pub question_type: QuestionType,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
    /// Extra context appended to the evaluation prompt.
    #[serde(default)]
    pub prompt_add: Option<String>,
    #[serde(default)]
    pub ai_context: AiContext,
    /// Never triggers scoring; state waives the score requirement.
    #[serde(default)]
    pub score_exempt: bool,
}

impl Question {
    /// Authored answer dependencies, with the `all` sentinel filtered out
    /// (it contributes context at call time, not graph edges).
    pub fn answer_dependencies(&self) -> impl Iterator<Item = &str> {
        self.ai_context
            .include_answers
            .iter()
            .map(String::as_str)
            .filter(|id| *id != ALL_ANSWERS)
    }

    /// Whether the `all` sentinel is present in `include_answers`.
    pub fn includes_all_answers(&self) -> bool {
        self.ai_context
            .include_answers
            .iter()
            .any(|id| id == ALL_ANSWERS)
    }

    pub fn meta_dependencies(&self) -> impl Iterator<Item = &str> {
        self.ai_context.include_meta.iter().map(String::as_str)
    }
}

/// The loaded question set: ordered questions, indexed by id, plus the
/// ordered calculation rule strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionSet {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub questions: Vec<Question>,
    #[serde(default)]
    pub calculations: Vec<String>,
}

impl QuestionSet {
    /// Parse a question set from a JSON string, rejecting duplicate ids.
    pub fn from_json(raw: &str) -> Result<Self, QuestionSetError> {
        let set: QuestionSet = serde_json::from_str(raw)?;
        let mut seen: HashMap<&str, ()> = HashMap::with_capacity(set.questions.len());
        for q in &set.questions {
            if seen.insert(q.id.as_str(), ()).is_some() {
                return Err(QuestionSetError::DuplicateId(q.id.clone()));
            }
        }
        Ok(set)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, QuestionSetError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn find(&self, id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == id)
    }

    /// Position of a question in authoring order.
    pub fn position(&self, id: &str) -> Option<usize> {
        self.questions.iter().position(|q| q.id == id)
    }
}

// =============================================================================
// Answer values
// =============================================================================

/// Answers are untyped JSON values; the question type decides how they read.
pub type AnswerValue = serde_json::Value;

/// Whether an answer carries enough content to be evaluated.
///
/// A structured choice answer whose only selection is `other` with no
/// accompanying text is treated as not answered: there is nothing for the
/// scorer to read yet.
pub fn is_answered(value: &AnswerValue) -> bool {
    match value {
        AnswerValue::Null => false,
        AnswerValue::String(s) => !s.trim().is_empty(),
        AnswerValue::Array(items) => !items.is_empty(),
        AnswerValue::Number(_) | AnswerValue::Bool(_) => true,
        AnswerValue::Object(map) => {
            let main_selected = map
                .get("main")
                .map(|m| match m {
                    AnswerValue::Array(items) => {
                        items.iter().any(|i| i.as_str() != Some("other"))
                    }
                    AnswerValue::String(s) => !s.is_empty() && s != "other",
                    _ => false,
                })
                .unwrap_or(false);
            let other_text = map
                .get("other")
                .and_then(|o| o.as_str())
                .map(|s| !s.trim().is_empty())
                .unwrap_or(false);
            let other_chosen = map
                .get("main")
                .map(|m| match m {
                    AnswerValue::Array(items) => {
                        items.iter().any(|i| i.as_str() == Some("other"))
                    }
                    AnswerValue::String(s) => s == "other",
                    _ => false,
                })
                .unwrap_or(false);
            // "Other" without text contributes nothing; a main selection or
            // filled-in text does.
            main_selected || (other_chosen && other_text)
        }
    }
}

/// Render an answer the way a reader would see it, resolving option codes to
/// labels. Unknown shapes fall back to their JSON rendering.
pub fn readable_answer(question: &Question, value: &AnswerValue) -> String {
    match value {
        AnswerValue::Null => String::new(),
        AnswerValue::String(s) => {
            if question.question_type == QuestionType::YesNo {
                return if s == "yes" { "Yes".into() } else { "No".into() };
            }
            label_for_code(question, s).unwrap_or_else(|| s.clone())
        }
        AnswerValue::Array(items) => items
            .iter()
            .filter_map(|i| i.as_str())
            .map(|code| label_for_code(question, code).unwrap_or_else(|| code.to_string()))
            .collect::<Vec<_>>()
            .join(", "),
        AnswerValue::Number(n) => n.to_string(),
        AnswerValue::Bool(b) => if *b { "Yes" } else { "No" }.to_string(),
        AnswerValue::Object(map) => {
            let mut parts: Vec<String> = Vec::new();
            if let Some(AnswerValue::Array(items)) = map.get("main") {
                for code in items.iter().filter_map(|i| i.as_str()) {
                    if code == "other" {
                        continue;
                    }
                    parts.push(label_for_code(question, code).unwrap_or_else(|| code.to_string()));
                }
            }
            if let Some(text) = map.get("other").and_then(|o| o.as_str()) {
                if !text.trim().is_empty() {
                    parts.push(text.trim().to_string());
                }
            }
            if parts.is_empty() {
                value.to_string()
            } else {
                parts.join(", ")
            }
        }
    }
}

fn label_for_code(question: &Question, code: &str) -> Option<String> {
    question
        .options
        .iter()
        .find(|o| o.code == code)
        .map(|o| o.label.clone())
}
