//! Prompt rendering for answer evaluation.
//!
//! Turns a [`ScoreRequest`] into the system/user message pair sent to the
//! scoring model. Provider-agnostic: the adapter decides transport details.

use crate::scorer::types::{Message, ScoreRequest};

/// Fallback instructions when the question set ships no prompt of its own.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are an experienced business analyst evaluating \
questionnaire answers. Score each answer for completeness, credibility, and risk on a 0-100 \
scale, where 0 is a disqualifying answer and 100 is a fully satisfactory one.";

/// Instruction appended to every user prompt so the response stays machine
/// readable.
const RESPONSE_FORMAT_INSTRUCTION: &str =
    "Return ONLY a single JSON object with 'score' (0-100) and 'explanation' (string) keys.";

/// Rendered prompt ready for the model.
#[derive(Debug, Clone)]
pub struct PromptInstance {
    pub system: String,
    pub user: String,
}

impl PromptInstance {
    pub fn to_messages(&self) -> Vec<Message> {
        vec![Message::system(&self.system), Message::user(&self.user)]
    }
}

/// Render the evaluation prompt. Sections with no content are omitted so the
/// model is not shown empty headings.
pub fn render(req: &ScoreRequest) -> PromptInstance {
    let system = if req.system_prompt.trim().is_empty() {
        DEFAULT_SYSTEM_PROMPT.to_string()
    } else {
        req.system_prompt.clone()
    };

    let mut user = String::from(
        "Based on the following context, please evaluate the provided answer.\n",
    );

    if let Some(extra) = req.additional_context.as_deref() {
        if !extra.trim().is_empty() {
            user.push_str("\nAdditional Question Context:\n");
            user.push_str(extra.trim());
            user.push('\n');
        }
    }

    if !req.meta.is_empty() {
        user.push_str("\nBusiness Meta-Information:\n");
        for (label, value) in &req.meta {
            user.push_str(&format!("- {label}: {value}\n"));
        }
    }

    if !req.contextual_answers.is_empty() {
        user.push_str("\nDependent Answers Context:\n");
        for (label, value) in &req.contextual_answers {
            user.push_str(&format!("- {label}: {value}\n"));
        }
    }

    user.push_str("\nQuestion:\n");
    user.push_str(&req.question_text);
    user.push_str("\n\nUser's Answer:\n");
    user.push_str(&req.answer_text);
    user.push_str("\n\n");
    user.push_str(RESPONSE_FORMAT_INSTRUCTION);

    PromptInstance { system, user }
}
