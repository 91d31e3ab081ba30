// src/models/session.rs

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use validator::Validate;

use crate::models::quiz::QuizConfig;

/// Top-level state of one exam attempt.
///
/// `Completed` is terminal; once reached the session never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    Loading,
    Countdown,
    Active,
    Frozen,
    Submitting,
    Completed,
}

/// Save indicator state surfaced to the UI after each persistence attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveState {
    Idle,
    Saving,
    Saved,
    Error,
}

/// Represents the 'sessions' table: one row per (student, quiz) attempt.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub id: i64,
    pub quiz_id: i64,
    pub student_id: String,
    pub current_question_index: i64,

    /// JSON object mapping question id -> selected option.
    /// A question absent from the map is unanswered; empty strings are
    /// rejected at the API boundary.
    pub answers: String,

    pub time_left_seconds: i64,
    pub completed: bool,

    /// Whether a save-progress ever landed. Distinguishes "fresh attempt"
    /// from "resume" so the client knows to skip its start countdown.
    pub has_progress: bool,

    /// Unix seconds of the last write.
    pub updated_at: i64,
}

/// Saved progress returned on session fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub current_question_index: usize,
    pub answers: BTreeMap<i64, String>,
    pub time_left: i64,
}

/// Response body for `GET /api/quiz/{id}`.
///
/// `remaining_seconds` refers to the active block, 0 when unblocked.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionPayload {
    pub quiz: QuizConfig,
    pub progress: Option<Progress>,
    pub completed: bool,
    pub blocked: bool,
    pub remaining_seconds: i64,

    /// Reason behind the live block, when one exists. Audit/banner use only.
    #[serde(default)]
    pub block_reason: Option<crate::models::block::BlockReason>,
}

/// Body for `POST /api/quiz/{id}/save-progress`.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SaveProgressRequest {
    pub current_question_index: usize,

    #[validate(custom(function = validate_answers))]
    pub answers: BTreeMap<i64, String>,

    #[validate(range(min = 0))]
    pub time_left: i64,
}

fn validate_answers(answers: &BTreeMap<i64, String>) -> Result<(), validator::ValidationError> {
    for option in answers.values() {
        if option.is_empty() {
            // Unanswered must be absence, never an empty string.
            return Err(validator::ValidationError::new("empty_answer"));
        }
        if option.len() > 500 {
            return Err(validator::ValidationError::new("answer_too_long"));
        }
    }
    Ok(())
}

/// One entry of the submit body; `answer: None` marks an unanswered question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub question_id: i64,
    pub answer: Option<String>,
    pub subcategory: String,
}

/// Body for `POST /api/quiz/{id}/submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub answers: Vec<AnswerSubmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
}
