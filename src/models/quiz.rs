// src/models/quiz.rs

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::types::Json;

/// Represents the 'quizzes' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Quiz {
    pub id: i64,
    pub title: String,

    /// Total answering time granted for one attempt, in seconds.
    pub duration_seconds: i64,
}

/// Represents the 'questions' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,
    pub quiz_id: i64,

    /// The text content of the question.
    pub content: String,

    /// List of options (e.g., ["Option A", "Option B"]).
    /// Stored as a JSON array in the database.
    pub options: Json<Vec<String>>,

    /// Reporting bucket the question belongs to; echoed back on submit.
    pub subcategory: String,
}

/// DTO for sending a question to the exam client (no storage noise).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicQuestion {
    pub id: i64,
    pub content: String,
    pub options: Vec<String>,
    pub subcategory: String,
}

/// Quiz payload embedded in the session fetch response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizConfig {
    pub id: i64,
    pub title: String,
    pub duration_seconds: i64,
    pub questions: Vec<PublicQuestion>,
}
