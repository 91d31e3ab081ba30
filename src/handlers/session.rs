// src/handlers/session.rs

use std::collections::{BTreeMap, HashSet};

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
};
use sqlx::SqlitePool;
use validator::Validate;

use crate::{
    error::AppError,
    handlers::{block::active_block, fetch_session_row, now_ms, now_secs, student_id},
    models::{
        block::{BlockReason, remaining_seconds},
        quiz::{PublicQuestion, Question, Quiz, QuizConfig},
        session::{Progress, SaveProgressRequest, SessionPayload, SubmitRequest, SubmitResponse},
    },
};

/// Loads the quiz with its questions, hidden behind the public DTO.
async fn load_quiz_config(pool: &SqlitePool, quiz_id: i64) -> Result<QuizConfig, AppError> {
    let quiz = sqlx::query_as::<_, Quiz>("SELECT id, title, duration_seconds FROM quizzes WHERE id = ?")
        .bind(quiz_id)
        .fetch_optional(pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch quiz {}: {:?}", quiz_id, e);
            AppError::InternalServerError(e.to_string())
        })?
        .ok_or_else(|| AppError::NotFound(format!("Quiz {} not found", quiz_id)))?;

    let questions = sqlx::query_as::<_, Question>(
        "SELECT id, quiz_id, content, options, subcategory FROM questions WHERE quiz_id = ? ORDER BY id",
    )
    .bind(quiz_id)
    .fetch_all(pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch questions for quiz {}: {:?}", quiz_id, e);
        AppError::InternalServerError(e.to_string())
    })?;

    let questions = questions
        .into_iter()
        .map(|q| PublicQuestion {
            id: q.id,
            content: q.content,
            options: q.options.0,
            subcategory: q.subcategory,
        })
        .collect();

    Ok(QuizConfig {
        id: quiz.id,
        title: quiz.title,
        duration_seconds: quiz.duration_seconds,
        questions,
    })
}

/// Fetches (and lazily creates) the session for one student's attempt.
///
/// This is the canonical resume path: the returned `progress` and
/// `remaining_seconds` always reflect the authority's clock, and the client
/// must reseed its local timer from them rather than any cached value.
pub async fn fetch_session(
    State(pool): State<SqlitePool>,
    Path(quiz_id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let student = student_id(&headers)?;
    let quiz = load_quiz_config(&pool, quiz_id).await?;

    let row = fetch_session_row(&pool, quiz_id, &student).await?;

    let (session_id, progress, completed) = match row {
        Some(row) => {
            let progress = if row.has_progress {
                let answers: BTreeMap<i64, String> = serde_json::from_str(&row.answers)
                    .map_err(|e| AppError::InternalServerError(e.to_string()))?;
                Some(Progress {
                    current_question_index: row.current_question_index.max(0) as usize,
                    answers,
                    time_left: row.time_left_seconds,
                })
            } else {
                None
            };
            (row.id, progress, row.completed)
        }
        None => {
            // First contact for this attempt: seed the canonical timer from
            // the quiz duration.
            let session_id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO sessions (quiz_id, student_id, time_left_seconds, updated_at)
                VALUES (?, ?, ?, ?)
                RETURNING id
                "#,
            )
            .bind(quiz_id)
            .bind(&student)
            .bind(quiz.duration_seconds)
            .bind(now_secs())
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create session: {:?}", e);
                AppError::InternalServerError(e.to_string())
            })?;
            (session_id, None, false)
        }
    };

    let block = active_block(&pool, session_id).await?;
    let remaining_seconds = block
        .as_ref()
        .map(|b| remaining_seconds(b.expires_at_ms, now_ms()))
        .unwrap_or(0);
    let block_reason = block.as_ref().and_then(|b| BlockReason::parse(&b.reason));

    Ok(Json(SessionPayload {
        quiz,
        progress,
        completed,
        blocked: remaining_seconds > 0,
        remaining_seconds,
        block_reason,
    }))
}

/// Persists answer progress for an in-flight attempt.
///
/// Last write wins; interactive, background, and teardown saves all land
/// here with the same payload.
pub async fn save_progress(
    State(pool): State<SqlitePool>,
    Path(quiz_id): Path<i64>,
    headers: HeaderMap,
    Json(payload): Json<SaveProgressRequest>,
) -> Result<impl IntoResponse, AppError> {
    if let Err(validation_errors) = payload.validate() {
        return Err(AppError::BadRequest(validation_errors.to_string()));
    }

    let student = student_id(&headers)?;

    let row = fetch_session_row(&pool, quiz_id, &student)
        .await?
        .ok_or_else(|| AppError::NotFound("No session for this attempt".to_string()))?;

    if row.completed {
        return Err(AppError::Conflict(
            "Attempt already submitted; progress is read-only".to_string(),
        ));
    }

    let question_ids = sqlx::query_scalar::<_, i64>("SELECT id FROM questions WHERE quiz_id = ?")
        .bind(quiz_id)
        .fetch_all(&pool)
        .await
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    if payload.current_question_index >= question_ids.len().max(1) {
        return Err(AppError::BadRequest(
            "current_question_index out of range".to_string(),
        ));
    }

    let known: HashSet<i64> = question_ids.into_iter().collect();
    if payload.answers.keys().any(|id| !known.contains(id)) {
        return Err(AppError::BadRequest(
            "Answer references a question outside this quiz".to_string(),
        ));
    }

    let answers_json = serde_json::to_string(&payload.answers)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    sqlx::query(
        r#"
        UPDATE sessions
        SET current_question_index = ?, answers = ?, time_left_seconds = ?,
            has_progress = 1, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(payload.current_question_index as i64)
    .bind(answers_json)
    .bind(payload.time_left)
    .bind(now_secs())
    .bind(row.id)
    .execute(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to save progress for session {}: {:?}", row.id, e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok(Json(serde_json::json!({ "saved": true })))
}

/// Finalizes an attempt. Idempotent: a second submit (timer-zero racing a
/// manual submit, or a retry) acknowledges without touching the record.
pub async fn submit_session(
    State(pool): State<SqlitePool>,
    Path(quiz_id): Path<i64>,
    headers: HeaderMap,
    Json(payload): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    let student = student_id(&headers)?;

    let row = fetch_session_row(&pool, quiz_id, &student)
        .await?
        .ok_or_else(|| AppError::NotFound("No session for this attempt".to_string()))?;

    if row.completed {
        tracing::info!(
            "Duplicate submit for session {} ignored (already completed)",
            row.id
        );
        return Ok(Json(SubmitResponse { success: true }));
    }

    // Store the final answer set in map form; None entries stay absent.
    let mut answers: BTreeMap<i64, String> = BTreeMap::new();
    for entry in &payload.answers {
        if let Some(answer) = &entry.answer {
            if !answer.is_empty() {
                answers.insert(entry.question_id, answer.clone());
            }
        }
    }
    let answers_json = serde_json::to_string(&answers)
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    sqlx::query(
        r#"
        UPDATE sessions
        SET answers = ?, completed = 1, has_progress = 1, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(answers_json)
    .bind(now_secs())
    .bind(row.id)
    .execute(&pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to finalize session {}: {:?}", row.id, e);
        AppError::InternalServerError(e.to_string())
    })?;

    // A completed attempt cannot stay blocked.
    sqlx::query("DELETE FROM blocks WHERE session_id = ?")
        .bind(row.id)
        .execute(&pool)
        .await
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    tracing::info!(
        "Session {} submitted by student {} with {} answered question(s)",
        row.id,
        student,
        answers.len()
    );

    Ok(Json(SubmitResponse { success: true }))
}
