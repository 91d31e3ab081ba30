// src/handlers/mod.rs

pub mod block;
pub mod session;

use axum::http::HeaderMap;
use sqlx::SqlitePool;

use crate::{error::AppError, models::session::SessionRow};

/// Extracts the caller identity from the `x-student-id` header.
///
/// Authentication itself lives outside this service; the portal's auth layer
/// resolves the cookie/JWT and forwards the opaque student id here.
pub fn student_id(headers: &HeaderMap) -> Result<String, AppError> {
    let value = headers
        .get("x-student-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing x-student-id header".to_string()))?;

    if value.len() > 100 {
        return Err(AppError::BadRequest("x-student-id too long".to_string()));
    }

    Ok(value.to_string())
}

/// Loads the session row for one (student, quiz) attempt, if any.
pub async fn fetch_session_row(
    pool: &SqlitePool,
    quiz_id: i64,
    student: &str,
) -> Result<Option<SessionRow>, AppError> {
    let row = sqlx::query_as::<_, SessionRow>(
        r#"
        SELECT id, quiz_id, student_id, current_question_index, answers,
               time_left_seconds, completed, has_progress, updated_at
        FROM sessions
        WHERE quiz_id = ? AND student_id = ?
        "#,
    )
    .bind(quiz_id)
    .bind(student)
    .fetch_optional(pool)
    .await
    .map_err(|e| {
        tracing::error!("Failed to fetch session row: {:?}", e);
        AppError::InternalServerError(e.to_string())
    })?;

    Ok(row)
}

/// Current wall clock, unix milliseconds. The authority clock is the one
/// all block expiries are issued against.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall clock, unix seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}
