// src/handlers/block.rs

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
};
use sqlx::SqlitePool;

use crate::{
    config::Config,
    error::AppError,
    handlers::{fetch_session_row, now_ms, now_secs, student_id},
    models::block::{BlockRequest, BlockResponse, BlockRow, BlockStatus, remaining_seconds},
};

/// The session's live block row, if any, clearing expired rows lazily on
/// the way.
pub async fn active_block(pool: &SqlitePool, session_id: i64) -> Result<Option<BlockRow>, AppError> {
    sqlx::query("DELETE FROM blocks WHERE session_id = ? AND expires_at_ms <= ?")
        .bind(session_id)
        .bind(now_ms())
        .execute(pool)
        .await
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    let row = sqlx::query_as::<_, BlockRow>(
        "SELECT id, session_id, reason, expires_at_ms, created_at FROM blocks WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    Ok(row)
}

/// Creates (or renews) the penalty block for a violation.
///
/// The expiry is issued against the authority's clock and returned as an
/// absolute timestamp; clients adopt it verbatim and derive their countdown
/// from it.
pub async fn create_block(
    State(pool): State<SqlitePool>,
    State(config): State<Config>,
    Path(quiz_id): Path<i64>,
    headers: HeaderMap,
    Json(payload): Json<BlockRequest>,
) -> Result<impl IntoResponse, AppError> {
    let student = student_id(&headers)?;

    let row = fetch_session_row(&pool, quiz_id, &student)
        .await?
        .ok_or_else(|| AppError::NotFound("No session for this attempt".to_string()))?;

    if row.completed {
        return Err(AppError::Conflict(
            "Attempt already submitted; nothing to block".to_string(),
        ));
    }

    let expires_at = now_ms() + config.block_duration_seconds * 1000;

    // One live row per session: a violation during an existing block renews
    // the window rather than stacking a second record.
    sqlx::query("DELETE FROM blocks WHERE session_id = ?")
        .bind(row.id)
        .execute(&pool)
        .await
        .map_err(|e| AppError::InternalServerError(e.to_string()))?;

    sqlx::query("INSERT INTO blocks (session_id, reason, expires_at_ms, created_at) VALUES (?, ?, ?, ?)")
        .bind(row.id)
        .bind(payload.reason.as_str())
        .bind(expires_at)
        .bind(now_secs())
        .execute(&pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to record block for session {}: {:?}", row.id, e);
            AppError::InternalServerError(e.to_string())
        })?;

    tracing::warn!(
        "Session {} blocked for student {}: {} ({}s)",
        row.id,
        student,
        payload.reason.as_str(),
        config.block_duration_seconds
    );

    Ok(Json(BlockResponse {
        expires_at,
        remaining_seconds: remaining_seconds(expires_at, now_ms()),
    }))
}

/// Read-only block cross-check, polled by frozen clients. Never extends or
/// shortens the window.
pub async fn block_status(
    State(pool): State<SqlitePool>,
    Path(quiz_id): Path<i64>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let student = student_id(&headers)?;

    let row = fetch_session_row(&pool, quiz_id, &student)
        .await?
        .ok_or_else(|| AppError::NotFound("No session for this attempt".to_string()))?;

    let remaining = active_block(&pool, row.id)
        .await?
        .map(|b| remaining_seconds(b.expires_at_ms, now_ms()))
        .unwrap_or(0);

    Ok(Json(BlockStatus {
        remaining_seconds: remaining,
    }))
}
