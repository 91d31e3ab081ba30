// src/models/block.rs

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Why a session was frozen. Stored on the authority for audit and echoed
/// back to the client in block responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    FullscreenExit,
    TabHidden,
    EscapeKey,
    OsKey,
    HistoryNav,
    ForwardNav,
    DeliberateNavigation,
    StudentLogout,
}

impl BlockReason {
    /// Stable string form used as the database column value.
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::FullscreenExit => "fullscreen_exit",
            BlockReason::TabHidden => "tab_hidden",
            BlockReason::EscapeKey => "escape_key",
            BlockReason::OsKey => "os_key",
            BlockReason::HistoryNav => "history_nav",
            BlockReason::ForwardNav => "forward_nav",
            BlockReason::DeliberateNavigation => "deliberate_navigation",
            BlockReason::StudentLogout => "student_logout",
        }
    }

    /// Inverse of [`as_str`](Self::as_str), for rows read back from the
    /// database.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fullscreen_exit" => Some(BlockReason::FullscreenExit),
            "tab_hidden" => Some(BlockReason::TabHidden),
            "escape_key" => Some(BlockReason::EscapeKey),
            "os_key" => Some(BlockReason::OsKey),
            "history_nav" => Some(BlockReason::HistoryNav),
            "forward_nav" => Some(BlockReason::ForwardNav),
            "deliberate_navigation" => Some(BlockReason::DeliberateNavigation),
            "student_logout" => Some(BlockReason::StudentLogout),
            _ => None,
        }
    }
}

/// Represents the 'blocks' table: at most one live row per session.
#[derive(Debug, Clone, FromRow)]
pub struct BlockRow {
    pub id: i64,
    pub session_id: i64,
    pub reason: String,

    /// Absolute authority-issued expiry, unix milliseconds.
    pub expires_at_ms: i64,

    pub created_at: i64,
}

/// Body for `POST /api/quiz/{id}/block`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockRequest {
    pub reason: BlockReason,
}

/// Response for `POST /api/quiz/{id}/block`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockResponse {
    /// Absolute expiry, unix milliseconds. Clients adopt this verbatim.
    pub expires_at: i64,
    pub remaining_seconds: i64,
}

/// Response for `GET /api/quiz/{id}/block-status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStatus {
    pub remaining_seconds: i64,
}

/// Remaining whole seconds of a block, derived from the absolute expiry.
///
/// Countdowns must always be re-derived this way; decrementing a cached
/// integer drifts under suspended or throttled execution.
pub fn remaining_seconds(expires_at_ms: i64, now_ms: i64) -> i64 {
    let diff = expires_at_ms - now_ms;
    if diff <= 0 {
        return 0;
    }
    // Round to the nearest second so 1001ms..1499ms still display as 1s.
    (diff + 500) / 1000
}
