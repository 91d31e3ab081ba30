// src/engine/freeze.rs

use std::time::{Duration, Instant};

use crate::models::block::{BlockReason, remaining_seconds};

/// The client-held copy of the penalty block. Created optimistically with a
/// conservative fallback expiry; the authority's response overwrites it
/// verbatim and wins every conflict.
#[derive(Debug, Clone, Copy)]
pub struct BlockRecord {
    pub reason: BlockReason,
    pub expires_at_ms: i64,

    /// False while only the local fallback expiry is known.
    pub confirmed: bool,
}

/// Owns the Active/Frozen transition bookkeeping: the one live block record,
/// the request re-arm window, and reconciliation of authority responses.
#[derive(Debug)]
pub struct FreezeController {
    record: Option<BlockRecord>,
    rearm_window: Duration,
    fallback: Duration,

    /// When the last block request was issued; requests inside the re-arm
    /// window are suppressed as duplicates of the same violation.
    last_request_at: Option<Instant>,

    /// When the last authority-confirmed expiry landed. Poll responses
    /// issued before this instant are stale and dropped.
    confirmed_at: Option<Instant>,
}

impl FreezeController {
    pub fn new(rearm_window: Duration, fallback: Duration) -> Self {
        Self {
            record: None,
            rearm_window,
            fallback,
            last_request_at: None,
            confirmed_at: None,
        }
    }

    /// Registers a violation. Ensures a block record exists (fallback expiry
    /// until confirmed) and decides whether a block request should be sent:
    /// repeats within the re-arm window reuse the in-flight one.
    pub fn engage(&mut self, kind: BlockReason, now_ms: i64) -> bool {
        if self.record.is_none() {
            self.record = Some(BlockRecord {
                reason: kind,
                expires_at_ms: now_ms + self.fallback.as_millis() as i64,
                confirmed: false,
            });
        }

        if let Some(last) = self.last_request_at {
            if last.elapsed() < self.rearm_window {
                tracing::debug!("Duplicate violation within re-arm window, request suppressed");
                return false;
            }
        }
        self.last_request_at = Some(Instant::now());
        true
    }

    /// Re-seeds the record from a session fetch that reported a live block.
    /// Authority data, so it arrives pre-confirmed.
    pub fn resume(&mut self, reason: BlockReason, expires_at_ms: i64) {
        self.record = Some(BlockRecord {
            reason,
            expires_at_ms,
            confirmed: true,
        });
        self.confirmed_at = Some(Instant::now());
    }

    /// Adopts an authority-issued expiry verbatim. Never recomputed locally.
    pub fn confirm(&mut self, expires_at_ms: i64) {
        if let Some(record) = &mut self.record {
            record.expires_at_ms = expires_at_ms;
            record.confirmed = true;
            self.confirmed_at = Some(Instant::now());
        }
    }

    /// Called when the block request itself failed. The conservative
    /// fallback expiry stands; unfreezing early would be worse than an
    /// over-long freeze.
    pub fn request_failed(&mut self) {
        if let Some(record) = &self.record {
            tracing::error!(
                "Block request failed; holding fallback expiry at {}",
                record.expires_at_ms
            );
        }
    }

    /// Reconciles a block-status poll. The pull path is confirmatory only:
    /// a poll issued before the newest confirmation is stale and dropped,
    /// and a confirmed expiry is never overwritten. The one exception is an
    /// unconfirmed (fallback) record, which adopts the authority's value.
    pub fn reconcile_poll(&mut self, poll_remaining_seconds: i64, polled_at: Instant, now_ms: i64) {
        let Some(record) = &mut self.record else {
            return;
        };

        if let Some(confirmed_at) = self.confirmed_at {
            if polled_at < confirmed_at {
                tracing::debug!("Dropping stale block-status poll");
                return;
            }
        }

        if !record.confirmed {
            // A zero here means the authority knows of no block (the block
            // request itself likely failed); the conservative fallback
            // window stands rather than unfreezing early.
            if poll_remaining_seconds > 0 {
                record.expires_at_ms = now_ms + poll_remaining_seconds * 1000;
                record.confirmed = true;
                self.confirmed_at = Some(Instant::now());
            }
            return;
        }

        let local = remaining_seconds(record.expires_at_ms, now_ms);
        if (local - poll_remaining_seconds).abs() > 2 {
            tracing::warn!(
                "Block countdown drift: local {}s vs authority {}s",
                local,
                poll_remaining_seconds
            );
        }
    }

    /// Display countdown, always re-derived from the absolute expiry.
    pub fn remaining(&self, now_ms: i64) -> i64 {
        self.record
            .map(|r| remaining_seconds(r.expires_at_ms, now_ms))
            .unwrap_or(0)
    }

    pub fn record(&self) -> Option<&BlockRecord> {
        self.record.as_ref()
    }

    /// Re-issues the local penalty window after a failed unfreeze when the
    /// grace action keeps the session frozen instead of submitting it.
    pub fn refreeze(&mut self, now_ms: i64) -> Option<BlockReason> {
        let record = self.record.as_mut()?;
        record.expires_at_ms = now_ms + self.fallback.as_millis() as i64;
        record.confirmed = false;
        Some(record.reason)
    }

    pub fn clear(&mut self) {
        self.record = None;
    }
}
