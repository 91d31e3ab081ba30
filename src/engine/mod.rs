// src/engine/mod.rs
//
// Client-side exam-session integrity engine: an event-driven state machine
// composing the timer, the persistence channel, the violation detector, and
// the freeze controller. The Time Authority stays the source of truth for
// the timer and block state; everything here is an advisory mirror of it.

pub mod channel;
pub mod events;
pub mod freeze;
pub mod session;
pub mod timer;
pub mod violation;

use std::time::Duration;

use crate::config::{COUNTDOWN_TICKS, HISTORY_BUFFER_DEPTH};

pub use channel::{AuthorityChannel, HttpAuthorityChannel};
pub use events::{HostEvent, Key};
pub use session::{EngineHandle, EngineSnapshot, Navigation, SessionEngine};

/// What to do when a frozen session reaches expiry while the student is
/// neither watching the exam nor in fullscreen.
///
/// `Submit` is the shipped policy; `Refreeze` re-issues the penalty window
/// instead of forfeiting the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceAction {
    Submit,
    Refreeze,
}

/// Timing knobs for one engine instance. Defaults mirror production; tests
/// shrink them to keep runs fast.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Period of the single countdown tick.
    pub tick: Duration,

    /// Period of the background save while Active.
    pub autosave_every: Duration,

    /// Window during which repeated violation events reuse the in-flight
    /// block request instead of issuing another.
    pub rearm_window: Duration,

    /// Block-status poll period while Frozen.
    pub poll_every: Duration,

    /// Ticks of the pre-exam countdown for fresh attempts.
    pub countdown_ticks: u32,

    /// Depth of the synthetic history buffer.
    pub history_depth: usize,

    /// Conservative local block length assumed when the block request itself
    /// fails; never shorter than what the authority would issue.
    pub fallback_block: Duration,

    pub grace_action: GraceAction,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            autosave_every: Duration::from_secs(5),
            rearm_window: Duration::from_secs(5),
            poll_every: Duration::from_secs(5),
            countdown_ticks: COUNTDOWN_TICKS,
            history_depth: HISTORY_BUFFER_DEPTH,
            fallback_block: Duration::from_secs(300),
            grace_action: GraceAction::Submit,
        }
    }
}
