// src/engine/violation.rs

use chrono::{DateTime, Utc};

use crate::engine::events::{HostEvent, Key};
use crate::models::block::BlockReason;
use crate::models::session::Lifecycle;

/// One detected attempt to leave or manipulate the exam context.
/// Ephemeral: consumed synchronously by the freeze controller, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViolationEvent {
    pub kind: BlockReason,
    pub at: DateTime<Utc>,
}

/// What the host should do with a key press, and whether it counts as a
/// violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDecision {
    /// Suppress the key's default behavior in the host.
    pub block_default: bool,
    pub violation: Option<BlockReason>,
}

/// Classifies a key press. Exit-intent keys are suppressed and raise a
/// violation; plain navigation keys are suppressed without raising one;
/// everything else passes through.
pub fn classify_key(key: Key) -> KeyDecision {
    match key {
        Key::Escape => KeyDecision {
            block_default: true,
            violation: Some(BlockReason::EscapeKey),
        },
        Key::Meta | Key::AppSwitch => KeyDecision {
            block_default: true,
            violation: Some(BlockReason::OsKey),
        },
        Key::F11 => KeyDecision {
            block_default: true,
            violation: Some(BlockReason::FullscreenExit),
        },
        Key::ArrowLeft | Key::ArrowRight | Key::Tab | Key::Backspace => KeyDecision {
            block_default: true,
            violation: None,
        },
        Key::Other => KeyDecision {
            block_default: false,
            violation: None,
        },
    }
}

/// Synthetic history buffer. A deep stack of entries is pushed on session
/// start so a back/forward gesture is absorbed by the buffer while still
/// being observed; each absorption is replenished, making the mechanism
/// durable across repeated attempts.
#[derive(Debug)]
pub struct HistoryGuard {
    depth: usize,
    entries: usize,
    absorbed: u32,
}

impl HistoryGuard {
    pub fn new(depth: usize) -> Self {
        // Seeded to full depth at session start.
        Self {
            depth,
            entries: depth,
            absorbed: 0,
        }
    }

    /// Absorbs one gesture: the entry consumed by it is immediately
    /// re-pushed so the buffer never thins out.
    pub fn absorb(&mut self) {
        self.absorbed += 1;
        self.entries = self.depth;
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn absorbed(&self) -> u32 {
        self.absorbed
    }
}

/// Last-known host facts, updated on every event. The unfreeze precondition
/// reads these rather than querying the host.
#[derive(Debug, Clone, Copy)]
pub struct HostState {
    pub hidden: bool,
    pub fullscreen: bool,
}

impl Default for HostState {
    // The engine starts only after the shell has foregrounded the exam and
    // engaged fullscreen.
    fn default() -> Self {
        Self {
            hidden: false,
            fullscreen: true,
        }
    }
}

/// Set of independent observers folding host events into violations.
#[derive(Debug)]
pub struct ViolationDetector {
    state: HostState,
    history: HistoryGuard,
    deliberate_navigation: bool,
}

impl ViolationDetector {
    pub fn new(history_depth: usize) -> Self {
        Self {
            state: HostState::default(),
            history: HistoryGuard::new(history_depth),
            deliberate_navigation: false,
        }
    }

    /// Feeds one host event through every observer. Returns the violation it
    /// raised, if any. State updates happen regardless of lifecycle so the
    /// unfreeze precondition always sees current facts.
    pub fn observe(&mut self, event: HostEvent, lifecycle: Lifecycle) -> Option<ViolationEvent> {
        let active = lifecycle == Lifecycle::Active;
        let kind = match event {
            HostEvent::VisibilityChanged { hidden } => {
                let was_hidden = self.state.hidden;
                self.state.hidden = hidden;
                // Raise only on the visible -> hidden edge.
                (active && hidden && !was_hidden).then_some(BlockReason::TabHidden)
            }
            HostEvent::FullscreenChanged { active: fs } => {
                self.state.fullscreen = fs;
                // While Frozen the missing-fullscreen banner only prompts
                // re-entry; it never raises a fresh violation.
                (active && !fs).then_some(BlockReason::FullscreenExit)
            }
            HostEvent::KeyDown(key) => {
                let decision = classify_key(key);
                decision.violation.filter(|_| active)
            }
            HostEvent::HistoryPop => {
                self.history.absorb();
                active.then_some(BlockReason::HistoryNav)
            }
            HostEvent::HistoryForward => {
                self.history.absorb();
                active.then_some(BlockReason::ForwardNav)
            }
            HostEvent::NavigationIntent => {
                self.deliberate_navigation = true;
                tracing::debug!("Deliberate outbound navigation flagged");
                None
            }
        };

        kind.map(|kind| ViolationEvent {
            kind,
            at: Utc::now(),
        })
    }

    pub fn host_state(&self) -> HostState {
        self.state
    }

    /// Whether teardown should also fire a block request. True only for an
    /// intentional outbound link activation, never for a crash or a dropped
    /// connection.
    pub fn deliberate_navigation(&self) -> bool {
        self.deliberate_navigation
    }

    pub fn history(&self) -> &HistoryGuard {
        &self.history
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_intent_keys_raise_and_suppress() {
        for (key, expected) in [
            (Key::Escape, BlockReason::EscapeKey),
            (Key::Meta, BlockReason::OsKey),
            (Key::AppSwitch, BlockReason::OsKey),
            (Key::F11, BlockReason::FullscreenExit),
        ] {
            let decision = classify_key(key);
            assert!(decision.block_default);
            assert_eq!(decision.violation, Some(expected));
        }
    }

    #[test]
    fn navigation_keys_suppress_without_raising() {
        for key in [Key::ArrowLeft, Key::ArrowRight, Key::Tab, Key::Backspace] {
            let decision = classify_key(key);
            assert!(decision.block_default);
            assert_eq!(decision.violation, None);
        }
    }

    #[test]
    fn ordinary_keys_pass_through() {
        let decision = classify_key(Key::Other);
        assert!(!decision.block_default);
        assert_eq!(decision.violation, None);
    }

    #[test]
    fn history_buffer_replenishes_after_absorption() {
        let mut guard = HistoryGuard::new(20);
        assert_eq!(guard.entries(), 20);
        for _ in 0..50 {
            guard.absorb();
            assert_eq!(guard.entries(), 20, "buffer must refill every time");
        }
        assert_eq!(guard.absorbed(), 50);
    }

    #[test]
    fn hidden_edge_raises_once() {
        let mut detector = ViolationDetector::new(20);
        let first = detector.observe(
            HostEvent::VisibilityChanged { hidden: true },
            Lifecycle::Active,
        );
        assert_eq!(first.map(|v| v.kind), Some(BlockReason::TabHidden));

        // Already hidden: a repeated hidden report is not a new edge.
        let second = detector.observe(
            HostEvent::VisibilityChanged { hidden: true },
            Lifecycle::Active,
        );
        assert!(second.is_none());
    }

    #[test]
    fn fullscreen_exit_ignored_while_frozen() {
        let mut detector = ViolationDetector::new(20);
        let raised = detector.observe(
            HostEvent::FullscreenChanged { active: false },
            Lifecycle::Frozen,
        );
        assert!(raised.is_none());
        // State still tracks the fact for the unfreeze precondition.
        assert!(!detector.host_state().fullscreen);

        let raised = detector.observe(
            HostEvent::FullscreenChanged { active: true },
            Lifecycle::Frozen,
        );
        assert!(raised.is_none());
        assert!(detector.host_state().fullscreen);
    }

    #[test]
    fn history_pop_raises_while_active_only() {
        let mut detector = ViolationDetector::new(20);
        let raised = detector.observe(HostEvent::HistoryPop, Lifecycle::Active);
        assert_eq!(raised.map(|v| v.kind), Some(BlockReason::HistoryNav));

        let raised = detector.observe(HostEvent::HistoryForward, Lifecycle::Frozen);
        assert!(raised.is_none());
        // Absorbed either way.
        assert_eq!(detector.history().absorbed(), 2);
    }

    #[test]
    fn navigation_intent_sets_flag_without_violation() {
        let mut detector = ViolationDetector::new(20);
        assert!(!detector.deliberate_navigation());
        let raised = detector.observe(HostEvent::NavigationIntent, Lifecycle::Active);
        assert!(raised.is_none());
        assert!(detector.deliberate_navigation());
    }
}
