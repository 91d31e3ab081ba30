// src/engine/events.rs

/// Facts reported by whatever host shell embeds the engine (browser page,
/// desktop webview). The engine never touches the DOM or the OS itself; it
/// only consumes these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// The page/document visibility flipped.
    VisibilityChanged { hidden: bool },

    /// A fullscreen element appeared or went away.
    FullscreenChanged { active: bool },

    /// A key was pressed while the exam had focus.
    KeyDown(Key),

    /// A back gesture landed on one of the synthetic history entries.
    HistoryPop,

    /// A forward gesture landed on one of the synthetic history entries.
    HistoryForward,

    /// The student activated an outbound link away from the exam route.
    /// Consulted at teardown; not a violation on its own.
    NavigationIntent,
}

/// Keys the host forwards to the engine. Anything it does not recognize
/// arrives as `Other` and passes through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Escape,
    /// OS super/meta key.
    Meta,
    /// Manual fullscreen toggle.
    F11,
    /// App-switch combination (Alt+Tab and friends).
    AppSwitch,
    ArrowLeft,
    ArrowRight,
    Tab,
    Backspace,
    Other,
}
