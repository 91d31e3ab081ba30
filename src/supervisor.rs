// src/supervisor.rs
//
// Bridge to the privileged supervisor process that owns the OS window. The
// engine notifies it of lifecycle events; the supervisor enforces
// locked-window mode, refuses window close while a session is live, and
// pushes back an exit-attempted notification whenever it intercepts a close
// gesture.

use tokio::sync::{mpsc, oneshot};

use crate::error::EngineError;
use crate::models::block::BlockReason;

/// Answer to an explicit exit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDecision {
    Permitted,
    Denied,
}

/// Pushed from the supervisor to the session that owns the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorEvent {
    /// An OS-level close gesture was intercepted while locked.
    ExitAttempted,
}

enum SupervisorMsg {
    Register {
        ack: oneshot::Sender<Registration>,
    },
    SessionStarted {
        session: u64,
        ack: oneshot::Sender<()>,
    },
    SessionBlocked {
        session: u64,
        reason: BlockReason,
        ack: oneshot::Sender<()>,
    },
    SessionSubmitted {
        session: u64,
        ack: oneshot::Sender<()>,
    },
    RequestExit {
        session: u64,
        ack: oneshot::Sender<ExitDecision>,
    },
    WindowCloseRequested {
        ack: oneshot::Sender<bool>,
    },
}

struct Registration {
    session: u64,
    events: mpsc::Receiver<SupervisorEvent>,
}

/// Cloneable client half of the bridge. The window shell uses it to route
/// close gestures; the engine uses it once to register its session.
#[derive(Clone)]
pub struct SupervisorClient {
    tx: mpsc::Sender<SupervisorMsg>,
}

impl SupervisorClient {
    /// Issues a session-scoped handle. There is deliberately no process-wide
    /// "a session is active" flag: the handle's id is what the supervisor
    /// tracks and invalidates.
    pub async fn register_session(&self) -> Result<SupervisorHandle, EngineError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMsg::Register { ack })
            .await
            .map_err(|_| EngineError::Internal("supervisor unavailable".to_string()))?;
        let registration = rx
            .await
            .map_err(|_| EngineError::Internal("supervisor dropped registration".to_string()))?;

        Ok(SupervisorHandle {
            session: registration.session,
            tx: self.tx.clone(),
            events: Some(registration.events),
        })
    }

    /// Called by the window shell when the OS close gesture fires. Returns
    /// whether the close may proceed.
    pub async fn window_close_requested(&self) -> Result<bool, EngineError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMsg::WindowCloseRequested { ack })
            .await
            .map_err(|_| EngineError::Internal("supervisor unavailable".to_string()))?;
        rx.await
            .map_err(|_| EngineError::Internal("supervisor dropped close decision".to_string()))
    }
}

/// Session-scoped handle held by the engine for the duration of one attempt.
pub struct SupervisorHandle {
    session: u64,
    tx: mpsc::Sender<SupervisorMsg>,
    events: Option<mpsc::Receiver<SupervisorEvent>>,
}

impl SupervisorHandle {
    async fn acked(&self, msg: SupervisorMsg, rx: oneshot::Receiver<()>) -> Result<(), EngineError> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| EngineError::Internal("supervisor unavailable".to_string()))?;
        rx.await
            .map_err(|_| EngineError::Internal("supervisor dropped acknowledgment".to_string()))
    }

    /// Enters locked-window mode: destructive close disabled, OS shortcut
    /// suppression on.
    pub async fn notify_started(&self) -> Result<(), EngineError> {
        let (ack, rx) = oneshot::channel();
        self.acked(
            SupervisorMsg::SessionStarted {
                session: self.session,
                ack,
            },
            rx,
        )
        .await
    }

    /// Audit-only: the supervisor logs the violation, mode is unchanged.
    pub async fn notify_blocked(&self, reason: BlockReason) -> Result<(), EngineError> {
        let (ack, rx) = oneshot::channel();
        self.acked(
            SupervisorMsg::SessionBlocked {
                session: self.session,
                reason,
                ack,
            },
            rx,
        )
        .await
    }

    /// Leaves locked-window mode and invalidates this handle's session.
    pub async fn notify_submitted(&self) -> Result<(), EngineError> {
        let (ack, rx) = oneshot::channel();
        self.acked(
            SupervisorMsg::SessionSubmitted {
                session: self.session,
                ack,
            },
            rx,
        )
        .await
    }

    pub async fn request_exit(&self) -> Result<ExitDecision, EngineError> {
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMsg::RequestExit {
                session: self.session,
                ack,
            })
            .await
            .map_err(|_| EngineError::Internal("supervisor unavailable".to_string()))?;
        rx.await
            .map_err(|_| EngineError::Internal("supervisor dropped exit decision".to_string()))
    }

    /// Moves the inbound push channel out so the engine can select on it
    /// next to its own queues. `None` once taken.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SupervisorEvent>> {
        self.events.take()
    }
}

struct ActiveSession {
    id: u64,
    events: mpsc::Sender<SupervisorEvent>,
    locked: bool,
}

/// The supervisor task itself.
pub struct Supervisor;

impl Supervisor {
    pub fn spawn() -> SupervisorClient {
        let (tx, mut rx) = mpsc::channel::<SupervisorMsg>(32);

        tokio::spawn(async move {
            let mut next_id: u64 = 1;
            let mut active: Option<ActiveSession> = None;

            while let Some(msg) = rx.recv().await {
                match msg {
                    SupervisorMsg::Register { ack } => {
                        // Re-registration is the crash-recovery path; evicting
                        // a session that is still locked unlocks the window,
                        // which deserves a loud trace.
                        if let Some(prev) = &active {
                            if prev.locked {
                                tracing::warn!(
                                    "Evicting still-locked session {} for a new registration",
                                    prev.id
                                );
                            }
                        }
                        let id = next_id;
                        next_id += 1;
                        let (events_tx, events_rx) = mpsc::channel(16);
                        active = Some(ActiveSession {
                            id,
                            events: events_tx,
                            locked: false,
                        });
                        tracing::info!("Supervisor registered session {}", id);
                        let _ = ack.send(Registration {
                            session: id,
                            events: events_rx,
                        });
                    }
                    SupervisorMsg::SessionStarted { session, ack } => {
                        match &mut active {
                            Some(a) if a.id == session => {
                                a.locked = true;
                                tracing::info!(
                                    "Session {} started: entering locked-window mode",
                                    session
                                );
                            }
                            _ => {
                                tracing::warn!(
                                    "Ignoring session-started from stale session {}",
                                    session
                                );
                            }
                        }
                        let _ = ack.send(());
                    }
                    SupervisorMsg::SessionBlocked {
                        session,
                        reason,
                        ack,
                    } => {
                        // Audit trail only; the window stays locked.
                        tracing::warn!(
                            "Session {} blocked: {}",
                            session,
                            reason.as_str()
                        );
                        let _ = ack.send(());
                    }
                    SupervisorMsg::SessionSubmitted { session, ack } => {
                        match &active {
                            Some(a) if a.id == session => {
                                tracing::info!(
                                    "Session {} submitted: leaving locked-window mode",
                                    session
                                );
                                active = None;
                            }
                            _ => {
                                tracing::warn!(
                                    "Ignoring session-submitted from stale session {}",
                                    session
                                );
                            }
                        }
                        let _ = ack.send(());
                    }
                    SupervisorMsg::RequestExit { session, ack } => {
                        let decision = match &active {
                            Some(a) if a.locked => ExitDecision::Denied,
                            _ => ExitDecision::Permitted,
                        };
                        tracing::info!(
                            "Exit requested by session {}: {:?}",
                            session,
                            decision
                        );
                        let _ = ack.send(decision);
                    }
                    SupervisorMsg::WindowCloseRequested { ack } => {
                        let allow = match &active {
                            Some(a) if a.locked => {
                                tracing::warn!(
                                    "Window close intercepted while session {} is active",
                                    a.id
                                );
                                // Best-effort push; the session may already
                                // be tearing down.
                                let _ = a.events.try_send(SupervisorEvent::ExitAttempted);
                                false
                            }
                            _ => true,
                        };
                        let _ = ack.send(allow);
                    }
                }
            }
        });

        SupervisorClient { tx }
    }
}
