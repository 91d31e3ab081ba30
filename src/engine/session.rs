// src/engine/session.rs

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};

use crate::engine::channel::AuthorityChannel;
use crate::engine::events::HostEvent;
use crate::engine::freeze::FreezeController;
use crate::engine::timer::TickGuard;
use crate::engine::violation::{ViolationDetector, ViolationEvent};
use crate::engine::{EngineConfig, GraceAction};
use crate::error::EngineError;
use crate::models::block::{BlockReason, BlockResponse, BlockStatus};
use crate::models::session::{
    AnswerSubmission, Lifecycle, SaveProgressRequest, SaveState, SubmitRequest, SubmitResponse,
};
use crate::supervisor::{ExitDecision, SupervisorEvent, SupervisorHandle};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Explicit question navigation requested by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Navigation {
    Next,
    Prev,
    Jump(usize),
}

/// Read-only view of the engine's state, served on request.
#[derive(Debug, Clone)]
pub struct EngineSnapshot {
    pub lifecycle: Lifecycle,
    pub current_question_index: usize,
    pub answers: BTreeMap<i64, String>,
    pub time_left_seconds: i64,
    pub save_state: SaveState,
    pub completed: bool,

    /// Frozen countdown, re-derived from the block expiry.
    pub block_remaining_seconds: i64,

    /// OS-level close gestures intercepted by the supervisor so far.
    pub exit_attempts: u32,

    /// Frozen and fullscreen currently disengaged: the UI should show the
    /// re-enter-fullscreen affordance.
    pub needs_fullscreen: bool,
}

enum Command {
    SelectAnswer { question_id: i64, option: String },
    Navigate(Navigation),
    Submit,
    Host(HostEvent),
    RequestExit(oneshot::Sender<ExitDecision>),
    Teardown,
    Snapshot(oneshot::Sender<EngineSnapshot>),
}

/// Completions of in-flight network calls. They re-enter the actor's queue
/// so every response is reconciled against current state instead of being
/// applied blindly.
enum Internal {
    SaveSettled(Result<(), EngineError>),
    BlockSettled {
        resp: Result<BlockResponse, EngineError>,
    },
    PollSettled {
        resp: Result<BlockStatus, EngineError>,
        issued: Instant,
    },
    SubmitSettled(Result<SubmitResponse, EngineError>),
}

/// Cloneable handle for driving a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Command>,
}

impl EngineHandle {
    async fn send(&self, cmd: Command) -> Result<(), EngineError> {
        self.tx.send(cmd).await.map_err(|_| EngineError::EngineGone)
    }

    pub async fn select_answer(
        &self,
        question_id: i64,
        option: impl Into<String>,
    ) -> Result<(), EngineError> {
        self.send(Command::SelectAnswer {
            question_id,
            option: option.into(),
        })
        .await
    }

    pub async fn navigate(&self, nav: Navigation) -> Result<(), EngineError> {
        self.send(Command::Navigate(nav)).await
    }

    pub async fn submit(&self) -> Result<(), EngineError> {
        self.send(Command::Submit).await
    }

    pub async fn host_event(&self, event: HostEvent) -> Result<(), EngineError> {
        self.send(Command::Host(event)).await
    }

    /// Asks the supervisor whether the student may leave. Denied while the
    /// window is locked; the shell honors the decision.
    pub async fn request_exit(&self) -> Result<ExitDecision, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::RequestExit(tx)).await?;
        rx.await.map_err(|_| EngineError::EngineGone)
    }

    /// Signals process/page teardown. The engine fires its best-effort save
    /// (and the deliberate-navigation block, when flagged) and stops.
    pub async fn teardown(&self) -> Result<(), EngineError> {
        self.send(Command::Teardown).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| EngineError::EngineGone)
    }
}

/// The session state machine: owns the one Session record and is its only
/// writer. Observers, timers, and network completions all funnel through
/// this actor's queues and are handled sequentially.
pub struct SessionEngine {
    channel: Arc<dyn AuthorityChannel>,
    config: EngineConfig,
    supervisor: SupervisorHandle,
    internal_tx: mpsc::Sender<Internal>,

    lifecycle: Lifecycle,
    countdown_left: u32,
    current_question_index: usize,
    answers: BTreeMap<i64, String>,
    time_left_seconds: i64,
    completed: bool,
    save_state: SaveState,

    total_questions: usize,
    /// (question id, subcategory) pairs, in quiz order; drives the submit
    /// body so unanswered questions are reported as explicit nulls.
    question_meta: Vec<(i64, String)>,

    detector: ViolationDetector,
    freeze: FreezeController,
    exit_attempts: u32,
    submit_in_flight: bool,
    last_poll: Option<Instant>,
}

impl SessionEngine {
    /// Spawns the engine actor for one attempt and returns its handle.
    pub fn spawn(
        channel: Arc<dyn AuthorityChannel>,
        config: EngineConfig,
        supervisor: SupervisorHandle,
    ) -> EngineHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (internal_tx, internal_rx) = mpsc::channel(64);

        let detector = ViolationDetector::new(config.history_depth);
        let freeze = FreezeController::new(config.rearm_window, config.fallback_block);

        let engine = SessionEngine {
            channel,
            config,
            supervisor,
            internal_tx,
            lifecycle: Lifecycle::Loading,
            countdown_left: 0,
            current_question_index: 0,
            answers: BTreeMap::new(),
            time_left_seconds: 0,
            completed: false,
            save_state: SaveState::Idle,
            total_questions: 0,
            question_meta: Vec::new(),
            detector,
            freeze,
            exit_attempts: 0,
            submit_in_flight: false,
            last_poll: None,
        };

        tokio::spawn(engine.run(cmd_rx, internal_rx));

        EngineHandle { tx: cmd_tx }
    }

    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut internal_rx: mpsc::Receiver<Internal>,
    ) {
        if let Err(e) = self.load().await {
            tracing::error!("Session load failed, engine stopping: {}", e);
            return;
        }

        if self.lifecycle != Lifecycle::Completed {
            if let Err(e) = self.supervisor.notify_started().await {
                tracing::error!("Supervisor start notification failed: {}", e);
            }
        }

        let mut sup_events = self.supervisor.take_events().unwrap_or_else(|| {
            // Already taken means no push channel; leave a closed receiver
            // so the select arm stays disabled.
            let (_tx, rx) = mpsc::channel(1);
            rx
        });

        let mut tick_guard = TickGuard::new("countdown");
        let mut autosave_guard = TickGuard::new("autosave");
        let Some(mut tick) = tick_guard.start(self.config.tick) else {
            return;
        };
        let Some(mut autosave) = autosave_guard.start(self.config.autosave_every) else {
            return;
        };

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::Teardown) => {
                        self.teardown();
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd).await,
                    // All handles dropped: treat like an ordinary teardown.
                    None => {
                        self.teardown();
                        break;
                    }
                },
                Some(internal) = internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }
                Some(event) = sup_events.recv() => match event {
                    SupervisorEvent::ExitAttempted => {
                        self.exit_attempts += 1;
                        tracing::warn!("OS window close intercepted mid-exam");
                    }
                },
                _ = tick.tick() => self.on_tick(),
                _ = autosave.tick() => {
                    // Background save path; Active only.
                    if self.lifecycle == Lifecycle::Active {
                        self.send_save();
                    }
                }
            }
        }
    }

    /// Initial fetch. The authority's payload is ground truth: it reseeds
    /// the timer, the answer set, and the block state, whatever this
    /// process thought it knew before.
    async fn load(&mut self) -> Result<(), EngineError> {
        let mut attempts = 0;
        let payload = loop {
            match self.channel.fetch_session().await {
                Ok(payload) => break payload,
                Err(e) if attempts < 2 => {
                    attempts += 1;
                    tracing::warn!("Session fetch failed (attempt {}): {}", attempts, e);
                    tokio::time::sleep(self.config.tick).await;
                }
                Err(e) => return Err(e),
            }
        };

        self.total_questions = payload.quiz.questions.len();
        self.question_meta = payload
            .quiz
            .questions
            .iter()
            .map(|q| (q.id, q.subcategory.clone()))
            .collect();
        self.time_left_seconds = payload.quiz.duration_seconds;

        let resuming = payload.progress.is_some();
        if let Some(progress) = payload.progress {
            self.current_question_index = progress
                .current_question_index
                .min(self.total_questions.saturating_sub(1));
            self.answers = progress.answers;
            self.time_left_seconds = progress.time_left;
        }

        if payload.completed {
            self.completed = true;
            self.lifecycle = Lifecycle::Completed;
            tracing::info!("Attempt already completed on the authority");
            return Ok(());
        }

        if payload.blocked && payload.remaining_seconds > 0 {
            // Reload mid-penalty: resume Frozen with the authority's expiry.
            // The reason only feeds logging and refreeze bookkeeping.
            let reason = payload.block_reason.unwrap_or(BlockReason::TabHidden);
            self.freeze
                .resume(reason, now_ms() + payload.remaining_seconds * 1000);
            self.lifecycle = Lifecycle::Frozen;
            tracing::warn!(
                "Resuming frozen: {}s of block remaining",
                payload.remaining_seconds
            );
        } else if resuming {
            // Countdown is for fresh starts only.
            self.lifecycle = Lifecycle::Active;
            tracing::info!(
                "Resuming active with {}s left and {} answer(s)",
                self.time_left_seconds,
                self.answers.len()
            );
        } else {
            self.lifecycle = Lifecycle::Countdown;
            self.countdown_left = self.config.countdown_ticks;
        }

        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SelectAnswer {
                question_id,
                option,
            } => {
                if self.lifecycle != Lifecycle::Active {
                    tracing::debug!("Answer selection ignored while {:?}", self.lifecycle);
                    return;
                }
                if !self.question_meta.iter().any(|(id, _)| *id == question_id) {
                    tracing::warn!("Selection for unknown question {}", question_id);
                    return;
                }
                if option.is_empty() {
                    // Unanswered is absence, never an empty string.
                    self.answers.remove(&question_id);
                } else {
                    self.answers.insert(question_id, option);
                }
                self.send_save();
            }
            Command::Navigate(nav) => {
                if self.lifecycle != Lifecycle::Active {
                    tracing::debug!("Navigation ignored while {:?}", self.lifecycle);
                    return;
                }
                let last = self.total_questions.saturating_sub(1);
                self.current_question_index = match nav {
                    Navigation::Next => (self.current_question_index + 1).min(last),
                    Navigation::Prev => self.current_question_index.saturating_sub(1),
                    Navigation::Jump(index) => index.min(last),
                };
                self.send_save();
            }
            Command::Submit => match self.lifecycle {
                Lifecycle::Active => {
                    if self.answers.len() < self.total_questions {
                        tracing::warn!(
                            "Explicit submit refused: {} of {} answered",
                            self.answers.len(),
                            self.total_questions
                        );
                        return;
                    }
                    self.begin_submit();
                }
                // Retry after a failed submit; a no-op while one is in
                // flight or after completion.
                Lifecycle::Submitting => self.begin_submit(),
                other => {
                    tracing::debug!("Submit ignored while {:?}", other);
                }
            },
            Command::Host(event) => {
                if let Some(violation) = self.detector.observe(event, self.lifecycle) {
                    self.freeze_on(violation).await;
                }
            }
            Command::RequestExit(reply) => {
                let decision = match self.supervisor.request_exit().await {
                    Ok(decision) => decision,
                    Err(e) => {
                        // Unreachable supervisor: keep the window shut.
                        tracing::error!("Supervisor exit request failed: {}", e);
                        ExitDecision::Denied
                    }
                };
                let _ = reply.send(decision);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            // Consumed by the run loop.
            Command::Teardown => {}
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::SaveSettled(result) => match result {
                Ok(()) => {
                    if self.save_state == SaveState::Saving {
                        self.save_state = SaveState::Saved;
                    }
                }
                Err(e) => {
                    // Non-fatal: the next periodic save is the retry.
                    tracing::warn!("Progress save failed: {}", e);
                    self.save_state = SaveState::Error;
                }
            },
            Internal::BlockSettled { resp } => match resp {
                Ok(resp) => {
                    if self.lifecycle == Lifecycle::Frozen {
                        self.freeze.confirm(resp.expires_at);
                        tracing::info!(
                            "Block confirmed: {}s remaining",
                            resp.remaining_seconds
                        );
                    } else {
                        tracing::debug!(
                            "Late block confirmation ignored while {:?}",
                            self.lifecycle
                        );
                    }
                }
                Err(e) => {
                    tracing::error!("Block request failed: {}", e);
                    self.freeze.request_failed();
                }
            },
            Internal::PollSettled { resp, issued } => {
                if self.lifecycle != Lifecycle::Frozen {
                    return;
                }
                match resp {
                    Ok(status) => {
                        self.freeze
                            .reconcile_poll(status.remaining_seconds, issued, now_ms());
                    }
                    Err(e) => tracing::debug!("Block-status poll failed: {}", e),
                }
            }
            Internal::SubmitSettled(result) => {
                self.submit_in_flight = false;
                match result {
                    Ok(resp) if resp.success => self.complete().await,
                    Ok(_) => {
                        tracing::error!("Authority refused submission; retry available");
                    }
                    Err(e) => {
                        // Integrity-critical: stay in Submitting so the UI
                        // offers an actionable retry instead of dropping
                        // answers.
                        tracing::error!("Submit failed: {}", e);
                    }
                }
            }
        }
    }

    fn on_tick(&mut self) {
        // The save indicator settles back to idle one tick after "saved".
        if self.save_state == SaveState::Saved {
            self.save_state = SaveState::Idle;
        }

        match self.lifecycle {
            Lifecycle::Countdown => {
                self.countdown_left = self.countdown_left.saturating_sub(1);
                if self.countdown_left == 0 {
                    self.lifecycle = Lifecycle::Active;
                    tracing::info!("Countdown finished; session active");
                }
            }
            Lifecycle::Active => {
                self.time_left_seconds -= 1;
                if self.time_left_seconds <= 0 {
                    self.time_left_seconds = 0;
                    tracing::info!("Timer reached zero; auto-submitting");
                    self.begin_submit();
                }
            }
            Lifecycle::Frozen => self.on_frozen_tick(),
            _ => {}
        }
    }

    fn on_frozen_tick(&mut self) {
        let now = now_ms();
        if self.freeze.remaining(now) > 0 {
            // Display refresh happens via snapshot; here we only keep the
            // read-only cross-check poll going.
            let poll_due = self
                .last_poll
                .map(|at| at.elapsed() >= self.config.poll_every)
                .unwrap_or(true);
            if poll_due {
                self.last_poll = Some(Instant::now());
                let channel = Arc::clone(&self.channel);
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let issued = Instant::now();
                    let resp = channel.block_status().await;
                    let _ = tx.send(Internal::PollSettled { resp, issued }).await;
                });
            }
            return;
        }

        // Countdown hit zero: unfreeze only with the student demonstrably
        // present, i.e. page visible and fullscreen engaged.
        let host = self.detector.host_state();
        if !host.hidden && host.fullscreen {
            self.freeze.clear();
            self.lifecycle = Lifecycle::Active;
            tracing::info!("Block expired with student present; session resumed");
            return;
        }

        match self.config.grace_action {
            GraceAction::Submit => {
                tracing::warn!(
                    "Block expired with student absent (hidden: {}, fullscreen: {}); auto-submitting",
                    host.hidden,
                    host.fullscreen
                );
                self.begin_submit();
            }
            GraceAction::Refreeze => {
                if let Some(reason) = self.freeze.refreeze(now) {
                    tracing::warn!("Block expired with student absent; re-freezing");
                    self.send_block_request(reason);
                }
            }
        }
    }

    async fn freeze_on(&mut self, violation: ViolationEvent) {
        if self.lifecycle != Lifecycle::Active {
            return;
        }
        tracing::warn!(
            "Violation: {} at {}; freezing session",
            violation.kind.as_str(),
            violation.at
        );

        // Immediate and unconditional; the block request catches up.
        self.lifecycle = Lifecycle::Frozen;
        self.last_poll = None;

        if let Err(e) = self.supervisor.notify_blocked(violation.kind).await {
            tracing::error!("Supervisor block notification failed: {}", e);
        }

        if self.freeze.engage(violation.kind, now_ms()) {
            self.send_block_request(violation.kind);
        }
    }

    fn send_block_request(&self, reason: BlockReason) {
        let channel = Arc::clone(&self.channel);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let resp = channel.send_block(reason).await;
            let _ = tx.send(Internal::BlockSettled { resp }).await;
        });
    }

    /// Interactive/background save. Active only: a frozen or completed
    /// session has nothing actionable to persist, and saving while frozen
    /// would race the block record.
    fn send_save(&mut self) {
        if self.lifecycle != Lifecycle::Active {
            return;
        }
        self.save_state = SaveState::Saving;
        let req = self.save_payload();
        let channel = Arc::clone(&self.channel);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let resp = channel.save_progress(&req).await;
            let _ = tx.send(Internal::SaveSettled(resp)).await;
        });
    }

    fn save_payload(&self) -> SaveProgressRequest {
        SaveProgressRequest {
            current_question_index: self.current_question_index,
            answers: self.answers.clone(),
            time_left: self.time_left_seconds,
        }
    }

    fn begin_submit(&mut self) {
        if self.completed || self.submit_in_flight {
            return;
        }
        self.lifecycle = Lifecycle::Submitting;
        self.submit_in_flight = true;

        let req = SubmitRequest {
            answers: self
                .question_meta
                .iter()
                .map(|(id, subcategory)| AnswerSubmission {
                    question_id: *id,
                    answer: self.answers.get(id).cloned(),
                    subcategory: subcategory.clone(),
                })
                .collect(),
        };

        let channel = Arc::clone(&self.channel);
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let resp = channel.submit(&req).await;
            let _ = tx.send(Internal::SubmitSettled(resp)).await;
        });
    }

    async fn complete(&mut self) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.lifecycle = Lifecycle::Completed;
        self.save_state = SaveState::Idle;
        if let Err(e) = self.supervisor.notify_submitted().await {
            tracing::error!("Supervisor submit notification failed: {}", e);
        }
        tracing::info!("Session completed");
    }

    /// Page/process teardown. A detached save is the one call allowed to
    /// outlive the engine; whether a block accompanies it depends strictly
    /// on the deliberate-navigation flag, so crashes and dropped
    /// connections never penalize the student.
    fn teardown(&mut self) {
        tracing::info!("Session teardown while {:?}", self.lifecycle);

        if self.lifecycle == Lifecycle::Active {
            let channel = Arc::clone(&self.channel);
            let req = self.save_payload();
            tokio::spawn(async move {
                let _ = channel.save_progress(&req).await;
            });
        }

        if self.detector.deliberate_navigation() && !self.completed {
            tracing::warn!("Deliberate navigation away from exam; firing block");
            let channel = Arc::clone(&self.channel);
            tokio::spawn(async move {
                let _ = channel.send_block(BlockReason::DeliberateNavigation).await;
            });
        }
    }

    fn snapshot(&self) -> EngineSnapshot {
        let host = self.detector.host_state();
        EngineSnapshot {
            lifecycle: self.lifecycle,
            current_question_index: self.current_question_index,
            answers: self.answers.clone(),
            time_left_seconds: self.time_left_seconds,
            save_state: self.save_state,
            completed: self.completed,
            block_remaining_seconds: self.freeze.remaining(now_ms()),
            exit_attempts: self.exit_attempts,
            needs_fullscreen: self.lifecycle == Lifecycle::Frozen && !host.fullscreen,
        }
    }
}
