// tests/engine_tests.rs
//
// Engine state-machine tests against an in-memory authority. Timing knobs
// are shrunk so every test settles in well under a second of real time.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use examguard::engine::{
    AuthorityChannel, EngineConfig, EngineHandle, EngineSnapshot, GraceAction, HostEvent, Key,
    Navigation, SessionEngine,
};
use examguard::error::EngineError;
use examguard::models::block::{BlockReason, BlockRequest, BlockResponse, BlockStatus};
use examguard::models::session::{
    Lifecycle, Progress, SaveProgressRequest, SessionPayload, SubmitRequest, SubmitResponse,
};
use examguard::models::quiz::{PublicQuestion, QuizConfig};
use examguard::supervisor::{ExitDecision, Supervisor, SupervisorClient};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
struct MockState {
    payload: Option<SessionPayload>,

    save_calls: usize,
    last_save: Option<SaveProgressRequest>,

    block_calls: usize,
    last_block: Option<BlockRequest>,
    fail_block: bool,
    /// Authority-side block window issued per request, in seconds.
    block_secs: i64,
    block_expires_at: Option<i64>,

    poll_calls: usize,

    submit_calls: usize,
    last_submit: Option<SubmitRequest>,
}

/// In-memory stand-in for the time authority. Short critical sections only;
/// the mutex is never held across an await.
struct MockAuthority {
    state: Mutex<MockState>,
}

impl MockAuthority {
    fn new(payload: SessionPayload, block_secs: i64) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MockState {
                payload: Some(payload),
                block_secs,
                ..MockState::default()
            }),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }
}

#[async_trait]
impl AuthorityChannel for MockAuthority {
    async fn fetch_session(&self) -> Result<SessionPayload, EngineError> {
        self.with(|s| {
            s.payload
                .clone()
                .ok_or_else(|| EngineError::Transport("no payload".to_string()))
        })
    }

    async fn save_progress(&self, req: &SaveProgressRequest) -> Result<(), EngineError> {
        self.with(|s| {
            s.save_calls += 1;
            s.last_save = Some(req.clone());
        });
        Ok(())
    }

    async fn send_block(&self, reason: BlockReason) -> Result<BlockResponse, EngineError> {
        self.with(|s| {
            s.block_calls += 1;
            s.last_block = Some(BlockRequest { reason });
            if s.fail_block {
                return Err(EngineError::Transport("authority unreachable".to_string()));
            }
            let expires_at = now_ms() + s.block_secs * 1000;
            s.block_expires_at = Some(expires_at);
            Ok(BlockResponse {
                expires_at,
                remaining_seconds: s.block_secs,
            })
        })
    }

    async fn block_status(&self) -> Result<BlockStatus, EngineError> {
        self.with(|s| {
            s.poll_calls += 1;
            let remaining = s
                .block_expires_at
                .map(|at| ((at - now_ms()) + 500) / 1000)
                .filter(|r| *r > 0)
                .unwrap_or(0);
            Ok(BlockStatus {
                remaining_seconds: remaining,
            })
        })
    }

    async fn submit(&self, req: &SubmitRequest) -> Result<SubmitResponse, EngineError> {
        self.with(|s| {
            s.submit_calls += 1;
            s.last_submit = Some(req.clone());
            Ok(SubmitResponse { success: true })
        })
    }
}

fn quiz() -> QuizConfig {
    QuizConfig {
        id: 1,
        title: "Engine Quiz".to_string(),
        duration_seconds: 900,
        questions: vec![
            PublicQuestion {
                id: 1,
                content: "Question one".to_string(),
                options: vec!["A".into(), "B".into(), "C".into()],
                subcategory: "alpha".to_string(),
            },
            PublicQuestion {
                id: 2,
                content: "Question two".to_string(),
                options: vec!["A".into(), "B".into(), "C".into()],
                subcategory: "alpha".to_string(),
            },
            PublicQuestion {
                id: 3,
                content: "Question three".to_string(),
                options: vec!["A".into(), "B".into(), "C".into()],
                subcategory: "beta".to_string(),
            },
        ],
    }
}

fn fresh_payload() -> SessionPayload {
    SessionPayload {
        quiz: quiz(),
        progress: None,
        completed: false,
        blocked: false,
        remaining_seconds: 0,
        block_reason: None,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        tick: Duration::from_millis(20),
        autosave_every: Duration::from_millis(60),
        rearm_window: Duration::from_millis(300),
        poll_every: Duration::from_millis(30),
        countdown_ticks: 1,
        history_depth: 20,
        fallback_block: Duration::from_millis(200),
        grace_action: GraceAction::Submit,
    }
}

async fn start_engine(
    mock: Arc<MockAuthority>,
    config: EngineConfig,
) -> (EngineHandle, SupervisorClient) {
    let supervisor = Supervisor::spawn();
    let handle = supervisor.register_session().await.unwrap();
    let engine = SessionEngine::spawn(mock, config, handle);
    (engine, supervisor)
}

async fn wait_for(
    engine: &EngineHandle,
    timeout: Duration,
    pred: impl Fn(&EngineSnapshot) -> bool,
) -> EngineSnapshot {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(snapshot) = engine.snapshot().await {
            if pred(&snapshot) {
                return snapshot;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "engine did not reach the expected state in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn wait_active(engine: &EngineHandle) -> EngineSnapshot {
    wait_for(engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Active
    })
    .await
}

#[tokio::test]
async fn fresh_attempt_counts_down_then_activates() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(mock, fast_config()).await;

    let snap = wait_active(&engine).await;
    assert_eq!(snap.current_question_index, 0);
    assert!(snap.answers.is_empty());
    assert!(snap.time_left_seconds <= 900 && snap.time_left_seconds > 850);
    assert!(!snap.completed);
}

#[tokio::test]
async fn resume_skips_countdown_and_reseeds_from_authority() {
    let mut payload = fresh_payload();
    let mut answers = BTreeMap::new();
    answers.insert(1, "A".to_string());
    answers.insert(3, "C".to_string());
    payload.progress = Some(Progress {
        current_question_index: 2,
        answers: answers.clone(),
        time_left: 123,
    });

    // A huge tick and countdown budget: if the engine wrongly entered the
    // countdown, or decremented the timer, the assertions below would fail.
    let mut config = fast_config();
    config.tick = Duration::from_secs(10);
    config.countdown_ticks = 500;

    let mock = MockAuthority::new(payload, 60);
    let (engine, _sup) = start_engine(mock, config).await;

    let snap = wait_active(&engine).await;
    assert_eq!(snap.current_question_index, 2);
    assert_eq!(snap.answers, answers);
    assert_eq!(snap.time_left_seconds, 123);
}

#[tokio::test]
async fn completed_attempt_loads_read_only() {
    let mut payload = fresh_payload();
    payload.completed = true;

    let mock = MockAuthority::new(payload, 60);
    let (engine, supervisor) = start_engine(Arc::clone(&mock), fast_config()).await;

    let snap = wait_for(&engine, Duration::from_secs(2), |s| s.completed).await;
    assert_eq!(snap.lifecycle, Lifecycle::Completed);

    // Never entered locked-window mode.
    assert!(supervisor.window_close_requested().await.unwrap());

    // No background saves for a completed attempt.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.with(|s| s.save_calls), 0);
}

#[tokio::test]
async fn reload_mid_penalty_resumes_frozen() {
    let mut payload = fresh_payload();
    payload.blocked = true;
    payload.remaining_seconds = 60;
    payload.block_reason = Some(BlockReason::EscapeKey);

    let mock = MockAuthority::new(payload, 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;

    let snap = wait_for(&engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Frozen
    })
    .await;
    assert!(snap.block_remaining_seconds > 55 && snap.block_remaining_seconds <= 60);

    // Resuming frozen never issues a fresh block request.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(mock.with(|s| s.block_calls), 0);
}

#[tokio::test]
async fn hiding_the_tab_freezes_and_sends_one_block_request() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    engine
        .host_event(HostEvent::VisibilityChanged { hidden: true })
        .await
        .unwrap();
    // Repeats of the same violation inside the re-arm window.
    engine
        .host_event(HostEvent::KeyDown(Key::Escape))
        .await
        .unwrap();

    let snap = wait_for(&engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Frozen && s.block_remaining_seconds > 0
    })
    .await;
    assert!(snap.block_remaining_seconds <= 60);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.with(|s| s.block_calls), 1, "one request per violation burst");
    assert_eq!(
        mock.with(|s| s.last_block.as_ref().map(|b| b.reason)),
        Some(BlockReason::TabHidden)
    );
}

#[tokio::test]
async fn frozen_session_rejects_interaction() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(mock, fast_config()).await;
    wait_active(&engine).await;

    engine
        .host_event(HostEvent::VisibilityChanged { hidden: true })
        .await
        .unwrap();
    wait_for(&engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Frozen
    })
    .await;

    engine.select_answer(1, "A").await.unwrap();
    engine.navigate(Navigation::Next).await.unwrap();

    let snap = engine.snapshot().await.unwrap();
    assert!(snap.answers.is_empty());
    assert_eq!(snap.current_question_index, 0);
}

#[tokio::test]
async fn unfreeze_requires_visible_and_fullscreen() {
    // Short authority block so the penalty lapses during the test. The
    // refreeze grace action keeps the session frozen (instead of forfeiting
    // it) while the student is absent at expiry.
    let mock = MockAuthority::new(fresh_payload(), 1);
    let mut config = fast_config();
    config.grace_action = GraceAction::Refreeze;
    let (engine, _sup) = start_engine(Arc::clone(&mock), config).await;
    wait_active(&engine).await;

    engine
        .host_event(HostEvent::FullscreenChanged { active: false })
        .await
        .unwrap();
    wait_for(&engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Frozen
    })
    .await;

    // The penalty lapses, but fullscreen is still disengaged: the session
    // must stay frozen and surface the re-enter affordance.
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let snap = engine.snapshot().await.unwrap();
    assert_eq!(snap.lifecycle, Lifecycle::Frozen);
    assert!(snap.needs_fullscreen);

    engine
        .host_event(HostEvent::FullscreenChanged { active: true })
        .await
        .unwrap();
    let snap = wait_for(&engine, Duration::from_secs(4), |s| {
        s.lifecycle == Lifecycle::Active
    })
    .await;
    assert!(!snap.needs_fullscreen);
}

#[tokio::test]
async fn expiry_with_student_absent_auto_submits() {
    let mock = MockAuthority::new(fresh_payload(), 1);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    engine
        .host_event(HostEvent::VisibilityChanged { hidden: true })
        .await
        .unwrap();
    wait_for(&engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Frozen
    })
    .await;

    // Tab stays hidden past the expiry: the attempt is forfeited.
    let snap = wait_for(&engine, Duration::from_secs(3), |s| s.completed).await;
    assert_eq!(snap.lifecycle, Lifecycle::Completed);
    assert_eq!(mock.with(|s| s.submit_calls), 1);
}

#[tokio::test]
async fn failed_block_request_holds_conservative_fallback() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    mock.with(|s| s.fail_block = true);

    // Fallback long enough for the cross-check polls to run against it.
    let mut config = fast_config();
    config.fallback_block = Duration::from_secs(2);
    let (engine, _sup) = start_engine(Arc::clone(&mock), config).await;
    wait_active(&engine).await;

    engine
        .host_event(HostEvent::VisibilityChanged { hidden: true })
        .await
        .unwrap();
    wait_for(&engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Frozen
    })
    .await;

    // Polls report no authority-side block, but the local fallback window
    // stands; then, with the tab still hidden at expiry, the grace action
    // submits the attempt.
    let snap = wait_for(&engine, Duration::from_secs(5), |s| s.completed).await;
    assert_eq!(snap.lifecycle, Lifecycle::Completed);
    assert!(mock.with(|s| s.poll_calls) >= 1);
}

#[tokio::test]
async fn interactive_saves_carry_the_full_record() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    engine.select_answer(1, "A").await.unwrap();
    engine.navigate(Navigation::Next).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let saved = mock.with(|s| s.last_save.clone()).expect("no save landed");
    assert_eq!(saved.current_question_index, 1);
    assert_eq!(saved.answers.get(&1).map(String::as_str), Some("A"));
    assert!(saved.time_left <= 900 && saved.time_left > 0);

    // Clearing an answer removes it rather than saving an empty string.
    engine.select_answer(1, "").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let saved = mock.with(|s| s.last_save.clone()).unwrap();
    assert!(saved.answers.is_empty());
}

#[tokio::test]
async fn background_saves_run_while_active() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(
        mock.with(|s| s.save_calls) >= 2,
        "periodic saves fire without interaction"
    );
}

#[tokio::test]
async fn navigation_clamps_to_quiz_bounds() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(mock, fast_config()).await;
    wait_active(&engine).await;

    engine.navigate(Navigation::Prev).await.unwrap();
    let snap = engine.snapshot().await.unwrap();
    assert_eq!(snap.current_question_index, 0);

    engine.navigate(Navigation::Jump(99)).await.unwrap();
    let snap = engine.snapshot().await.unwrap();
    assert_eq!(snap.current_question_index, 2);

    engine.navigate(Navigation::Next).await.unwrap();
    let snap = engine.snapshot().await.unwrap();
    assert_eq!(snap.current_question_index, 2, "stays on the last question");
}

#[tokio::test]
async fn explicit_submit_requires_every_answer() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    engine.select_answer(1, "A").await.unwrap();
    engine.submit().await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snap = engine.snapshot().await.unwrap();
    assert_eq!(snap.lifecycle, Lifecycle::Active, "incomplete submit refused");
    assert_eq!(mock.with(|s| s.submit_calls), 0);

    engine.select_answer(2, "B").await.unwrap();
    engine.select_answer(3, "C").await.unwrap();
    engine.submit().await.unwrap();

    let snap = wait_for(&engine, Duration::from_secs(2), |s| s.completed).await;
    assert_eq!(snap.lifecycle, Lifecycle::Completed);

    // Unanswered questions would appear as explicit nulls; here all three
    // carry answers.
    let submit = mock.with(|s| s.last_submit.clone()).unwrap();
    assert_eq!(submit.answers.len(), 3);
    assert!(submit.answers.iter().all(|a| a.answer.is_some()));
}

#[tokio::test]
async fn duplicate_submits_reach_the_authority_once() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    for id in 1..=3 {
        engine.select_answer(id, "A").await.unwrap();
    }
    engine.submit().await.unwrap();
    engine.submit().await.unwrap();
    engine.submit().await.unwrap();

    wait_for(&engine, Duration::from_secs(2), |s| s.completed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mock.with(|s| s.submit_calls), 1);
}

#[tokio::test]
async fn saves_stop_after_completion() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    for id in 1..=3 {
        engine.select_answer(id, "A").await.unwrap();
    }
    engine.submit().await.unwrap();
    wait_for(&engine, Duration::from_secs(2), |s| s.completed).await;

    let saves_at_completion = mock.with(|s| s.save_calls);
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(mock.with(|s| s.save_calls), saves_at_completion);
}

#[tokio::test]
async fn involuntary_teardown_saves_without_blocking() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    engine.select_answer(1, "A").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let saves_before = mock.with(|s| s.save_calls);
    engine.teardown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Crash or reload: best-effort save fired, no penalty.
    assert!(mock.with(|s| s.save_calls) > saves_before);
    assert_eq!(mock.with(|s| s.block_calls), 0);
}

#[tokio::test]
async fn deliberate_navigation_teardown_fires_a_block() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    engine.host_event(HostEvent::NavigationIntent).await.unwrap();
    engine.teardown().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mock.with(|s| s.block_calls), 1);
    assert_eq!(
        mock.with(|s| s.last_block.as_ref().map(|b| b.reason)),
        Some(BlockReason::DeliberateNavigation)
    );
}

#[tokio::test]
async fn exit_request_is_denied_until_the_attempt_completes() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, _sup) = start_engine(Arc::clone(&mock), fast_config()).await;
    wait_active(&engine).await;

    // Locked-window mode: the student's exit affordance is refused.
    assert_eq!(engine.request_exit().await.unwrap(), ExitDecision::Denied);

    for id in 1..=3 {
        engine.select_answer(id, "A").await.unwrap();
    }
    engine.submit().await.unwrap();
    wait_for(&engine, Duration::from_secs(2), |s| s.completed).await;

    assert_eq!(engine.request_exit().await.unwrap(), ExitDecision::Permitted);
}

#[tokio::test]
async fn intercepted_window_close_shows_up_in_the_snapshot() {
    let mock = MockAuthority::new(fresh_payload(), 60);
    let (engine, supervisor) = start_engine(mock, fast_config()).await;
    wait_active(&engine).await;

    assert!(!supervisor.window_close_requested().await.unwrap());
    assert!(!supervisor.window_close_requested().await.unwrap());

    let snap = wait_for(&engine, Duration::from_secs(2), |s| s.exit_attempts == 2).await;
    assert_eq!(snap.lifecycle, Lifecycle::Active);
}

#[tokio::test]
async fn block_countdown_never_increases() {
    let mock = MockAuthority::new(fresh_payload(), 3);
    let (engine, _sup) = start_engine(mock, fast_config()).await;
    wait_active(&engine).await;

    engine
        .host_event(HostEvent::VisibilityChanged { hidden: true })
        .await
        .unwrap();
    wait_for(&engine, Duration::from_secs(2), |s| {
        s.lifecycle == Lifecycle::Frozen && s.block_remaining_seconds > 0
    })
    .await;

    let mut last = i64::MAX;
    for _ in 0..10 {
        let snap = engine.snapshot().await.unwrap();
        if snap.lifecycle != Lifecycle::Frozen {
            break;
        }
        assert!(snap.block_remaining_seconds <= last);
        last = snap.block_remaining_seconds;
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
