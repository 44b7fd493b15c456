//! Integration tests for the schedule execution engine, driven through a
//! scripted playback collaborator and the in-memory repository.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use autorun::bus::EventBus;
use autorun::config::{EventBusConfig, ForcedDeactivation, SchedulerConfig, TaskManagerConfig};
use autorun::engine::{FireOutcome, Scheduler};
use autorun::error::{Error, Result};
use autorun::event::{EventKind, EventType};
use autorun::model::{
    ExecutionRecord, ExecutionStatus, NewSchedule, RepeatCondition, Schedule, ScheduleId,
    ScheduleStatus, TriggerCondition,
};
use autorun::playback::{
    ExecutionSummary, PlaybackConfig, PlaybackProgress, PlaybackService, PlaybackState,
    PlaybackStatus, SessionId,
};
use autorun::storage::{InMemoryScheduleRepository, ScheduleRepository};
use autorun::worker::TaskManager;
use parking_lot::Mutex;

// ---------------------------------------------------------------------------
// Scripted playback
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ScriptedPlayback {
    /// Sessions finish as soon as they start.
    auto_complete: bool,
    fail_start: bool,
    /// Blocks inside `start_playback` this long.
    start_delay: Option<Duration>,
    sessions: Mutex<HashMap<SessionId, PlaybackState>>,
    starts: Mutex<Vec<(String, Instant)>>,
    stops: AtomicUsize,
}

impl ScriptedPlayback {
    fn manual() -> Self {
        Self::default()
    }

    fn auto_complete() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail_start: true,
            ..Self::default()
        }
    }

    fn slow_start(delay: Duration) -> Self {
        Self {
            start_delay: Some(delay),
            ..Self::default()
        }
    }

    fn complete_all(&self) {
        for state in self.sessions.lock().values_mut() {
            if *state == PlaybackState::Running {
                *state = PlaybackState::Completed;
            }
        }
    }

    fn start_times(&self) -> Vec<Instant> {
        self.starts.lock().iter().map(|(_, at)| *at).collect()
    }

    fn progress(state: PlaybackState) -> PlaybackProgress {
        let executed = if state == PlaybackState::Completed { 5 } else { 2 };
        PlaybackProgress {
            actions_executed: executed,
            total_actions: 5,
        }
    }
}

impl PlaybackService for ScriptedPlayback {
    fn start_playback(&self, recording_id: &str, _config: &PlaybackConfig) -> Result<SessionId> {
        if let Some(delay) = self.start_delay {
            std::thread::sleep(delay);
        }
        if self.fail_start {
            return Err(Error::Playback(format!("recording {recording_id} not found")));
        }
        let session = SessionId::generate();
        let state = if self.auto_complete {
            PlaybackState::Completed
        } else {
            PlaybackState::Running
        };
        self.sessions.lock().insert(session.clone(), state);
        self.starts
            .lock()
            .push((recording_id.to_string(), Instant::now()));
        Ok(session)
    }

    fn get_status(&self, session_id: &SessionId) -> Result<PlaybackStatus> {
        let state = *self
            .sessions
            .lock()
            .get(session_id)
            .ok_or_else(|| Error::Playback(format!("unknown session {session_id}")))?;
        Ok(PlaybackStatus {
            state,
            progress: Self::progress(state),
            error: None,
        })
    }

    fn stop_playback(&self, session_id: &SessionId) -> Result<ExecutionSummary> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        let mut sessions = self.sessions.lock();
        let state = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Playback(format!("unknown session {session_id}")))?;
        *state = PlaybackState::Cancelled;
        Ok(ExecutionSummary {
            session_id: session_id.clone(),
            state: *state,
            progress: Self::progress(PlaybackState::Running),
            error: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Flaky repository
// ---------------------------------------------------------------------------

/// Passes through to the in-memory repository, failing the next
/// `failing_gets` loads and `failing_reports` execution reports.
#[derive(Default)]
struct FlakyRepository {
    inner: Arc<InMemoryScheduleRepository>,
    failing_gets: AtomicUsize,
    failing_reports: AtomicUsize,
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ScheduleRepository for FlakyRepository {
    fn list_active(&self) -> Result<Vec<Schedule>> {
        self.inner.list_active()
    }

    fn get(&self, id: ScheduleId) -> Result<Option<Schedule>> {
        if take_failure(&self.failing_gets) {
            return Err(Error::Repository("storage unavailable".into()));
        }
        self.inner.get(id)
    }

    fn save(&self, schedule: &Schedule) -> Result<bool> {
        self.inner.save(schedule)
    }

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        if take_failure(&self.failing_reports) {
            return Err(Error::Repository("storage unavailable".into()));
        }
        self.inner.record_execution(record)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    scheduler: Scheduler,
    repository: Arc<InMemoryScheduleRepository>,
    flaky: Arc<FlakyRepository>,
    playback: Arc<ScriptedPlayback>,
}

fn config(max_concurrent: usize) -> SchedulerConfig {
    SchedulerConfig {
        poll_interval: Duration::from_millis(50),
        max_concurrent_executions: max_concurrent,
        error_backoff: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(2),
        collaborator_timeout: Duration::from_secs(2),
        ..SchedulerConfig::default()
    }
}

fn harness(config: SchedulerConfig, playback: ScriptedPlayback) -> Harness {
    let repository = Arc::new(InMemoryScheduleRepository::new());
    let flaky = Arc::new(FlakyRepository {
        inner: Arc::clone(&repository),
        ..FlakyRepository::default()
    });
    let playback = Arc::new(playback);
    let scheduler = Scheduler::new(
        config,
        Arc::clone(&flaky) as Arc<dyn ScheduleRepository>,
        Arc::clone(&playback) as Arc<dyn PlaybackService>,
        TaskManager::new(TaskManagerConfig::default()),
    );
    Harness {
        scheduler,
        repository,
        flaky,
        playback,
    }
}

impl Harness {
    /// Store and activate a schedule.
    async fn add(&self, schedule: Schedule) -> ScheduleId {
        let id = schedule.id;
        self.repository.save(&schedule).unwrap();
        self.scheduler.activate(id).await.unwrap();
        id
    }

    fn schedule(&self, id: ScheduleId) -> Schedule {
        self.repository.get(id).unwrap().unwrap()
    }
}

/// Due immediately, then every hour, forever.
fn due_now(name: &str) -> Schedule {
    NewSchedule::new(name, format!("rec-{name}"), TriggerCondition::interval(3600, true))
        .repeat(RepeatCondition::Infinite)
        .build()
}

/// Not due for an hour.
fn not_due(name: &str) -> Schedule {
    NewSchedule::new(name, format!("rec-{name}"), TriggerCondition::interval(3600, false)).build()
}

async fn eventually(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_cap_holds_second_schedule_back() {
    let h = harness(config(1), ScriptedPlayback::manual());
    let first = h.add(due_now("first")).await;
    let second = h.add(due_now("second")).await;

    h.scheduler.tick().await.unwrap();
    assert_eq!(h.scheduler.in_flight().len(), 1);
    assert_eq!(h.playback.start_times().len(), 1);

    // Still capped while the first one runs.
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.scheduler.in_flight().len(), 1);

    h.playback.complete_all();
    h.scheduler.tick().await.unwrap();
    let running = h.scheduler.in_flight();
    assert_eq!(running.len(), 1);
    assert_eq!(h.playback.start_times().len(), 2);

    let (done, waiting) = if running[0].schedule_id == second {
        (first, second)
    } else {
        (second, first)
    };
    assert_eq!(h.schedule(done).status, ScheduleStatus::Active);
    assert_eq!(h.schedule(done).success_count, 1);
    assert_eq!(h.schedule(waiting).status, ScheduleStatus::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn running_loop_never_exceeds_cap() {
    let h = harness(config(2), ScriptedPlayback::manual());
    for n in 0..5 {
        h.add(due_now(&format!("job-{n}"))).await;
    }

    assert!(h.scheduler.start().unwrap());
    let mut peak = 0;
    for _ in 0..10 {
        peak = peak.max(h.scheduler.statistics().in_flight);
        h.playback.complete_all();
        tokio::time::sleep(Duration::from_millis(30)).await;
    }
    assert!(
        eventually(Duration::from_secs(3), || h.repository.executions().len() == 5).await,
        "not every schedule ran"
    );
    h.scheduler.stop().await;

    assert!(peak <= 2, "peak in flight was {peak}");
    assert_eq!(h.scheduler.statistics().successful_executions, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn count_repeat_runs_twice_at_interval_then_deactivates() {
    let h = harness(config(3), ScriptedPlayback::auto_complete());
    let bus = EventBus::new(EventBusConfig::default()).unwrap();
    let scheduler = h.scheduler.clone().with_event_bus(bus.clone());

    let reasons = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&reasons);
    bus.subscribe(EventType::ScheduleDeactivated, move |event| {
        if let EventKind::ScheduleDeactivated { reason, .. } = &event.kind {
            log.lock().push(reason.clone());
        }
        Ok(())
    });

    let schedule = NewSchedule::new("twice", "rec-twice", TriggerCondition::interval(1, true))
        .repeat(RepeatCondition::Count { remaining: 2 })
        .build();
    let id = schedule.id;
    h.repository.save(&schedule).unwrap();
    scheduler.activate(id).await.unwrap();

    assert!(scheduler.start().unwrap());
    assert!(
        eventually(Duration::from_secs(5), || {
            h.schedule(id).status == ScheduleStatus::Inactive
        })
        .await
    );
    scheduler.stop().await;

    let stored = h.schedule(id);
    assert_eq!(stored.execution_count, 2);
    assert_eq!(stored.success_count, 2);
    assert_eq!(stored.repeat, RepeatCondition::Count { remaining: 0 });
    assert!(stored.next_execution_at.is_none());

    assert_eq!(h.playback.start_times().len(), 2);

    // The second run is due one interval after the first one started.
    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 2);
    let gap = records[1].started_at - records[0].started_at;
    assert!(gap >= chrono::Duration::seconds(1), "second run after {gap:?}");
    assert!(records.iter().all(|r| r.status == ExecutionStatus::Completed && r.success));
    assert!(records.iter().all(|r| r.actions_executed == 5 && r.total_actions == 5));

    assert!(eventually(Duration::from_secs(2), || !reasons.lock().is_empty()).await);
    assert_eq!(*reasons.lock(), vec!["repeat condition exhausted".to_string()]);
    let bus_for_shutdown = bus.clone();
    tokio::task::spawn_blocking(move || bus_for_shutdown.shutdown())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fire_now_starts_or_defers() {
    let h = harness(config(1), ScriptedPlayback::manual());
    let inactive = not_due("dormant");
    let inactive_id = inactive.id;
    h.repository.save(&inactive).unwrap();
    let a = h.add(not_due("a")).await;
    let b = h.add(not_due("b")).await;

    assert!(matches!(
        h.scheduler.fire_now(inactive_id).await,
        Err(Error::InvalidTransition { .. })
    ));
    assert!(matches!(
        h.scheduler.fire_now(ScheduleId::new()).await,
        Err(Error::NotFound(_))
    ));

    let started = h.scheduler.fire_now(a).await.unwrap();
    assert!(matches!(started, FireOutcome::Started(_)));
    assert!(matches!(
        h.scheduler.fire_now(a).await,
        Err(Error::ScheduleRunning(_))
    ));

    assert_eq!(h.scheduler.fire_now(b).await.unwrap(), FireOutcome::Deferred);
    assert_eq!(h.scheduler.statistics().pending_fires, 1);

    // Not due by its trigger, but the deferred fire starts it once a slot frees.
    h.playback.complete_all();
    h.scheduler.tick().await.unwrap();
    let running = h.scheduler.in_flight();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].schedule_id, b);
    assert_eq!(h.scheduler.statistics().pending_fires, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deactivate_requires_force_while_running() {
    let h = harness(config(2), ScriptedPlayback::manual());
    let id = h.add(due_now("busy")).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.schedule(id).status, ScheduleStatus::Running);

    assert!(matches!(
        h.scheduler.deactivate(id, false).await,
        Err(Error::ScheduleRunning(_))
    ));

    h.scheduler.deactivate(id, true).await.unwrap();
    assert_eq!(h.playback.stops.load(Ordering::SeqCst), 1);
    assert!(h.scheduler.in_flight().is_empty());

    let stored = h.schedule(id);
    assert_eq!(stored.status, ScheduleStatus::Inactive);
    assert!(stored.next_execution_at.is_none());
    assert_eq!(stored.failure_count, 1);

    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Cancelled);
    assert_eq!(
        records[0].error.as_deref(),
        Some("cancelled by forced deactivation")
    );
    assert_eq!(h.scheduler.statistics().cancelled_executions, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forced_deactivation_can_let_the_run_finish() {
    let h = harness(
        SchedulerConfig {
            forced_deactivation: ForcedDeactivation::LetFinish,
            ..config(2)
        },
        ScriptedPlayback::manual(),
    );
    let id = h.add(due_now("finishing")).await;
    h.scheduler.tick().await.unwrap();

    h.scheduler.deactivate(id, true).await.unwrap();
    assert_eq!(h.scheduler.in_flight().len(), 1);
    assert_eq!(h.playback.stops.load(Ordering::SeqCst), 0);

    h.playback.complete_all();
    h.scheduler.tick().await.unwrap();

    let stored = h.schedule(id);
    assert_eq!(stored.status, ScheduleStatus::Inactive);
    assert_eq!(stored.success_count, 1);
    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deactivate_idle_schedule() {
    let h = harness(config(1), ScriptedPlayback::manual());
    let id = h.add(not_due("idle")).await;
    assert_eq!(h.schedule(id).status, ScheduleStatus::Active);

    h.scheduler.deactivate(id, false).await.unwrap();
    assert_eq!(h.schedule(id).status, ScheduleStatus::Inactive);
    // Already inactive.
    h.scheduler.deactivate(id, false).await.unwrap();

    // Reactivation arms it again.
    let armed = h.scheduler.activate(id).await.unwrap();
    assert_eq!(armed.status, ScheduleStatus::Active);
    assert!(armed.next_execution_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn activation_rejects_invalid_schedule() {
    let h = harness(config(1), ScriptedPlayback::manual());
    let schedule = NewSchedule::new("broken", "rec", TriggerCondition::interval(0, true))
        .repeat(RepeatCondition::Count { remaining: 0 })
        .build();
    let id = schedule.id;
    h.repository.save(&schedule).unwrap();

    match h.scheduler.activate(id).await {
        Err(Error::Validation(message)) => {
            assert!(message.contains("interval"));
            assert!(message.contains("repeat count"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(h.schedule(id).status, ScheduleStatus::Inactive);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn execution_timeout_stops_the_session() {
    let h = harness(config(1), ScriptedPlayback::manual());
    let schedule = NewSchedule::new("slow", "rec-slow", TriggerCondition::interval(3600, true))
        .execution_timeout(Duration::from_secs(1))
        .build();
    let id = h.add(schedule).await;

    h.scheduler.tick().await.unwrap();
    assert_eq!(h.scheduler.in_flight().len(), 1);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    h.scheduler.tick().await.unwrap();

    assert!(h.scheduler.in_flight().is_empty());
    assert_eq!(h.playback.stops.load(Ordering::SeqCst), 1);
    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert!(!records[0].success);
    assert_eq!(records[0].error.as_deref(), Some("execution timed out after 1s"));

    // A failure without a repeat budget to protect re-arms the schedule.
    let stored = h.schedule(id);
    assert_eq!(stored.status, ScheduleStatus::Active);
    assert_eq!(stored.failure_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn playback_start_failure_is_recorded() {
    let h = harness(config(1), ScriptedPlayback::failing());
    let bus = EventBus::new(EventBusConfig::default()).unwrap();
    let scheduler = h.scheduler.clone().with_event_bus(bus.clone());

    let failures = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&failures);
    bus.subscribe(EventType::Execution, move |event| {
        match &event.kind {
            EventKind::ExecutionStarted { .. } => {
                log.lock().push(("started".to_string(), event.correlation_id.clone()))
            }
            EventKind::ExecutionFailed { error, .. } => {
                log.lock().push((error.clone(), event.correlation_id.clone()))
            }
            _ => {}
        }
        Ok(())
    });

    let id = h.add(due_now("missing")).await;
    scheduler.tick().await.unwrap();

    assert!(scheduler.in_flight().is_empty());
    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert!(
        records[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("playback start failed")
    );

    let stats = scheduler.statistics();
    assert_eq!(stats.total_executions, 1);
    assert_eq!(stats.failed_executions, 1);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(scheduler.history().len(), 1);

    assert!(eventually(Duration::from_secs(2), || failures.lock().len() == 2).await);
    let events = failures.lock().clone();
    assert_eq!(events[0].0, "started");
    assert!(events[1].0.contains("not found"));
    // Both events of one execution share its correlation id.
    assert_eq!(events[0].1, events[1].1);
    assert_eq!(events[0].1, Some(records[0].id.0.to_string()));

    let bus_for_shutdown = bus.clone();
    tokio::task::spawn_blocking(move || bus_for_shutdown.shutdown())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_and_stop_are_idempotent() {
    let h = harness(config(1), ScriptedPlayback::manual());
    assert!(!h.scheduler.is_running());
    assert!(!h.scheduler.stop().await);

    assert!(h.scheduler.start().unwrap());
    assert!(!h.scheduler.start().unwrap());
    assert!(h.scheduler.is_running());

    assert!(eventually(Duration::from_secs(2), || h.scheduler.statistics().ticks >= 2).await);
    let stats = h.scheduler.statistics();
    assert!(stats.is_running);
    assert!(stats.last_tick_at.is_some());

    let started = Instant::now();
    assert!(h.scheduler.stop().await);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!h.scheduler.is_running());
    assert!(!h.scheduler.stop().await);

    // Restartable.
    assert!(h.scheduler.start().unwrap());
    assert!(h.scheduler.stop().await);
}

#[test]
fn start_outside_runtime_is_a_config_error() {
    let repository = Arc::new(InMemoryScheduleRepository::new());
    let scheduler = Scheduler::new(
        config(1),
        repository,
        Arc::new(ScriptedPlayback::manual()),
        TaskManager::new(TaskManagerConfig::default()),
    );
    assert!(matches!(scheduler.start(), Err(Error::Config(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn oversized_limits_are_rejected_on_activation() {
    let h = harness(config(1), ScriptedPlayback::manual());

    let mut long_timeout = due_now("long-timeout");
    long_timeout.execution_timeout_secs = u64::MAX;
    let long_interval = NewSchedule::new(
        "long-interval",
        "rec-long",
        TriggerCondition::interval(u64::MAX, false),
    )
    .build();

    for schedule in [long_timeout, long_interval] {
        let id = schedule.id;
        h.repository.save(&schedule).unwrap();
        match h.scheduler.activate(id).await {
            Err(Error::Validation(message)) => assert!(message.contains("at most")),
            other => panic!("expected validation error, got {other:?}"),
        }
        assert_eq!(h.schedule(id).status, ScheduleStatus::Inactive);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stored_schedule_with_oversized_timeout_still_runs() {
    let h = harness(config(1), ScriptedPlayback::manual());

    // Written straight to storage, never validated.
    let mut schedule = due_now("unbounded");
    schedule.execution_timeout_secs = u64::MAX;
    schedule.status = ScheduleStatus::Active;
    schedule.next_execution_at = Some(chrono::Utc::now());
    let id = schedule.id;
    h.repository.save(&schedule).unwrap();

    h.scheduler.tick().await.unwrap();
    assert_eq!(h.scheduler.in_flight().len(), 1);

    h.playback.complete_all();
    h.scheduler.tick().await.unwrap();
    assert!(h.scheduler.in_flight().is_empty());
    assert_eq!(h.schedule(id).success_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_release_is_retried_next_tick() {
    let h = harness(config(1), ScriptedPlayback::manual());
    let id = h.add(due_now("flaky")).await;

    h.scheduler.tick().await.unwrap();
    assert_eq!(h.scheduler.in_flight().len(), 1);

    // Storage is down for the tick that finalizes the execution.
    h.playback.complete_all();
    h.flaky.failing_gets.store(1, Ordering::SeqCst);
    h.flaky.failing_reports.store(1, Ordering::SeqCst);
    h.scheduler.tick().await.unwrap();

    assert!(h.scheduler.in_flight().is_empty());
    assert_eq!(h.scheduler.statistics().pending_releases, 1);
    assert_eq!(h.schedule(id).status, ScheduleStatus::Running);
    assert!(h.repository.executions_for(id).is_empty());

    h.scheduler.tick().await.unwrap();

    assert_eq!(h.scheduler.statistics().pending_releases, 0);
    let stored = h.schedule(id);
    assert_eq!(stored.status, ScheduleStatus::Active);
    assert_eq!(stored.success_count, 1);
    assert!(stored.next_execution_at.is_some());
    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Completed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deactivating_during_a_pending_release_ends_inactive() {
    let h = harness(config(1), ScriptedPlayback::manual());
    let id = h.add(due_now("stuck")).await;

    h.scheduler.tick().await.unwrap();
    h.playback.complete_all();
    h.flaky.failing_gets.store(1, Ordering::SeqCst);
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.schedule(id).status, ScheduleStatus::Running);

    h.scheduler.deactivate(id, false).await.unwrap();

    let stored = h.schedule(id);
    assert_eq!(stored.status, ScheduleStatus::Inactive);
    assert_eq!(stored.success_count, 1);
    assert_eq!(h.scheduler.statistics().pending_releases, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn launch_cut_short_by_stop_is_reaped_after_restart() {
    let config = SchedulerConfig {
        stop_timeout: Duration::from_millis(50),
        ..config(2)
    };
    let h = harness(config, ScriptedPlayback::slow_start(Duration::from_millis(600)));
    let id = h.add(due_now("slow-start")).await;

    assert!(h.scheduler.start().unwrap());
    assert!(
        eventually(Duration::from_secs(2), || {
            h.schedule(id).status == ScheduleStatus::Running
        })
        .await
    );
    // The loop is blocked in start_playback; stop gives up and aborts it.
    assert!(h.scheduler.stop().await);
    assert_eq!(h.scheduler.in_flight().len(), 1);

    assert!(h.scheduler.start().unwrap());
    assert!(
        eventually(Duration::from_secs(2), || {
            h.scheduler.in_flight().is_empty() && h.schedule(id).status == ScheduleStatus::Active
        })
        .await
    );
    h.scheduler.stop().await;

    let stored = h.schedule(id);
    assert_eq!(stored.failure_count, 1);
    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, ExecutionStatus::Failed);
    assert!(records[0].error.as_deref().unwrap().contains("launch interrupted"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn activating_an_unarmed_active_schedule_arms_it() {
    let h = harness(config(1), ScriptedPlayback::manual());

    // As loaded from a file that says "active" without a next time.
    let mut schedule = due_now("loaded");
    schedule.status = ScheduleStatus::Active;
    let id = schedule.id;
    h.repository.save(&schedule).unwrap();

    let armed = h.scheduler.activate(id).await.unwrap();
    assert!(armed.next_execution_at.is_some());
    assert!(h.schedule(id).next_execution_at.is_some());

    h.scheduler.tick().await.unwrap();
    assert_eq!(h.scheduler.in_flight().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn until_date_repeat_stops_at_the_end_date() {
    let h = harness(config(1), ScriptedPlayback::auto_complete());
    let end = chrono::Utc::now() + chrono::Duration::milliseconds(1800);
    let schedule = NewSchedule::new("window", "rec-window", TriggerCondition::interval(1, true))
        .repeat(RepeatCondition::UntilDate { end })
        .build();
    let id = h.add(schedule).await;

    assert!(h.scheduler.start().unwrap());
    assert!(
        eventually(Duration::from_secs(5), || {
            h.schedule(id).status == ScheduleStatus::Inactive
        })
        .await
    );
    h.scheduler.stop().await;

    let stored = h.schedule(id);
    assert_eq!(stored.success_count, 2);
    assert!(stored.next_execution_at.is_none());
    let records = h.repository.executions_for(id);
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r.started_at < end));
}
