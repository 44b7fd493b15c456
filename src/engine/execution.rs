//! Execution lifecycle: launch, poll, timeout, cancel, finalize.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tracing::{Span, debug, error, info, warn};

use super::{EngineState, PendingRelease, Scheduler};
use crate::error::Result;
use crate::event::{Event, EventKind};
use crate::model::{
    ExecutionId, ExecutionRecord, ExecutionStatus, Schedule, ScheduleId, ScheduleStatus,
};
use crate::playback::{PlaybackProgress, PlaybackState, PlaybackStatus, SessionId};
use crate::telemetry::execution::{record_state_transition, start_execution_span};
use crate::telemetry::metrics;

/// Engine-side state of one running execution.
pub(super) struct InFlight {
    pub(super) record: ExecutionRecord,
    /// `None` while the playback start call is outstanding.
    pub(super) session: Option<SessionId>,
    /// `None` when the timeout does not fit the clock.
    pub(super) deadline: Option<Instant>,
    pub(super) timeout: Duration,
    /// A launch still without a session past this point is abandoned.
    pub(super) launch_deadline: Option<Instant>,
    /// The launching future was dropped before a session was known.
    pub(super) abandoned: bool,
    /// False once the schedule was deactivated mid-flight.
    pub(super) keep_active: bool,
    /// Forced deactivation arrived before the session id was known.
    pub(super) cancel_requested: bool,
    pub(super) span: Span,
}

pub(super) enum Launch {
    Started(ExecutionId),
    /// Concurrency cap reached.
    AtCapacity,
    /// This schedule already has an execution in flight.
    Busy,
    /// No longer active by the time its slot was reserved.
    Skipped,
}

/// Collaborator calls a launch makes before it has a session, plus one
/// for queueing on the pool.
const LAUNCH_CALLS: u32 = 4;

/// Marks the reservation abandoned if the launching future is dropped
/// before the playback session id was stored.
struct Reservation {
    state: Arc<Mutex<EngineState>>,
    schedule_id: ScheduleId,
    execution_id: ExecutionId,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if let Some(flight) = state.in_flight.get_mut(&self.schedule_id)
            && flight.record.id == self.execution_id
            && flight.session.is_none()
        {
            flight.abandoned = true;
        }
    }
}

/// Terminal outcome of a finished playback session, `None` while running.
fn outcome(status: &PlaybackStatus) -> Option<(ExecutionStatus, Option<String>)> {
    match status.state {
        PlaybackState::Running => None,
        PlaybackState::Completed => Some((ExecutionStatus::Completed, None)),
        PlaybackState::Failed => Some((
            ExecutionStatus::Failed,
            Some(
                status
                    .error
                    .clone()
                    .unwrap_or_else(|| "playback failed".to_string()),
            ),
        )),
        PlaybackState::Cancelled => Some((
            ExecutionStatus::Cancelled,
            Some(
                status
                    .error
                    .clone()
                    .unwrap_or_else(|| "playback cancelled".to_string()),
            ),
        )),
    }
}

impl Scheduler {
    /// Start one execution of `schedule`.
    ///
    /// The cap and the one-execution-per-schedule rule are checked and the
    /// slot reserved under a single lock acquisition.
    pub(super) async fn launch(&self, schedule: Schedule) -> Result<Launch> {
        let schedule_id = schedule.id;
        let execution_id = {
            let mut state = self.state.lock();
            if state.in_flight.contains_key(&schedule_id) {
                return Ok(Launch::Busy);
            }
            if state.in_flight.len() >= self.config.max_concurrent_executions {
                return Ok(Launch::AtCapacity);
            }
            let record =
                ExecutionRecord::start(schedule_id, schedule.recording_id.clone(), Utc::now());
            let execution_id = record.id;
            let reserved_at = Instant::now();
            let timeout = schedule.execution_timeout();
            state.in_flight.insert(
                schedule_id,
                InFlight {
                    span: start_execution_span(
                        &schedule_id,
                        &execution_id,
                        &schedule.recording_id,
                    ),
                    record,
                    session: None,
                    deadline: reserved_at.checked_add(timeout),
                    timeout,
                    launch_deadline: reserved_at
                        .checked_add(self.config.collaborator_timeout.saturating_mul(LAUNCH_CALLS)),
                    abandoned: false,
                    keep_active: true,
                    cancel_requested: false,
                },
            );
            execution_id
        };
        let _reservation = Reservation {
            state: Arc::clone(&self.state),
            schedule_id,
            execution_id,
        };

        // The listed copy may be stale; work from the stored schedule.
        let mut schedule = match self.load(schedule_id).await {
            Ok(Some(fresh)) if fresh.status == ScheduleStatus::Active => fresh,
            Ok(_) => {
                self.state.lock().in_flight.remove(&schedule_id);
                return Ok(Launch::Skipped);
            }
            Err(e) => {
                self.state.lock().in_flight.remove(&schedule_id);
                return Err(e);
            }
        };

        let now = Utc::now();
        let started = schedule.mark_running(now);
        let saved = match started {
            Ok(()) => self.save(schedule.clone()).await.map(|_| ()),
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            self.state.lock().in_flight.remove(&schedule_id);
            return Err(e);
        }

        let span = {
            let mut state = self.state.lock();
            state.in_flight.get_mut(&schedule_id).map(|flight| {
                flight.record.recording_id = schedule.recording_id.clone();
                flight.record.started_at = now;
                flight.span.clone()
            })
        };
        if let Some(span) = &span {
            record_state_transition(span, "pending", "running");
        }

        metrics::executions_started()
            .add(1, &[KeyValue::new("trigger", schedule.trigger.kind())]);
        info!(
            schedule_id = %schedule_id,
            execution_id = %execution_id,
            recording_id = %schedule.recording_id,
            "execution started"
        );
        self.publish(
            Event::new(EventKind::ExecutionStarted {
                execution_id,
                schedule_id,
                recording_id: schedule.recording_id.clone(),
            })
            .with_correlation_id(execution_id.0.to_string()),
        );

        let playback = Arc::clone(&self.playback);
        let recording_id = schedule.recording_id.clone();
        let playback_config = self.config.playback.clone();
        let session = self
            .call(move || playback.start_playback(&recording_id, &playback_config))
            .await;

        match session {
            Ok(session) => {
                let tracked = {
                    let mut state = self.state.lock();
                    match state.in_flight.get_mut(&schedule_id) {
                        Some(flight) if flight.record.id == execution_id => {
                            flight.record.session_id = Some(session.0.clone());
                            flight.session = Some(session.clone());
                            Some(flight.cancel_requested)
                        }
                        _ => None,
                    }
                };
                match tracked {
                    Some(true) => self.cancel_in_flight(schedule_id).await,
                    Some(false) => {}
                    None => {
                        // Reaped while starting; nothing will poll this session.
                        warn!(
                            schedule_id = %schedule_id,
                            session_id = %session,
                            "stopping untracked session"
                        );
                        self.stop_session(session).await;
                    }
                }
            }
            Err(e) => {
                warn!(
                    schedule_id = %schedule_id,
                    execution_id = %execution_id,
                    "playback start failed: {e}"
                );
                self.finalize(
                    schedule_id,
                    ExecutionStatus::Failed,
                    Some(format!("playback start failed: {e}")),
                    PlaybackProgress::default(),
                )
                .await;
            }
        }

        Ok(Launch::Started(execution_id))
    }

    /// Check every started session: finalize finished ones and stop the
    /// ones past their execution timeout.
    pub(super) async fn poll_in_flight(&self) {
        let now = Instant::now();
        let (sessions, stalled) = {
            let state = self.state.lock();
            let mut sessions: Vec<(ScheduleId, SessionId, bool, Duration)> = Vec::new();
            let mut stalled = Vec::new();
            for (id, flight) in &state.in_flight {
                match &flight.session {
                    Some(session) => sessions.push((
                        *id,
                        session.clone(),
                        flight.deadline.is_some_and(|deadline| now >= deadline),
                        flight.timeout,
                    )),
                    None if flight.abandoned
                        || flight.launch_deadline.is_some_and(|deadline| now >= deadline) =>
                    {
                        stalled.push(*id);
                    }
                    None => {}
                }
            }
            (sessions, stalled)
        };

        for schedule_id in stalled {
            warn!(schedule_id = %schedule_id, "launch never received a session, reaping");
            self.finalize(
                schedule_id,
                ExecutionStatus::Failed,
                Some("launch interrupted before playback started".to_string()),
                PlaybackProgress::default(),
            )
            .await;
        }

        for (schedule_id, session, expired, timeout) in sessions {
            if expired {
                warn!(schedule_id = %schedule_id, session_id = %session, "execution timed out");
                let progress = self.stop_session(session).await;
                self.finalize(
                    schedule_id,
                    ExecutionStatus::Failed,
                    Some(format!("execution timed out after {}s", timeout.as_secs())),
                    progress,
                )
                .await;
                continue;
            }

            let playback = Arc::clone(&self.playback);
            let polled = session.clone();
            let status = self.call(move || playback.get_status(&polled)).await;
            match status {
                Ok(status) => match outcome(&status) {
                    Some((final_status, error)) => {
                        self.finalize(schedule_id, final_status, error, status.progress)
                            .await;
                    }
                    None => {
                        let mut state = self.state.lock();
                        if let Some(flight) = state.in_flight.get_mut(&schedule_id) {
                            flight.record.actions_executed = status.progress.actions_executed;
                            flight.record.total_actions = status.progress.total_actions;
                        }
                    }
                },
                Err(e) => {
                    warn!(
                        schedule_id = %schedule_id,
                        session_id = %session,
                        "status poll failed: {e}"
                    );
                }
            }
        }
    }

    /// Stop a session that was forcibly deactivated and record it cancelled.
    pub(super) async fn cancel_in_flight(&self, schedule_id: ScheduleId) {
        let session = {
            let state = self.state.lock();
            state
                .in_flight
                .get(&schedule_id)
                .and_then(|flight| flight.session.clone())
        };
        let Some(session) = session else {
            return;
        };
        let progress = self.stop_session(session).await;
        self.finalize(
            schedule_id,
            ExecutionStatus::Cancelled,
            Some("cancelled by forced deactivation".to_string()),
            progress,
        )
        .await;
    }

    async fn stop_session(&self, session: SessionId) -> PlaybackProgress {
        let playback = Arc::clone(&self.playback);
        let stopping = session.clone();
        match self.call(move || playback.stop_playback(&stopping)).await {
            Ok(summary) => summary.progress,
            Err(e) => {
                warn!(session_id = %session, "stop_playback failed: {e}");
                PlaybackProgress::default()
            }
        }
    }

    /// Seal the execution record, release and re-arm the schedule, report
    /// the record and publish the outcome. Exactly one caller wins the
    /// removal from the in-flight map; later calls are no-ops.
    ///
    /// The release is queued in the same lock acquisition as the removal,
    /// so a failed or interrupted release is retried by the next tick.
    pub(super) async fn finalize(
        &self,
        schedule_id: ScheduleId,
        status: ExecutionStatus,
        error: Option<String>,
        progress: PlaybackProgress,
    ) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.in_flight.remove(&schedule_id);
            if let Some(flight) = &removed {
                state.pending_releases.insert(
                    schedule_id,
                    PendingRelease {
                        success: status == ExecutionStatus::Completed,
                        keep_active: flight.keep_active,
                    },
                );
            }
            removed
        };
        let Some(flight) = removed else {
            return;
        };
        let InFlight {
            mut record, span, ..
        } = flight;

        let now = Utc::now();
        if progress.total_actions > 0 || progress.actions_executed > 0 {
            record.actions_executed = progress.actions_executed;
            record.total_actions = progress.total_actions;
        }
        if let Err(e) = record.finalize(status, error, now) {
            warn!(execution_id = %record.id, "execution already finalized: {e}");
        }
        record_state_transition(&span, "running", &status.to_string());

        self.retry_release(schedule_id).await;

        if let Err(e) = self.report(record.clone()).await {
            warn!(execution_id = %record.id, "failed to report execution, will retry: {e}");
            self.state.lock().unreported.push(record.clone());
        }

        let duration_ms = record.duration_ms();
        {
            let mut state = self.state.lock();
            state.history.push_back(record.clone());
            while state.history.len() > self.config.history_limit {
                state.history.pop_front();
            }
        }
        self.counters.lock().record(status, duration_ms);

        let labels = [KeyValue::new("status", status.to_string())];
        metrics::executions_finished().add(1, &labels);
        metrics::execution_duration_ms().record(duration_ms as f64, &labels);

        let event = match status {
            ExecutionStatus::Completed => {
                info!(
                    schedule_id = %schedule_id,
                    execution_id = %record.id,
                    duration_ms,
                    actions = record.actions_executed,
                    "execution completed"
                );
                EventKind::ExecutionCompleted {
                    execution_id: record.id,
                    schedule_id,
                    duration_ms,
                    actions_executed: record.actions_executed,
                    total_actions: record.total_actions,
                }
            }
            _ => {
                let error = record.error.clone().unwrap_or_else(|| status.to_string());
                warn!(
                    schedule_id = %schedule_id,
                    execution_id = %record.id,
                    status = %status,
                    duration_ms,
                    %error,
                    "execution did not complete"
                );
                EventKind::ExecutionFailed {
                    execution_id: record.id,
                    schedule_id,
                    error,
                    duration_ms,
                }
            }
        };
        self.publish(Event::new(event).with_correlation_id(record.id.0.to_string()));
    }

    /// Retry queued schedule releases and execution reports that failed
    /// earlier.
    pub(super) async fn retry_pending(&self) {
        let releases: Vec<ScheduleId> =
            self.state.lock().pending_releases.keys().copied().collect();
        for schedule_id in releases {
            self.retry_release(schedule_id).await;
        }

        let records = std::mem::take(&mut self.state.lock().unreported);
        for record in records {
            if let Err(e) = self.report(record.clone()).await {
                debug!(execution_id = %record.id, "execution report still failing: {e}");
                self.state.lock().unreported.push(record);
            }
        }
    }

    /// Apply the queued release for `schedule_id`. Returns true once the
    /// release no longer needs retrying.
    pub(super) async fn retry_release(&self, schedule_id: ScheduleId) -> bool {
        let Some(release) = self
            .state
            .lock()
            .pending_releases
            .get(&schedule_id)
            .copied()
        else {
            return true;
        };
        let settled = self.release_schedule(schedule_id, release).await;
        if settled {
            self.state.lock().pending_releases.remove(&schedule_id);
        }
        settled
    }

    async fn report(&self, record: ExecutionRecord) -> Result<()> {
        let repository = Arc::clone(&self.repository);
        self.call(move || repository.record_execution(&record)).await
    }

    /// RUNNING → ACTIVE/INACTIVE with counters and repeat bookkeeping.
    /// Returns false when the repository could not be reached.
    async fn release_schedule(&self, schedule_id: ScheduleId, release: PendingRelease) -> bool {
        let PendingRelease {
            success,
            keep_active,
        } = release;
        let mut schedule = match self.load(schedule_id).await {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                warn!(schedule_id = %schedule_id, "schedule vanished during execution");
                return true;
            }
            Err(e) => {
                error!(schedule_id = %schedule_id, "failed to load schedule, will retry: {e}");
                return false;
            }
        };
        if schedule.status != ScheduleStatus::Running {
            debug!(
                schedule_id = %schedule_id,
                status = %schedule.status,
                "schedule not running, counters untouched"
            );
            return true;
        }

        let next = match schedule.finish_execution(success, keep_active, Utc::now()) {
            Ok(next) => next,
            Err(e) => {
                error!(schedule_id = %schedule_id, "cannot release schedule: {e}");
                return true;
            }
        };
        let next_execution_at = schedule.next_execution_at;
        if let Err(e) = self.save(schedule).await {
            error!(schedule_id = %schedule_id, "failed to save schedule, will retry: {e}");
            return false;
        }

        if next == ScheduleStatus::Inactive {
            let reason = if keep_active {
                "repeat condition exhausted"
            } else {
                "deactivated during execution"
            };
            info!(schedule_id = %schedule_id, reason, "schedule deactivated");
            self.publish(Event::new(EventKind::ScheduleDeactivated {
                schedule_id,
                reason: reason.to_string(),
            }));
        } else {
            debug!(
                schedule_id = %schedule_id,
                next_execution_at = ?next_execution_at,
                "schedule re-armed"
            );
        }
        true
    }
}
