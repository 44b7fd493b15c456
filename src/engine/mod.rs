//! Schedule execution engine.
//!
//! A polling loop ([`control`]) evaluates active schedules against the
//! clock and launches due ones through the playback collaborator, under a
//! concurrency cap. Execution lifecycle (start, poll, timeout, finalize)
//! lives in [`execution`]. Collaborator calls run on the task manager's
//! pool, bounded by `collaborator_timeout`.

pub mod control;
pub mod execution;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::{ForcedDeactivation, SchedulerConfig};
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::model::{
    ExecutionId, ExecutionRecord, ExecutionStatus, Schedule, ScheduleId, ScheduleStatus,
};
use crate::playback::PlaybackService;
use crate::storage::ScheduleRepository;
use crate::worker::TaskManager;

use control::LoopHandle;
use execution::{InFlight, Launch};

/// Result of [`Scheduler::fire_now`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Started(ExecutionId),
    /// At the concurrency cap; the next tick with a free slot starts it.
    Deferred,
}

/// Point-in-time engine statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatistics {
    pub is_running: bool,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    pub success_rate: f64,
    pub average_duration_ms: f64,
    pub in_flight: usize,
    pub pending_fires: usize,
    /// Finished executions whose schedule is not yet released.
    pub pending_releases: usize,
    pub ticks: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct Counters {
    total: u64,
    successful: u64,
    failed: u64,
    cancelled: u64,
    total_duration_ms: u64,
    ticks: u64,
    last_tick_at: Option<DateTime<Utc>>,
}

impl Counters {
    fn record(&mut self, status: ExecutionStatus, duration_ms: u64) {
        self.total += 1;
        self.total_duration_ms = self.total_duration_ms.saturating_add(duration_ms);
        match status {
            ExecutionStatus::Completed => self.successful += 1,
            ExecutionStatus::Failed => self.failed += 1,
            ExecutionStatus::Cancelled => self.cancelled += 1,
            ExecutionStatus::Running => {}
        }
    }
}

/// Outcome waiting to be written back to a RUNNING schedule.
#[derive(Debug, Clone, Copy)]
struct PendingRelease {
    success: bool,
    keep_active: bool,
}

#[derive(Default)]
struct EngineState {
    in_flight: HashMap<ScheduleId, InFlight>,
    pending_fires: HashSet<ScheduleId>,
    pending_releases: HashMap<ScheduleId, PendingRelease>,
    /// Finalized records the repository has not accepted yet.
    unreported: Vec<ExecutionRecord>,
    history: VecDeque<ExecutionRecord>,
}

/// The schedule execution engine.
pub struct Scheduler {
    config: SchedulerConfig,
    repository: Arc<dyn ScheduleRepository>,
    playback: Arc<dyn PlaybackService>,
    tasks: TaskManager,
    bus: Option<EventBus>,
    state: Arc<Mutex<EngineState>>,
    counters: Arc<Mutex<Counters>>,
    running: Arc<Mutex<Option<LoopHandle>>>,
}

impl Clone for Scheduler {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            repository: Arc::clone(&self.repository),
            playback: Arc::clone(&self.playback),
            tasks: self.tasks.clone(),
            bus: self.bus.clone(),
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
            running: Arc::clone(&self.running),
        }
    }
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        repository: Arc<dyn ScheduleRepository>,
        playback: Arc<dyn PlaybackService>,
        tasks: TaskManager,
    ) -> Self {
        Self {
            config,
            repository,
            playback,
            tasks,
            bus: None,
            state: Arc::new(Mutex::new(EngineState::default())),
            counters: Arc::new(Mutex::new(Counters::default())),
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Publish lifecycle events on `bus`.
    pub fn with_event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // -- Schedule control ---------------------------------------------------

    /// Validate and arm a schedule. Returns the stored schedule with its
    /// first execution time. An already active schedule without one is
    /// armed as well.
    pub async fn activate(&self, id: ScheduleId) -> Result<Schedule> {
        let mut schedule = self.require(id).await?;
        if !schedule.activate(Utc::now())? {
            return Ok(schedule);
        }
        self.save(schedule.clone()).await?;

        info!(
            schedule_id = %id,
            name = %schedule.name,
            trigger = schedule.trigger.kind(),
            next_execution_at = ?schedule.next_execution_at,
            "schedule activated"
        );
        self.publish(Event::new(EventKind::ScheduleActivated {
            schedule_id: id,
            next_execution_at: schedule.next_execution_at,
        }));
        Ok(schedule)
    }

    /// Disarm a schedule.
    ///
    /// With an execution in flight this fails with `ScheduleRunning` unless
    /// `force` is set, in which case the configured [`ForcedDeactivation`]
    /// policy applies.
    pub async fn deactivate(&self, id: ScheduleId, force: bool) -> Result<()> {
        let mut schedule = self.require(id).await?;
        let (in_flight, releasing) = {
            let mut state = self.state.lock();
            let releasing = match state.pending_releases.get_mut(&id) {
                Some(release) => {
                    release.keep_active = false;
                    true
                }
                None => false,
            };
            (state.in_flight.contains_key(&id), releasing)
        };

        if releasing {
            self.state.lock().pending_fires.remove(&id);
            if !self.retry_release(id).await {
                info!(schedule_id = %id, "deactivation queued behind a pending release");
            }
            return Ok(());
        }

        if !in_flight {
            if schedule.status == ScheduleStatus::Running {
                // Left RUNNING by an execution this engine no longer tracks.
                warn!(schedule_id = %id, "releasing stale running schedule");
                schedule.status = ScheduleStatus::Inactive;
                schedule.next_execution_at = None;
                schedule.updated_at = Utc::now();
            } else {
                if schedule.status == ScheduleStatus::Inactive {
                    return Ok(());
                }
                schedule.deactivate(Utc::now())?;
            }
            self.save(schedule).await?;
            self.state.lock().pending_fires.remove(&id);
            info!(schedule_id = %id, "schedule deactivated");
            self.publish(Event::new(EventKind::ScheduleDeactivated {
                schedule_id: id,
                reason: "deactivated".into(),
            }));
            return Ok(());
        }

        if !force {
            return Err(Error::ScheduleRunning(id.to_string()));
        }

        let policy = self.config.forced_deactivation;
        let session = {
            let mut state = self.state.lock();
            state.pending_fires.remove(&id);
            state.in_flight.get_mut(&id).and_then(|flight| {
                flight.keep_active = false;
                flight.cancel_requested = policy == ForcedDeactivation::Cancel;
                flight.session.clone()
            })
        };

        info!(schedule_id = %id, policy = ?policy, "forced deactivation");
        if policy == ForcedDeactivation::Cancel && session.is_some() {
            self.cancel_in_flight(id).await;
        }
        // LetFinish: the schedule goes INACTIVE when the execution finalizes.
        Ok(())
    }

    /// Launch a schedule now, regardless of its trigger.
    ///
    /// This is how externally signalled triggers (hotkey, file watch,
    /// startup, idle) reach the engine. At the concurrency cap the fire is
    /// remembered and started by a later tick.
    pub async fn fire_now(&self, id: ScheduleId) -> Result<FireOutcome> {
        let schedule = self.require(id).await?;
        match schedule.status {
            ScheduleStatus::Active => {}
            ScheduleStatus::Running => return Err(Error::ScheduleRunning(id.to_string())),
            ScheduleStatus::Inactive => {
                return Err(Error::InvalidTransition {
                    from: ScheduleStatus::Inactive.to_string(),
                    to: ScheduleStatus::Running.to_string(),
                });
            }
        }

        match self.launch(schedule).await? {
            Launch::Started(execution_id) => Ok(FireOutcome::Started(execution_id)),
            Launch::Busy => Err(Error::ScheduleRunning(id.to_string())),
            Launch::Skipped => Err(Error::InvalidTransition {
                from: ScheduleStatus::Inactive.to_string(),
                to: ScheduleStatus::Running.to_string(),
            }),
            Launch::AtCapacity => {
                self.state.lock().pending_fires.insert(id);
                info!(schedule_id = %id, "at capacity, fire deferred");
                Ok(FireOutcome::Deferred)
            }
        }
    }

    // -- Introspection ------------------------------------------------------

    pub fn statistics(&self) -> SchedulerStatistics {
        let (in_flight, pending_fires, pending_releases) = {
            let state = self.state.lock();
            (
                state.in_flight.len(),
                state.pending_fires.len(),
                state.pending_releases.len(),
            )
        };
        let counters = self.counters.lock();
        let finished = counters.total.max(1) as f64;
        SchedulerStatistics {
            is_running: self.is_running(),
            total_executions: counters.total,
            successful_executions: counters.successful,
            failed_executions: counters.failed,
            cancelled_executions: counters.cancelled,
            success_rate: if counters.total == 0 {
                0.0
            } else {
                counters.successful as f64 / finished
            },
            average_duration_ms: if counters.total == 0 {
                0.0
            } else {
                counters.total_duration_ms as f64 / finished
            },
            in_flight,
            pending_fires,
            pending_releases,
            ticks: counters.ticks,
            last_tick_at: counters.last_tick_at,
        }
    }

    /// Records of executions currently in flight.
    pub fn in_flight(&self) -> Vec<ExecutionRecord> {
        self.state
            .lock()
            .in_flight
            .values()
            .map(|flight| flight.record.clone())
            .collect()
    }

    /// Recently finalized executions, oldest first.
    pub fn history(&self) -> Vec<ExecutionRecord> {
        self.state.lock().history.iter().cloned().collect()
    }

    // -- Collaborators ------------------------------------------------------

    /// Run a blocking collaborator call on the task manager's pool.
    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.tasks
            .run_in_background(
                move || f().map_err(anyhow::Error::from),
                Some(self.config.collaborator_timeout),
            )?
            .await
    }

    async fn load(&self, id: ScheduleId) -> Result<Option<Schedule>> {
        let repository = Arc::clone(&self.repository);
        self.call(move || repository.get(id)).await
    }

    async fn require(&self, id: ScheduleId) -> Result<Schedule> {
        self.load(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("schedule {id}")))
    }

    async fn save(&self, schedule: Schedule) -> Result<bool> {
        let repository = Arc::clone(&self.repository);
        self.call(move || repository.save(&schedule)).await
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus
            && let Err(e) = bus.publish(event)
        {
            warn!("scheduler event not published: {e}");
        }
    }
}
