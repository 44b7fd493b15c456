//! Managed background work.
//!
//! Two execution paths:
//! - [`TaskManager::run_in_background`]: a closure on the bounded blocking
//!   pool, awaited as a future, optionally bounded by a timeout. A timed-out
//!   closure is abandoned, never killed.
//! - [`TaskManager::run_with_callback`]: a named, tracked task on its own
//!   thread with pause/resume/cancel and exactly-once completion callbacks.
//!
//! Tracked tasks live in a locked registry while active and move to a
//! bounded history when they finish.

pub mod task;

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use opentelemetry::KeyValue;
use parking_lot::{Condvar, Mutex};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::config::TaskManagerConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::telemetry::metrics;

pub use task::{TaskContext, TaskId, TaskOptions, TaskPriority, TaskResult, TaskState};
use task::{Control, panic_message};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

struct ActiveTask {
    name: String,
    priority: TaskPriority,
    state: TaskState,
    control: Arc<Control>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl ActiveTask {
    fn snapshot(&self, task_id: TaskId) -> TaskResult {
        TaskResult {
            task_id,
            name: self.name.clone(),
            priority: self.priority,
            state: self.state,
            error: None,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: None,
            value: None,
        }
    }
}

#[derive(Default)]
struct Registry {
    active: HashMap<TaskId, ActiveTask>,
    history: VecDeque<TaskResult>,
}

impl Registry {
    fn retire(&mut self, result: TaskResult, limit: usize, max_age: Duration) {
        self.active.remove(&result.task_id);
        self.history.push_back(result);

        while self.history.len() > limit {
            self.history.pop_front();
        }
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        while self
            .history
            .front()
            .is_some_and(|oldest| oldest.finished_at.is_some_and(|at| at < cutoff))
        {
            self.history.pop_front();
        }
    }
}

struct Inner {
    config: TaskManagerConfig,
    registry: Mutex<Registry>,
    drained: Condvar,
    pool: Arc<Semaphore>,
    runtime: Option<Handle>,
    bus: Option<EventBus>,
    shut_down: AtomicBool,
}

// ---------------------------------------------------------------------------
// TaskManager
// ---------------------------------------------------------------------------

/// Runs and tracks background work. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    /// Build a manager. When called inside a tokio runtime the runtime is
    /// captured for [`run_in_background`](Self::run_in_background);
    /// otherwise it is looked up at submission time.
    pub fn new(config: TaskManagerConfig) -> Self {
        Self::build(config, None)
    }

    /// Build a manager that reports `TaskStarted`/`TaskCompleted` events.
    pub fn with_event_bus(config: TaskManagerConfig, bus: EventBus) -> Self {
        Self::build(config, Some(bus))
    }

    fn build(config: TaskManagerConfig, bus: Option<EventBus>) -> Self {
        let workers = config.workers.max(1);
        Self {
            inner: Arc::new(Inner {
                config,
                registry: Mutex::new(Registry::default()),
                drained: Condvar::new(),
                pool: Arc::new(Semaphore::new(workers)),
                runtime: Handle::try_current().ok(),
                bus,
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            Err(Error::ShutDown("task manager"))
        } else {
            Ok(())
        }
    }

    fn runtime(&self) -> Result<Handle> {
        self.inner
            .runtime
            .clone()
            .or_else(|| Handle::try_current().ok())
            .ok_or_else(|| Error::Config("run_in_background requires a tokio runtime".into()))
    }

    /// Run `task` on the bounded worker pool.
    ///
    /// With a timeout, the returned future resolves to `Error::Timeout`
    /// once the deadline passes (measured from submission). The closure
    /// keeps running to completion in the background but gives its pool
    /// slot back at the deadline, so a hung closure cannot starve later
    /// submissions.
    pub fn run_in_background<T, F>(
        &self,
        task: F,
        timeout: Option<Duration>,
    ) -> Result<Background<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.ensure_accepting()?;
        let runtime = self.runtime()?;
        let pool = Arc::clone(&self.inner.pool);
        let deadline = timeout.map(|limit| (tokio::time::Instant::now() + limit, limit));

        let handle = runtime.spawn(async move {
            let work = async move {
                // Held by this future: dropped when the deadline cancels it.
                let _permit = pool
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::ShutDown("task manager"))?;
                let joined = tokio::task::spawn_blocking(task).await;
                match joined {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(Error::Task(format!("{e:#}"))),
                    Err(e) if e.is_panic() => Err(Error::Join(panic_message(&*e.into_panic()))),
                    Err(e) => Err(Error::Join(e.to_string())),
                }
            };

            match deadline {
                Some((at, limit)) => tokio::time::timeout_at(at, work)
                    .await
                    .map_err(|_| Error::Timeout(limit))?,
                None => work.await,
            }
        });

        Ok(Background { handle })
    }

    /// Run a named, tracked task on a dedicated thread.
    ///
    /// Exactly one of the callbacks runs when the task finishes: `on_success`
    /// with the value, or `on_error` with the failure (`Error::Cancelled`
    /// when the task was cancelled).
    pub fn run_with_callback<T, F>(&self, options: TaskOptions<T>, task: F) -> Result<TaskId>
    where
        F: FnOnce(&TaskContext) -> anyhow::Result<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        self.ensure_accepting()?;

        let task_id = TaskId::new();
        let control = Arc::new(Control::default());
        self.inner.registry.lock().active.insert(
            task_id,
            ActiveTask {
                name: options.name.clone(),
                priority: options.priority,
                state: TaskState::Created,
                control: Arc::clone(&control),
                created_at: Utc::now(),
                started_at: None,
            },
        );

        let manager = self.clone();
        let ctx = TaskContext::new(task_id, control);
        let spawned = std::thread::Builder::new()
            .name(format!("task-{}", options.name))
            .spawn(move || manager.drive(ctx, options, task));

        if let Err(e) = spawned {
            self.inner.registry.lock().active.remove(&task_id);
            self.inner.drained.notify_all();
            return Err(Error::Io(e));
        }

        debug!(task_id = %task_id, "task submitted");
        Ok(task_id)
    }

    /// Body of a tracked task's thread.
    fn drive<T, F>(&self, ctx: TaskContext, options: TaskOptions<T>, task: F)
    where
        F: FnOnce(&TaskContext) -> anyhow::Result<T>,
        T: Send + Sync + 'static,
    {
        let task_id = ctx.id();
        let TaskOptions {
            name,
            on_success,
            on_error,
            ..
        } = options;

        {
            let mut registry = self.inner.registry.lock();
            if let Some(entry) = registry.active.get_mut(&task_id) {
                entry.started_at = Some(Utc::now());
                if entry.state == TaskState::Created {
                    entry.state = TaskState::Running;
                }
            }
        }
        self.publish(Event::new(EventKind::TaskStarted {
            task_id,
            name: name.clone(),
        }));

        let outcome = ctx.checkpoint().and_then(|()| {
            match catch_unwind(AssertUnwindSafe(|| task(&ctx))) {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(Error::Task(format!("{e:#}"))),
                Err(payload) => Err(Error::Task(format!(
                    "task panicked: {}",
                    panic_message(&*payload)
                ))),
            }
        });

        let (state, value, error) = match outcome {
            _ if ctx.is_cancelled() => (TaskState::Cancelled, None, Some(Error::Cancelled)),
            Ok(value) => (TaskState::Completed, Some(Arc::new(value)), None),
            Err(Error::Cancelled) => (TaskState::Cancelled, None, Some(Error::Cancelled)),
            Err(e) => (TaskState::Failed, None, Some(e)),
        };

        let callback = catch_unwind(AssertUnwindSafe(|| match (&value, &error) {
            (Some(value), _) => {
                if let Some(on_success) = on_success {
                    on_success(&**value);
                }
            }
            (None, Some(error)) => {
                if let Some(on_error) = on_error {
                    on_error(error);
                }
            }
            (None, None) => {}
        }));
        if let Err(payload) = callback {
            warn!(task_id = %task_id, "completion callback panicked: {}", panic_message(&*payload));
        }

        let finished_at = Utc::now();
        let result = {
            let mut registry = self.inner.registry.lock();
            let entry = registry.active.get(&task_id);
            let result = TaskResult {
                task_id,
                name: name.clone(),
                priority: entry.map(|e| e.priority).unwrap_or_default(),
                state,
                error: error.as_ref().map(ToString::to_string),
                created_at: entry.map(|e| e.created_at).unwrap_or(finished_at),
                started_at: entry.and_then(|e| e.started_at),
                finished_at: Some(finished_at),
                value: value.map(|v| v as Arc<dyn std::any::Any + Send + Sync>),
            };
            registry.retire(
                result.clone(),
                self.inner.config.history_limit,
                self.inner.config.history_max_age,
            );
            result
        };
        self.inner.drained.notify_all();

        metrics::tasks_finished().add(1, &[KeyValue::new("state", state.to_string())]);
        match state {
            TaskState::Failed => warn!(
                task_id = %task_id,
                name = %name,
                error = result.error.as_deref().unwrap_or_default(),
                "task failed"
            ),
            _ => debug!(task_id = %task_id, name = %name, state = %state, "task finished"),
        }

        let duration_ms = u64::try_from(result.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.publish(Event::new(EventKind::TaskCompleted {
            task_id,
            name,
            state,
            duration_ms,
        }));
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.inner.bus
            && let Err(e) = bus.publish(event)
        {
            debug!("task event not published: {e}");
        }
    }

    fn with_active<R>(
        &self,
        task_id: TaskId,
        f: impl FnOnce(&mut ActiveTask) -> Result<R>,
    ) -> Result<R> {
        let mut registry = self.inner.registry.lock();
        let entry = registry
            .active
            .get_mut(&task_id)
            .ok_or_else(|| Error::NotFound(format!("active task {task_id}")))?;
        f(entry)
    }

    /// Ask a task to stop at its next checkpoint.
    pub fn pause(&self, task_id: TaskId) -> Result<()> {
        self.with_active(task_id, |entry| {
            if entry.state == TaskState::Paused {
                return Ok(());
            }
            if !entry.state.can_transition_to(TaskState::Paused) {
                return Err(Error::InvalidTransition {
                    from: entry.state.to_string(),
                    to: TaskState::Paused.to_string(),
                });
            }
            entry.state = TaskState::Paused;
            entry.control.pause();
            Ok(())
        })
    }

    pub fn resume(&self, task_id: TaskId) -> Result<()> {
        self.with_active(task_id, |entry| {
            if entry.state != TaskState::Paused {
                return Err(Error::InvalidTransition {
                    from: entry.state.to_string(),
                    to: TaskState::Running.to_string(),
                });
            }
            entry.state = TaskState::Running;
            entry.control.resume();
            Ok(())
        })
    }

    /// Set the cancellation flag and open the pause gate. The task ends
    /// at its next checkpoint; it is never forcibly terminated.
    pub fn cancel(&self, task_id: TaskId) -> Result<()> {
        self.with_active(task_id, |entry| {
            entry.control.cancel();
            Ok(())
        })
    }

    /// Snapshot of an active task or one still retained in history.
    pub fn get_status(&self, task_id: TaskId) -> Result<TaskResult> {
        let registry = self.inner.registry.lock();
        if let Some(entry) = registry.active.get(&task_id) {
            return Ok(entry.snapshot(task_id));
        }
        registry
            .history
            .iter()
            .rev()
            .find(|result| result.task_id == task_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))
    }

    /// Snapshots of every task that has not finished yet.
    pub fn active_tasks(&self) -> Vec<TaskResult> {
        let registry = self.inner.registry.lock();
        registry
            .active
            .iter()
            .map(|(id, entry)| entry.snapshot(*id))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.inner.registry.lock().active.len()
    }

    /// Block until every tracked task finished or the timeout elapsed.
    /// Returns whether the registry drained.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut registry = self.inner.registry.lock();
        while !registry.active.is_empty() {
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .drained
                        .wait_until(&mut registry, deadline)
                        .timed_out()
                    {
                        return registry.active.is_empty();
                    }
                }
                None => self.inner.drained.wait(&mut registry),
            }
        }
        true
    }

    /// Stop accepting work, cancel every active task, wait up to `timeout`
    /// for them to finish, then close the pool. Returns whether all drained.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        if self.inner.shut_down.swap(true, Ordering::SeqCst) {
            return self.inner.registry.lock().active.is_empty();
        }

        let controls: Vec<Arc<Control>> = self
            .inner
            .registry
            .lock()
            .active
            .values()
            .map(|entry| Arc::clone(&entry.control))
            .collect();
        info!(active = controls.len(), "task manager shutting down");
        for control in controls {
            control.cancel();
        }

        let drained = self.wait_for_completion(Some(timeout));
        self.inner.pool.close();
        if !drained {
            warn!(
                remaining = self.active_count(),
                "task manager shutdown timed out"
            );
        }
        drained
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Background future
// ---------------------------------------------------------------------------

/// Result of [`TaskManager::run_in_background`]. Dropping it detaches the
/// work; it does not cancel it.
pub struct Background<T> {
    handle: JoinHandle<Result<T>>,
}

impl<T> Future for Background<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::Join(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
