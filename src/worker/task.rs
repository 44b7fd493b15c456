//! Managed task types: identity, state machine, cooperative control and
//! completion snapshots.

use std::any::Any;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Identity and state
// ---------------------------------------------------------------------------

/// Newtype for managed task IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Lifecycle state of a managed task.
///
/// ```text
/// Created → Running → {Completed | Failed | Cancelled}
///              ↕
///            Paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(self, to: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, to),
            (Created, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Created | Running | Paused, Completed | Failed | Cancelled)
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Created => "created",
            TaskState::Running => "running",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Scheduling hint carried with a task. Informational only.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

// ---------------------------------------------------------------------------
// Cooperative control
// ---------------------------------------------------------------------------

#[derive(Default)]
pub(crate) struct Control {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    gate: Condvar,
}

impl Control {
    pub(crate) fn pause(&self) {
        *self.paused.lock() = true;
    }

    pub(crate) fn resume(&self) {
        *self.paused.lock() = false;
        self.gate.notify_all();
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Take the lock so a waiter between its flag check and wait() sees
        // the notification.
        let _paused = self.paused.lock();
        self.gate.notify_all();
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Handle given to a managed task body. Long-running bodies call
/// [`TaskContext::checkpoint`] between steps.
#[derive(Clone)]
pub struct TaskContext {
    id: TaskId,
    control: Arc<Control>,
}

impl TaskContext {
    pub(crate) fn new(id: TaskId, control: Arc<Control>) -> Self {
        Self { id, control }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Block while the task is paused. Returns `Error::Cancelled` once the
    /// task has been cancelled, whether or not it was paused.
    pub fn checkpoint(&self) -> Result<()> {
        if self.control.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut paused = self.control.paused.lock();
        while *paused && !self.control.is_cancelled() {
            self.control.gate.wait(&mut paused);
        }
        drop(paused);

        if self.control.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Options and results
// ---------------------------------------------------------------------------

type SuccessCallback<T> = Box<dyn FnOnce(&T) + Send>;
type ErrorCallback = Box<dyn FnOnce(&Error) + Send>;

/// Options for [`super::TaskManager::run_with_callback`].
pub struct TaskOptions<T> {
    pub(crate) name: String,
    pub(crate) priority: TaskPriority,
    pub(crate) on_success: Option<SuccessCallback<T>>,
    pub(crate) on_error: Option<ErrorCallback>,
}

impl<T> TaskOptions<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: TaskPriority::Normal,
            on_success: None,
            on_error: None,
        }
    }

    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_success(mut self, callback: impl FnOnce(&T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(&Error) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

/// Point-in-time snapshot of a managed task.
#[derive(Clone)]
pub struct TaskResult {
    pub task_id: TaskId,
    pub name: String,
    pub priority: TaskPriority,
    pub state: TaskState,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub(crate) value: Option<Arc<dyn Any + Send + Sync>>,
}

impl TaskResult {
    /// The task's return value, if it completed and was of type `R`.
    pub fn result<R: Any + Clone>(&self) -> Option<R> {
        self.value
            .as_ref()
            .and_then(|value| value.downcast_ref::<R>())
            .cloned()
    }

    /// Time spent since the task started (or was created, if it never
    /// started), up to now while still active.
    pub fn elapsed(&self) -> std::time::Duration {
        let from = self.started_at.unwrap_or(self.created_at);
        let to = self.finished_at.unwrap_or_else(Utc::now);
        (to - from).to_std().unwrap_or_default()
    }
}

impl std::fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskResult")
            .field("task_id", &self.task_id)
            .field("name", &self.name)
            .field("state", &self.state)
            .field("error", &self.error)
            .field("has_value", &self.value.is_some())
            .finish()
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic with non-string payload".to_string()
    }
}
