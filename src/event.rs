//! Domain events carried by the event bus.
//!
//! Core engine events form a closed sum type ([`EventKind`]). Each kind sits
//! in a small type hierarchy ([`EventType`]) so a subscriber can listen to a
//! leaf (`ExecutionFailed`), a group (`Execution`) or everything (`Any`).
//! Application-defined events use [`EventKind::Custom`] with a topic and an
//! explicit list of ancestor topics.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::model::{ExecutionId, ScheduleId};
use crate::worker::{TaskId, TaskState};

/// Event priority. Also used as subscription (handler) priority.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

/// Newtype for event IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// An immutable notification routed through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    /// When the event was created.
    pub timestamp: DateTime<Utc>,
    /// Which component raised it.
    pub source: String,
    pub priority: EventPriority,
    /// Links related events (e.g. every event of one schedule execution).
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    RecordingStarted {
        recording_id: String,
        recording_name: String,
    },
    RecordingStopped {
        recording_id: String,
        action_count: u32,
        duration_ms: u64,
    },
    PlaybackStarted {
        recording_id: String,
        session_id: String,
    },
    PlaybackCompleted {
        recording_id: String,
        session_id: String,
        success: bool,
        error: Option<String>,
    },
    TaskStarted {
        task_id: TaskId,
        name: String,
    },
    TaskCompleted {
        task_id: TaskId,
        name: String,
        state: TaskState,
        duration_ms: u64,
    },
    ExecutionStarted {
        execution_id: ExecutionId,
        schedule_id: ScheduleId,
        recording_id: String,
    },
    ExecutionCompleted {
        execution_id: ExecutionId,
        schedule_id: ScheduleId,
        duration_ms: u64,
        actions_executed: u32,
        total_actions: u32,
    },
    ExecutionFailed {
        execution_id: ExecutionId,
        schedule_id: ScheduleId,
        error: String,
        duration_ms: u64,
    },
    ScheduleActivated {
        schedule_id: ScheduleId,
        next_execution_at: Option<DateTime<Utc>>,
    },
    ScheduleDeactivated {
        schedule_id: ScheduleId,
        reason: String,
    },
    Error {
        code: String,
        message: String,
        details: Option<String>,
        recoverable: bool,
    },
    System {
        name: String,
        #[serde(default)]
        info: Value,
    },
    /// Application-defined event. `ancestors` lists the topics this one
    /// specializes, nearest first.
    Custom {
        topic: String,
        #[serde(default)]
        ancestors: Vec<String>,
        #[serde(default)]
        data: Value,
    },
}

/// Subscription key. Every concrete kind maps to a leaf; groups match all
/// of their descendants and `Any` matches every event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Any,
    Recording,
    RecordingStarted,
    RecordingStopped,
    Playback,
    PlaybackStarted,
    PlaybackCompleted,
    Task,
    TaskStarted,
    TaskCompleted,
    Schedule,
    ScheduleActivated,
    ScheduleDeactivated,
    Execution,
    ExecutionStarted,
    ExecutionCompleted,
    ExecutionFailed,
    Error,
    System,
    Topic(String),
}

impl EventType {
    /// Convenience constructor for custom topics.
    pub fn topic(name: impl Into<String>) -> Self {
        EventType::Topic(name.into())
    }

    /// Direct parent in the built-in hierarchy. Topics have no static parent;
    /// their ancestry travels with the event.
    pub fn parent(&self) -> Option<EventType> {
        use EventType::*;
        match self {
            Any => None,
            Recording | Playback | Task | Schedule | Error | System => Some(Any),
            RecordingStarted | RecordingStopped => Some(Recording),
            PlaybackStarted | PlaybackCompleted => Some(Playback),
            TaskStarted | TaskCompleted => Some(Task),
            ScheduleActivated | ScheduleDeactivated | Execution => Some(Schedule),
            ExecutionStarted | ExecutionCompleted | ExecutionFailed => Some(Execution),
            Topic(_) => None,
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Topic(name) => write!(f, "topic:{name}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl EventKind {
    /// The leaf type of this kind.
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::RecordingStarted { .. } => EventType::RecordingStarted,
            EventKind::RecordingStopped { .. } => EventType::RecordingStopped,
            EventKind::PlaybackStarted { .. } => EventType::PlaybackStarted,
            EventKind::PlaybackCompleted { .. } => EventType::PlaybackCompleted,
            EventKind::TaskStarted { .. } => EventType::TaskStarted,
            EventKind::TaskCompleted { .. } => EventType::TaskCompleted,
            EventKind::ExecutionStarted { .. } => EventType::ExecutionStarted,
            EventKind::ExecutionCompleted { .. } => EventType::ExecutionCompleted,
            EventKind::ExecutionFailed { .. } => EventType::ExecutionFailed,
            EventKind::ScheduleActivated { .. } => EventType::ScheduleActivated,
            EventKind::ScheduleDeactivated { .. } => EventType::ScheduleDeactivated,
            EventKind::Error { .. } => EventType::Error,
            EventKind::System { .. } => EventType::System,
            EventKind::Custom { topic, .. } => EventType::Topic(topic.clone()),
        }
    }

    fn default_source(&self) -> &'static str {
        match self {
            EventKind::RecordingStarted { .. } | EventKind::RecordingStopped { .. } => {
                "recording_service"
            }
            EventKind::PlaybackStarted { .. } | EventKind::PlaybackCompleted { .. } => {
                "playback_service"
            }
            EventKind::TaskStarted { .. } | EventKind::TaskCompleted { .. } => "task_manager",
            EventKind::ExecutionStarted { .. }
            | EventKind::ExecutionCompleted { .. }
            | EventKind::ExecutionFailed { .. }
            | EventKind::ScheduleActivated { .. }
            | EventKind::ScheduleDeactivated { .. } => "scheduler",
            EventKind::Error { .. } => "error_handler",
            EventKind::System { .. } => "system",
            EventKind::Custom { .. } => "application",
        }
    }

    fn default_priority(&self) -> EventPriority {
        match self {
            EventKind::Error { .. } => EventPriority::High,
            _ => EventPriority::Normal,
        }
    }
}

impl Event {
    /// Create an event with the kind's default source and priority.
    pub fn new(kind: EventKind) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            source: kind.default_source().to_string(),
            priority: kind.default_priority(),
            correlation_id: None,
            metadata: Map::new(),
            kind,
        }
    }

    /// Error-report event, published at HIGH priority.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(EventKind::Error {
            code: code.into(),
            message: message.into(),
            details: None,
            recoverable: false,
        })
    }

    /// Custom topic event without ancestors.
    pub fn custom(topic: impl Into<String>, data: Value) -> Self {
        Self::new(EventKind::Custom {
            topic: topic.into(),
            ancestors: Vec::new(),
            data,
        })
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }

    /// Every type this event is dispatched under, most specific first.
    pub fn lineage(&self) -> Vec<EventType> {
        if let EventKind::Custom {
            topic, ancestors, ..
        } = &self.kind
        {
            let mut lineage = Vec::with_capacity(ancestors.len() + 2);
            lineage.push(EventType::Topic(topic.clone()));
            lineage.extend(ancestors.iter().cloned().map(EventType::Topic));
            lineage.push(EventType::Any);
            return lineage;
        }

        let mut lineage = vec![self.event_type()];
        while let Some(parent) = lineage.last().and_then(EventType::parent) {
            lineage.push(parent);
        }
        lineage
    }

    /// Error events are never re-reported when their handlers fail.
    pub fn is_error(&self) -> bool {
        matches!(self.kind, EventKind::Error { .. })
    }

    /// Dispatch order: higher priority first, then older first.
    pub fn dispatch_cmp(&self, other: &Event) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }
}
