//! Core data model.
//!
//! A schedule binds a recording (owned elsewhere, referenced by id) to a
//! trigger condition and a repeat condition. Each launch of a schedule
//! produces an execution record.

pub mod execution;
pub mod schedule;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use execution::{ExecutionRecord, ExecutionStatus};
pub use schedule::{NewSchedule, RepeatCondition, Schedule, TriggerCondition};

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Newtype for schedule IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScheduleId(pub Uuid);

impl ScheduleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ScheduleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ScheduleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of UUID
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Newtype for execution IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

// ---------------------------------------------------------------------------
// Schedule status
// ---------------------------------------------------------------------------

/// Lifecycle state of a schedule.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    /// Not evaluated by the engine.
    #[default]
    Inactive,
    /// Armed; the engine launches it when due.
    Active,
    /// An execution is in flight. Engine-internal.
    Running,
}

impl ScheduleStatus {
    /// Can transition from self to `to`?
    pub fn can_transition_to(self, to: ScheduleStatus) -> bool {
        use ScheduleStatus::*;
        matches!(
            (self, to),
            (Inactive, Active)
                | (Active, Inactive)
                | (Active, Running)
                | (Running, Active)     // re-armed after a run
                | (Running, Inactive) // repeat exhausted or deactivated mid-flight
        )
    }
}

impl std::fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleStatus::Inactive => "inactive",
            ScheduleStatus::Active => "active",
            ScheduleStatus::Running => "running",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for ScheduleStatus {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inactive" => Ok(ScheduleStatus::Inactive),
            "active" => Ok(ScheduleStatus::Active),
            "running" => Ok(ScheduleStatus::Running),
            other => Err(crate::error::Error::Validation(format!(
                "unknown schedule status: {other}"
            ))),
        }
    }
}
