//! Execution records: one per launch of a schedule.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ExecutionId, ScheduleId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Immutable once finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: ExecutionId,
    pub schedule_id: ScheduleId,
    pub recording_id: String,
    /// Playback session, once the collaborator accepted the start.
    pub session_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub success: bool,
    pub error: Option<String>,
    pub actions_executed: u32,
    pub total_actions: u32,
}

impl ExecutionRecord {
    pub fn start(
        schedule_id: ScheduleId,
        recording_id: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ExecutionId::new(),
            schedule_id,
            recording_id: recording_id.into(),
            session_id: None,
            started_at,
            completed_at: None,
            status: ExecutionStatus::Running,
            success: false,
            error: None,
            actions_executed: 0,
            total_actions: 0,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.status.is_terminal()
    }

    /// Seal the record. Fails if it was already finalized.
    pub fn finalize(
        &mut self,
        status: ExecutionStatus,
        error: Option<String>,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.is_finalized() {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        if !status.is_terminal() {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: status.to_string(),
            });
        }
        self.status = status;
        self.success = status == ExecutionStatus::Completed;
        self.error = error;
        self.completed_at = Some(completed_at);
        Ok(())
    }

    /// Wall time, up to now while still running.
    pub fn duration(&self) -> chrono::Duration {
        self.completed_at.unwrap_or_else(Utc::now) - self.started_at
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration().num_milliseconds()).unwrap_or(0)
    }

    pub fn completion_rate(&self) -> f64 {
        if self.total_actions == 0 {
            return 0.0;
        }
        f64::from(self.actions_executed) / f64::from(self.total_actions)
    }
}
