//! Schedule persistence interface and an in-memory implementation.
//!
//! The engine only reads active schedules, writes back status, counters
//! and next-execution times, and reports finalized execution records. It
//! never creates or deletes schedules.

use std::collections::HashMap;
use std::path::Path;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::model::{ExecutionRecord, Schedule, ScheduleId, ScheduleStatus};

pub trait ScheduleRepository: Send + Sync {
    /// Schedules with status ACTIVE.
    fn list_active(&self) -> Result<Vec<Schedule>>;

    fn get(&self, id: ScheduleId) -> Result<Option<Schedule>>;

    /// Insert or replace. Returns true if an existing schedule was replaced.
    fn save(&self, schedule: &Schedule) -> Result<bool>;

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()>;
}

/// Process-local repository. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryScheduleRepository {
    schedules: Mutex<HashMap<ScheduleId, Schedule>>,
    executions: Mutex<Vec<ExecutionRecord>>,
}

impl InMemoryScheduleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_schedules(schedules: impl IntoIterator<Item = Schedule>) -> Self {
        let repository = Self::new();
        repository
            .schedules
            .lock()
            .extend(schedules.into_iter().map(|s| (s.id, s)));
        repository
    }

    pub fn all(&self) -> Vec<Schedule> {
        let mut all: Vec<Schedule> = self.schedules.lock().values().cloned().collect();
        all.sort_by_key(|s| s.created_at);
        all
    }

    /// Every reported execution, oldest first.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions.lock().clone()
    }

    pub fn executions_for(&self, id: ScheduleId) -> Vec<ExecutionRecord> {
        self.executions
            .lock()
            .iter()
            .filter(|r| r.schedule_id == id)
            .cloned()
            .collect()
    }
}

impl ScheduleRepository for InMemoryScheduleRepository {
    fn list_active(&self) -> Result<Vec<Schedule>> {
        let mut active: Vec<Schedule> = self
            .schedules
            .lock()
            .values()
            .filter(|s| s.status == ScheduleStatus::Active)
            .cloned()
            .collect();
        active.sort_by_key(|s| s.created_at);
        Ok(active)
    }

    fn get(&self, id: ScheduleId) -> Result<Option<Schedule>> {
        Ok(self.schedules.lock().get(&id).cloned())
    }

    fn save(&self, schedule: &Schedule) -> Result<bool> {
        Ok(self
            .schedules
            .lock()
            .insert(schedule.id, schedule.clone())
            .is_some())
    }

    fn record_execution(&self, record: &ExecutionRecord) -> Result<()> {
        if !record.is_finalized() {
            return Err(Error::Repository(format!(
                "execution {} is not finalized",
                record.id
            )));
        }
        self.executions.lock().push(record.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Schedule files
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ScheduleFile {
    #[serde(default, rename = "schedule")]
    schedules: Vec<Schedule>,
}

/// Parse `[[schedule]]` tables from TOML.
pub fn parse_schedules(raw: &str) -> Result<Vec<Schedule>> {
    let file: ScheduleFile =
        toml::from_str(raw).map_err(|e| Error::Validation(format!("invalid schedule file: {e}")))?;
    Ok(file.schedules)
}

pub fn load_schedules(path: impl AsRef<Path>) -> Result<Vec<Schedule>> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)?;
    parse_schedules(&raw)
}
