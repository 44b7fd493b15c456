//! Schedules: trigger conditions, repeat conditions and next-execution math.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use super::{ScheduleId, ScheduleStatus};
use crate::error::{Error, Result};

/// Default per-execution timeout (one hour).
pub const DEFAULT_EXECUTION_TIMEOUT_SECS: u64 = 3600;

/// Longest accepted per-execution timeout (seven days).
pub const MAX_EXECUTION_TIMEOUT_SECS: u64 = 7 * 24 * 3600;

/// Longest accepted interval trigger (366 days).
pub const MAX_INTERVAL_SECS: u64 = 366 * 24 * 3600;

// ---------------------------------------------------------------------------
// Trigger condition
// ---------------------------------------------------------------------------

/// What makes a schedule due.
///
/// Only `Time` and `Interval` are evaluated against the clock. The other
/// variants are signalled from outside through `Scheduler::fire_now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerCondition {
    /// Fixed wall-clock time of day (UTC), optionally restricted to weekdays.
    Time {
        hour: u32,
        minute: u32,
        #[serde(default)]
        second: u32,
        /// Empty means every day.
        #[serde(default)]
        weekdays: Vec<Weekday>,
    },
    Interval {
        interval_seconds: u64,
        #[serde(default)]
        start_immediately: bool,
    },
    FileWatch {
        path: String,
    },
    Hotkey {
        combination: String,
    },
    Startup {
        #[serde(default)]
        delay_seconds: u64,
    },
    Idle {
        idle_seconds: u64,
    },
}

impl TriggerCondition {
    pub fn time(hour: u32, minute: u32, second: u32) -> Self {
        TriggerCondition::Time {
            hour,
            minute,
            second,
            weekdays: Vec::new(),
        }
    }

    pub fn interval(interval_seconds: u64, start_immediately: bool) -> Self {
        TriggerCondition::Interval {
            interval_seconds,
            start_immediately,
        }
    }

    /// True for triggers the loop never computes a time for.
    pub fn is_external(&self) -> bool {
        !matches!(
            self,
            TriggerCondition::Time { .. } | TriggerCondition::Interval { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TriggerCondition::Time { .. } => "time",
            TriggerCondition::Interval { .. } => "interval",
            TriggerCondition::FileWatch { .. } => "file_watch",
            TriggerCondition::Hotkey { .. } => "hotkey",
            TriggerCondition::Startup { .. } => "startup",
            TriggerCondition::Idle { .. } => "idle",
        }
    }

    fn validate(&self, problems: &mut Vec<String>) {
        match self {
            TriggerCondition::Time {
                hour,
                minute,
                second,
                ..
            } => {
                if *hour > 23 {
                    problems.push(format!("hour must be 0-23, got {hour}"));
                }
                if *minute > 59 {
                    problems.push(format!("minute must be 0-59, got {minute}"));
                }
                if *second > 59 {
                    problems.push(format!("second must be 0-59, got {second}"));
                }
            }
            TriggerCondition::Interval {
                interval_seconds, ..
            } => {
                if *interval_seconds == 0 {
                    problems.push("interval must be greater than zero".into());
                } else if *interval_seconds > MAX_INTERVAL_SECS {
                    problems.push(format!(
                        "interval must be at most {MAX_INTERVAL_SECS} seconds, \
                         got {interval_seconds}"
                    ));
                }
            }
            TriggerCondition::FileWatch { path } => {
                if path.trim().is_empty() {
                    problems.push("file watch path is empty".into());
                }
            }
            TriggerCondition::Hotkey { combination } => {
                if !is_valid_hotkey(combination) {
                    problems.push(format!("invalid hotkey combination: {combination:?}"));
                }
            }
            TriggerCondition::Startup { .. } => {}
            TriggerCondition::Idle { idle_seconds } => {
                if *idle_seconds == 0 {
                    problems.push("idle duration must be greater than zero".into());
                }
            }
        }
    }
}

/// `[Ctrl+][Alt+][Shift+][Win+]<A-Z|0-9|F1-F12>`, modifiers in that order.
fn is_valid_hotkey(combination: &str) -> bool {
    const MODIFIERS: [&str; 4] = ["ctrl", "alt", "shift", "win"];

    let parts: Vec<&str> = combination.split('+').map(str::trim).collect();
    let Some((key, modifiers)) = parts.split_last() else {
        return false;
    };

    let mut next_allowed = 0;
    for modifier in modifiers {
        let lower = modifier.to_ascii_lowercase();
        match MODIFIERS[next_allowed..].iter().position(|m| *m == lower) {
            Some(offset) => next_allowed += offset + 1,
            None => return false,
        }
    }

    let key = key.to_ascii_uppercase();
    match key.len() {
        1 => key.chars().all(|c| c.is_ascii_alphanumeric()),
        2 | 3 => key
            .strip_prefix('F')
            .and_then(|n| n.parse::<u8>().ok())
            .is_some_and(|n| (1..=12).contains(&n)),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Repeat condition
// ---------------------------------------------------------------------------

/// Whether a schedule re-arms after a successful run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RepeatCondition {
    /// Run once, then deactivate.
    #[default]
    None,
    /// Run `remaining` more times.
    Count { remaining: u32 },
    /// Re-arm while now < `end`.
    UntilDate { end: DateTime<Utc> },
    Infinite,
}

impl RepeatCondition {
    fn validate(&self, now: DateTime<Utc>, problems: &mut Vec<String>) {
        match self {
            RepeatCondition::Count { remaining } if *remaining == 0 => {
                problems.push("repeat count must be greater than zero".into());
            }
            RepeatCondition::UntilDate { end } if *end <= now => {
                problems.push(format!("repeat end date {end} is in the past"));
            }
            _ => {}
        }
    }

    /// Consume one successful run. Returns whether the schedule re-arms.
    fn consume_success(&mut self, now: DateTime<Utc>) -> bool {
        match self {
            RepeatCondition::None => false,
            RepeatCondition::Count { remaining } => {
                *remaining = remaining.saturating_sub(1);
                *remaining > 0
            }
            RepeatCondition::UntilDate { end } => now < *end,
            RepeatCondition::Infinite => true,
        }
    }

    /// A failed run does not consume the budget.
    fn allows_retry(&self, now: DateTime<Utc>) -> bool {
        match self {
            RepeatCondition::UntilDate { end } => now < *end,
            RepeatCondition::Count { remaining } => *remaining > 0,
            RepeatCondition::None | RepeatCondition::Infinite => true,
        }
    }
}

// ---------------------------------------------------------------------------
// Schedule
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub id: ScheduleId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Automation payload, owned by the recording store.
    pub recording_id: String,
    pub trigger: TriggerCondition,
    #[serde(default)]
    pub repeat: RepeatCondition,
    #[serde(default)]
    pub status: ScheduleStatus,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default)]
    pub execution_count: u32,
    #[serde(default)]
    pub success_count: u32,
    #[serde(default)]
    pub failure_count: u32,
    #[serde(default)]
    pub last_execution_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_execution_at: Option<DateTime<Utc>>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_execution_timeout_secs() -> u64 {
    DEFAULT_EXECUTION_TIMEOUT_SECS
}

impl Schedule {
    pub fn execution_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution_timeout_secs)
    }

    /// Reject a schedule that can never run correctly.
    pub fn validate(&self, now: DateTime<Utc>) -> Result<()> {
        let mut problems = Vec::new();
        if self.name.trim().is_empty() {
            problems.push("name is empty".to_string());
        }
        if self.recording_id.trim().is_empty() {
            problems.push("recording id is empty".to_string());
        }
        if self.execution_timeout_secs == 0 {
            problems.push("execution timeout must be greater than zero".to_string());
        } else if self.execution_timeout_secs > MAX_EXECUTION_TIMEOUT_SECS {
            problems.push(format!(
                "execution timeout must be at most {MAX_EXECUTION_TIMEOUT_SECS} seconds, got {}",
                self.execution_timeout_secs
            ));
        }
        self.trigger.validate(&mut problems);
        self.repeat.validate(now, &mut problems);

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "schedule {:?}: {}",
                self.name,
                problems.join("; ")
            )))
        }
    }

    /// Next time the clock makes this schedule due, relative to `now`.
    /// `None` for externally signalled triggers.
    pub fn compute_next_execution(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.trigger {
            TriggerCondition::Time {
                hour,
                minute,
                second,
                weekdays,
            } => next_time_of_day(now, *hour, *minute, *second, weekdays),
            TriggerCondition::Interval {
                interval_seconds,
                start_immediately,
            } => {
                let interval = Duration::try_seconds(i64::try_from(*interval_seconds).ok()?)?;
                match self.last_execution_at {
                    Some(last) => last.checked_add_signed(interval),
                    None if *start_immediately => Some(now),
                    None => now.checked_add_signed(interval),
                }
            }
            _ => None,
        }
    }

    /// ACTIVE and the clock has reached the next execution time. The
    /// engine additionally checks that nothing is in flight.
    pub fn should_execute_now(&self, now: DateTime<Utc>) -> bool {
        self.status == ScheduleStatus::Active
            && self.next_execution_at.is_some_and(|next| next <= now)
    }

    fn transition(&mut self, to: ScheduleStatus, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }

    /// INACTIVE → ACTIVE. Validates and computes the first execution time.
    ///
    /// An ACTIVE schedule with no next execution time (loaded from a file,
    /// say) is validated and armed in place. Returns whether anything changed.
    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<bool> {
        match self.status {
            ScheduleStatus::Running => return Err(Error::ScheduleRunning(self.id.to_string())),
            ScheduleStatus::Active
                if self.next_execution_at.is_some() || self.trigger.is_external() =>
            {
                return Ok(false);
            }
            ScheduleStatus::Active => {
                self.validate(now)?;
                self.updated_at = now;
            }
            ScheduleStatus::Inactive => {
                self.validate(now)?;
                self.transition(ScheduleStatus::Active, now)?;
            }
        }
        self.next_execution_at = self.compute_next_execution(now);
        Ok(true)
    }

    /// ACTIVE → INACTIVE. A running schedule must go through the engine.
    pub fn deactivate(&mut self, now: DateTime<Utc>) -> Result<()> {
        match self.status {
            ScheduleStatus::Inactive => Ok(()),
            ScheduleStatus::Running => Err(Error::ScheduleRunning(self.id.to_string())),
            ScheduleStatus::Active => {
                self.transition(ScheduleStatus::Inactive, now)?;
                self.next_execution_at = None;
                Ok(())
            }
        }
    }

    /// ACTIVE → RUNNING at the start of an execution.
    pub(crate) fn mark_running(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(ScheduleStatus::Running, now)?;
        self.last_execution_at = Some(now);
        Ok(())
    }

    /// RUNNING → ACTIVE or INACTIVE after an execution finished.
    ///
    /// Counters always move. A success consumes one unit of the repeat
    /// budget; a failure re-arms without consuming it. `keep_active = false`
    /// forces INACTIVE (deactivated while in flight).
    pub(crate) fn finish_execution(
        &mut self,
        success: bool,
        keep_active: bool,
        now: DateTime<Utc>,
    ) -> Result<ScheduleStatus> {
        self.execution_count += 1;
        let rearm = if success {
            self.success_count += 1;
            self.repeat.consume_success(now)
        } else {
            self.failure_count += 1;
            self.repeat.allows_retry(now)
        };

        let next = self.compute_next_execution(now);
        let next_in_window = match (self.repeat, next) {
            (RepeatCondition::UntilDate { end }, Some(next)) => next < end,
            _ => true,
        };

        if rearm && keep_active && next_in_window {
            self.transition(ScheduleStatus::Active, now)?;
            self.next_execution_at = next;
        } else {
            self.transition(ScheduleStatus::Inactive, now)?;
            self.next_execution_at = None;
        }
        Ok(self.status)
    }

    pub fn success_rate(&self) -> f64 {
        if self.execution_count == 0 {
            return 0.0;
        }
        f64::from(self.success_count) / f64::from(self.execution_count)
    }
}

/// First instant after `now` at hh:mm:ss UTC on an allowed weekday.
fn next_time_of_day(
    now: DateTime<Utc>,
    hour: u32,
    minute: u32,
    second: u32,
    weekdays: &[Weekday],
) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(hour, minute, second)?;
    let today = now.date_naive();
    (0..=7)
        .filter_map(|offset| today.checked_add_signed(Duration::days(offset)))
        .filter(|day| weekdays.is_empty() || weekdays.contains(&day.weekday()))
        .map(|day| day.and_time(time).and_utc())
        .find(|candidate| *candidate > now)
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for a new, inactive schedule.
pub struct NewSchedule {
    name: String,
    recording_id: String,
    trigger: TriggerCondition,
    description: String,
    repeat: RepeatCondition,
    execution_timeout_secs: u64,
}

impl NewSchedule {
    pub fn new(
        name: impl Into<String>,
        recording_id: impl Into<String>,
        trigger: TriggerCondition,
    ) -> Self {
        Self {
            name: name.into(),
            recording_id: recording_id.into(),
            trigger,
            description: String::new(),
            repeat: RepeatCondition::None,
            execution_timeout_secs: DEFAULT_EXECUTION_TIMEOUT_SECS,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn repeat(mut self, repeat: RepeatCondition) -> Self {
        self.repeat = repeat;
        self
    }

    pub fn execution_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.execution_timeout_secs = timeout.as_secs();
        self
    }

    pub fn build(self) -> Schedule {
        let now = Utc::now();
        Schedule {
            id: ScheduleId::new(),
            name: self.name,
            description: self.description,
            recording_id: self.recording_id,
            trigger: self.trigger,
            repeat: self.repeat,
            status: ScheduleStatus::Inactive,
            execution_timeout_secs: self.execution_timeout_secs,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            last_execution_at: None,
            next_execution_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
