//! Playback collaborator interface.
//!
//! The engine never simulates input itself. It asks a [`PlaybackService`]
//! to start a recording, polls the session and stops it on timeout or
//! cancellation. Calls are synchronous; the engine runs them on the task
//! manager's pool under a timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Identifier of one playback run, issued by the collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Options forwarded to the collaborator with every start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Replay speed multiplier.
    pub speed: f64,
    pub stop_on_error: bool,
    /// Extra delay inserted between actions.
    pub action_delay_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            speed: 1.0,
            stop_on_error: true,
            action_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PlaybackState {
    pub fn is_finished(self) -> bool {
        !matches!(self, PlaybackState::Running)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackProgress {
    pub actions_executed: u32,
    pub total_actions: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackStatus {
    pub state: PlaybackState,
    pub progress: PlaybackProgress,
    pub error: Option<String>,
}

/// What a stopped session reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub session_id: SessionId,
    pub state: PlaybackState,
    pub progress: PlaybackProgress,
    pub error: Option<String>,
}

pub trait PlaybackService: Send + Sync {
    fn start_playback(&self, recording_id: &str, config: &PlaybackConfig) -> Result<SessionId>;

    fn get_status(&self, session_id: &SessionId) -> Result<PlaybackStatus>;

    fn stop_playback(&self, session_id: &SessionId) -> Result<ExecutionSummary>;
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

struct DrySession {
    recording_id: String,
    started: Instant,
    duration: Duration,
    stopped: bool,
}

/// Pretends to replay: every session runs for a fixed simulated duration,
/// advancing through `total_actions` steps, then completes.
pub struct DryRunPlayback {
    duration: Duration,
    total_actions: u32,
    sessions: Mutex<HashMap<SessionId, DrySession>>,
}

impl DryRunPlayback {
    pub fn new(duration: Duration, total_actions: u32) -> Self {
        Self {
            duration,
            total_actions,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn progress(&self, session: &DrySession) -> PlaybackProgress {
        let fraction = if self.duration.is_zero() {
            1.0
        } else {
            (session.started.elapsed().as_secs_f64() / self.duration.as_secs_f64()).min(1.0)
        };
        PlaybackProgress {
            actions_executed: (f64::from(self.total_actions) * fraction).floor() as u32,
            total_actions: self.total_actions,
        }
    }
}

impl Default for DryRunPlayback {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), 10)
    }
}

impl PlaybackService for DryRunPlayback {
    fn start_playback(&self, recording_id: &str, config: &PlaybackConfig) -> Result<SessionId> {
        let session_id = SessionId::generate();
        let speed = if config.speed > 0.0 { config.speed } else { 1.0 };
        let duration = self.duration.div_f64(speed);
        info!(
            session_id = %session_id,
            recording_id,
            simulated_ms = duration.as_millis() as u64,
            "dry-run playback started"
        );
        self.sessions.lock().insert(
            session_id.clone(),
            DrySession {
                recording_id: recording_id.to_string(),
                started: Instant::now(),
                duration,
                stopped: false,
            },
        );
        Ok(session_id)
    }

    fn get_status(&self, session_id: &SessionId) -> Result<PlaybackStatus> {
        let sessions = self.sessions.lock();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| Error::Playback(format!("unknown session {session_id}")))?;
        let state = if session.stopped {
            PlaybackState::Cancelled
        } else if session.started.elapsed() >= session.duration {
            PlaybackState::Completed
        } else {
            PlaybackState::Running
        };
        Ok(PlaybackStatus {
            state,
            progress: self.progress(session),
            error: None,
        })
    }

    fn stop_playback(&self, session_id: &SessionId) -> Result<ExecutionSummary> {
        let mut sessions = self.sessions.lock();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::Playback(format!("unknown session {session_id}")))?;
        session.stopped = true;
        info!(
            session_id = %session_id,
            recording_id = %session.recording_id,
            "dry-run playback stopped"
        );
        let progress = self.progress(session);
        Ok(ExecutionSummary {
            session_id: session_id.clone(),
            state: PlaybackState::Cancelled,
            progress,
            error: None,
        })
    }
}
