//! Execution span helpers.
//!
//! Provides span creation and state-transition recording for schedule
//! executions flowing through the engine.

use tracing::Span;

use crate::model::{ExecutionId, ScheduleId};

/// Start a span covering one schedule execution.
///
/// The `execution.state` field is declared empty and can be updated via
/// [`record_state_transition`].
pub fn start_execution_span(
    schedule_id: &ScheduleId,
    execution_id: &ExecutionId,
    recording_id: &str,
) -> Span {
    tracing::info_span!(
        "schedule.execute",
        "schedule.id" = %schedule_id,
        "execution.id" = %execution_id,
        "execution.recording" = recording_id,
        "execution.state" = tracing::field::Empty,
    )
}

/// Record a state transition on the given span.
pub fn record_state_transition(span: &Span, from: &str, to: &str) {
    span.record("execution.state", to);
    span.in_scope(|| {
        tracing::info!(from = from, to = to, "state_transition");
    });
}
