//! Control loop: tick, sleep, repeat until stopped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::Scheduler;
use super::execution::Launch;
use crate::error::{Error, Result};
use crate::event::{Event, EventKind};

/// A running loop and the notifier that stops it.
pub(super) struct LoopHandle {
    handle: JoinHandle<()>,
    shutdown: Arc<Notify>,
}

impl Scheduler {
    /// Spawn the control loop on the current tokio runtime. Returns false
    /// if it was already running.
    pub fn start(&self) -> Result<bool> {
        let runtime = Handle::try_current().map_err(|_| {
            Error::Config("scheduler must be started inside a tokio runtime".into())
        })?;

        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|l| !l.handle.is_finished()) {
            return Ok(false);
        }

        let shutdown = Arc::new(Notify::new());
        let scheduler = self.clone();
        let signal = Arc::clone(&shutdown);
        let handle = runtime.spawn(async move { scheduler.run(signal).await });
        *running = Some(LoopHandle { handle, shutdown });
        drop(running);

        info!(
            poll_interval = ?self.config.poll_interval,
            max_concurrent = self.config.max_concurrent_executions,
            "scheduler started"
        );
        self.publish(Event::new(EventKind::System {
            name: "scheduler_started".into(),
            info: serde_json::json!({
                "poll_interval_secs": self.config.poll_interval.as_secs_f64(),
                "max_concurrent_executions": self.config.max_concurrent_executions,
            }),
        }));
        Ok(true)
    }

    /// Stop the loop and wait for it up to `stop_timeout`; past that the
    /// loop task is aborted. In-flight executions are left alone and are
    /// picked up again by the next `start`; a launch cut short by the abort
    /// is reaped as failed by the next tick. Returns false if not running.
    pub async fn stop(&self) -> bool {
        let running = self.running.lock().take();
        let Some(LoopHandle {
            mut handle,
            shutdown,
        }) = running
        else {
            return false;
        };

        shutdown.notify_one();
        if tokio::time::timeout(self.config.stop_timeout, &mut handle)
            .await
            .is_err()
        {
            warn!(
                timeout = ?self.config.stop_timeout,
                "scheduler loop did not stop in time, aborting"
            );
            handle.abort();
            // Resolves once the aborted loop has been dropped.
            let _ = handle.await;
        }

        info!("scheduler stopped");
        self.publish(Event::new(EventKind::System {
            name: "scheduler_stopped".into(),
            info: serde_json::Value::Null,
        }));
        true
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|l| !l.handle.is_finished())
    }

    async fn run(&self, shutdown: Arc<Notify>) {
        debug!("scheduler loop running");
        loop {
            // A failed tick is retried after the (shorter) error backoff.
            let pause = match self.tick().await {
                Ok(()) => self.config.poll_interval,
                Err(e) => {
                    error!("scheduler tick failed: {e}");
                    self.config.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("scheduler loop exiting");
                    return;
                }
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// One pass: retry unfinished releases, poll in-flight executions, then
    /// start every due schedule that fits under the cap.
    pub async fn tick(&self) -> Result<()> {
        {
            let mut counters = self.counters.lock();
            counters.ticks += 1;
            counters.last_tick_at = Some(Utc::now());
        }

        self.retry_pending().await;
        self.poll_in_flight().await;

        let repository = Arc::clone(&self.repository);
        let schedules = self.call(move || repository.list_active()).await?;

        let now = Utc::now();
        let mut fired: HashSet<_> = std::mem::take(&mut self.state.lock().pending_fires);
        let mut deferred = HashSet::new();

        for schedule in schedules {
            let id = schedule.id;
            let was_fired = fired.remove(&id);
            if !was_fired && !schedule.should_execute_now(now) {
                continue;
            }

            match self.launch(schedule).await {
                Ok(Launch::Started(_)) | Ok(Launch::Busy) | Ok(Launch::Skipped) => {}
                Ok(Launch::AtCapacity) => {
                    debug!(schedule_id = %id, "due but at capacity");
                    if was_fired {
                        deferred.insert(id);
                    }
                }
                Err(e) => error!(schedule_id = %id, "failed to launch execution: {e}"),
            }
        }

        for dropped in fired {
            debug!(schedule_id = %dropped, "pending fire dropped, schedule no longer active");
        }
        if !deferred.is_empty() {
            self.state.lock().pending_fires.extend(deferred);
        }
        Ok(())
    }
}
