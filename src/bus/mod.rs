//! In-process event bus.
//!
//! ```text
//! publish ──→ EventQueue (priority, then FIFO) ──→ dispatch thread
//!                                                     │
//!                         subscriptions for the event's type lineage,
//!                         ordered by subscription priority (stable)
//!                                                     │
//!                               ├─ sync handler: inline
//!                               └─ async handler: bounded tokio pool
//! ```
//!
//! Handler failures (errors and panics) are isolated, counted and
//! re-published as `Error` events. Failures of error-event handlers are
//! only counted, so a failing error handler cannot loop.

mod queue;
pub mod subscription;

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak, mpsc};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::config::EventBusConfig;
use crate::error::{Error, Result};
use crate::event::{Event, EventType};
use crate::telemetry::metrics;
use crate::worker::task::panic_message;

use queue::{Entry, EventQueue};
pub use subscription::{SubscriptionId, SubscriptionOptions};
use subscription::{Handler, Subscription};

/// How long the idle dispatch thread sleeps before re-checking the bus.
const IDLE_WAIT: Duration = Duration::from_secs(1);

/// Point-in-time bus statistics.
#[derive(Debug, Clone, Serialize)]
pub struct BusStatistics {
    pub events_published: u64,
    pub events_processed: u64,
    pub handlers_invoked: u64,
    pub handler_errors: u64,
    pub queue_depth: usize,
    pub active_subscriptions: usize,
    pub uptime: Duration,
    pub events_per_second: f64,
    pub is_running: bool,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    processed: AtomicU64,
    handled: AtomicU64,
    errors: AtomicU64,
}

struct Worker {
    handle: JoinHandle<()>,
    done: mpsc::Receiver<()>,
}

struct Inner {
    config: EventBusConfig,
    queue: EventQueue,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    counters: Counters,
    started: Instant,
    runtime: Option<Handle>,
    async_pool: Arc<Semaphore>,
    worker: Mutex<Option<Worker>>,
}

/// Typed publish/subscribe bus with one dedicated dispatch thread.
///
/// Cheap to clone; clones share the same queue and registry. The dispatch
/// thread exits on [`shutdown`](Self::shutdown) or once every handle has
/// been dropped.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("config", &self.inner.config)
            .field("queue_depth", &self.inner.queue.len())
            .field("subscriptions", &self.inner.subscriptions.lock().len())
            .finish()
    }
}

impl EventBus {
    /// Create the bus and start its dispatch thread.
    ///
    /// Async handlers need a tokio runtime; the current one is captured if
    /// this is called inside it.
    pub fn new(config: EventBusConfig) -> Result<Self> {
        let inner = Arc::new(Inner {
            queue: EventQueue::new(config.queue_capacity),
            subscriptions: Mutex::new(Vec::new()),
            counters: Counters::default(),
            started: Instant::now(),
            runtime: Handle::try_current().ok(),
            async_pool: Arc::new(Semaphore::new(config.async_workers.max(1))),
            worker: Mutex::new(None),
            config,
        });

        let (done_tx, done_rx) = mpsc::channel();
        let weak = Arc::downgrade(&inner);
        let handle = std::thread::Builder::new()
            .name("event-bus-dispatch".into())
            .spawn(move || dispatch_loop(weak, done_tx))?;
        *inner.worker.lock() = Some(Worker {
            handle,
            done: done_rx,
        });

        info!(
            queue_capacity = inner.config.queue_capacity,
            async_workers = inner.config.async_workers,
            "event bus started"
        );
        Ok(Self { inner })
    }

    // -- Subscriptions ------------------------------------------------------

    /// Register a sync handler for `event_type` and all of its sub-types.
    pub fn subscribe<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe_with(event_type, SubscriptionOptions::default(), handler)
    }

    pub fn subscribe_with<F>(
        &self,
        event_type: EventType,
        options: SubscriptionOptions,
        handler: F,
    ) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(Subscription::new(
            event_type,
            Handler::Sync(Arc::new(handler)),
            options,
        ))
    }

    /// Register an async handler. It runs on the tokio runtime under the
    /// async worker limit and never blocks dispatch.
    pub fn subscribe_async<F, Fut>(
        &self,
        event_type: EventType,
        handler: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.subscribe_async_with(event_type, SubscriptionOptions::default(), handler)
    }

    pub fn subscribe_async_with<F, Fut>(
        &self,
        event_type: EventType,
        options: SubscriptionOptions,
        handler: F,
    ) -> Result<SubscriptionId>
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.inner.runtime.is_none() {
            return Err(Error::Config(
                "async handlers require the bus to be created inside a tokio runtime".into(),
            ));
        }
        let wrapped: subscription::AsyncHandler =
            Arc::new(move |event: Arc<Event>| -> subscription::HandlerFuture {
                Box::pin(handler(event))
            });
        Ok(self.register(Subscription::new(
            event_type,
            Handler::Async(wrapped),
            options,
        )))
    }

    fn register(&self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id;
        debug!(
            subscription_id = %id,
            event_type = %subscription.event_type,
            mode = subscription.handler.mode(),
            "subscription registered"
        );
        self.inner
            .subscriptions
            .lock()
            .push(Arc::new(subscription));
        id
    }

    /// Remove a subscription. False if the id is unknown (or already removed).
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        before != subscriptions.len()
    }

    /// Drop every subscription. Returns how many were removed.
    pub fn clear_subscriptions(&self) -> usize {
        let removed = std::mem::take(&mut *self.inner.subscriptions.lock()).len();
        info!(removed, "subscriptions cleared");
        removed
    }

    /// How often a subscription's handler has been invoked (or started,
    /// for async handlers).
    pub fn invocation_count(&self, id: SubscriptionId) -> Option<u64> {
        self.inner
            .subscriptions
            .lock()
            .iter()
            .find(|s| s.id == id)
            .map(|s| s.invocations())
    }

    // -- Publishing ---------------------------------------------------------

    /// Enqueue an event. Never waits for handlers; fails with
    /// `Error::QueueFull` at capacity and `Error::ShutDown` after shutdown.
    pub fn publish(&self, event: Event) -> Result<bool> {
        self.inner.enqueue(Arc::new(event))?;
        Ok(true)
    }

    /// Same contract as [`publish`](Self::publish) for async callers.
    pub async fn publish_async(&self, event: Event) -> Result<bool> {
        self.publish(event)
    }

    // -- Introspection ------------------------------------------------------

    pub fn statistics(&self) -> BusStatistics {
        let counters = &self.inner.counters;
        let uptime = self.inner.started.elapsed();
        let processed = counters.processed.load(Ordering::Relaxed);
        let secs = uptime.as_secs_f64();
        BusStatistics {
            events_published: counters.published.load(Ordering::Relaxed),
            events_processed: processed,
            handlers_invoked: counters.handled.load(Ordering::Relaxed),
            handler_errors: counters.errors.load(Ordering::Relaxed),
            queue_depth: self.inner.queue.len(),
            active_subscriptions: self.inner.subscriptions.lock().len(),
            uptime,
            events_per_second: if secs > 0.0 {
                processed as f64 / secs
            } else {
                0.0
            },
            is_running: self.is_running(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.worker.lock().is_some()
    }

    // -- Shutdown -----------------------------------------------------------

    /// Stop accepting events, let the queue drain up to the sentinel, join
    /// the dispatch thread within the configured timeout and close the
    /// async pool. Returns false if the thread did not stop in time.
    pub fn shutdown(&self) -> bool {
        self.inner.queue.close();
        let Some(worker) = self.inner.worker.lock().take() else {
            return true;
        };

        let stopped = if worker.handle.thread().id() == std::thread::current().id() {
            // Called from a sync handler; the loop exits after this event.
            true
        } else {
            match worker.done.recv_timeout(self.inner.config.shutdown_timeout) {
                Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = worker.handle.join();
                    true
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    warn!(
                        timeout = ?self.inner.config.shutdown_timeout,
                        "event bus dispatch thread did not stop in time"
                    );
                    false
                }
            }
        };

        self.inner.async_pool.close();
        info!("event bus shut down");
        stopped
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn dispatch_loop(bus: Weak<Inner>, done: mpsc::Sender<()>) {
    debug!("dispatch thread started");
    while let Some(inner) = bus.upgrade() {
        match inner.queue.pop(IDLE_WAIT) {
            Some(Entry::Event(event)) => inner.dispatch(&event),
            Some(Entry::Shutdown) => break,
            None => {}
        }
    }
    debug!("dispatch thread stopped");
    let _ = done.send(());
}

impl Inner {
    fn enqueue(&self, event: Arc<Event>) -> Result<()> {
        let event_type = event.event_type();
        self.queue.push(event)?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        metrics::events_published().add(1, &[KeyValue::new("event_type", event_type.to_string())]);
        Ok(())
    }

    fn dispatch(self: &Arc<Self>, event: &Arc<Event>) {
        let lineage = event.lineage();
        let mut matched: Vec<Arc<Subscription>> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| lineage.contains(&s.event_type))
            .cloned()
            .collect();
        // Stable: equal priorities keep registration order.
        matched.sort_by(|a, b| b.priority.cmp(&a.priority));

        for subscription in matched {
            let accepted = catch_unwind(AssertUnwindSafe(|| subscription.accepts(event)));
            match accepted {
                Ok(true) => {}
                Ok(false) => continue,
                Err(payload) => {
                    warn!(
                        subscription_id = %subscription.id,
                        "event filter panicked: {}",
                        panic_message(&*payload)
                    );
                    continue;
                }
            }
            if !subscription.try_reserve() {
                continue;
            }

            match &subscription.handler {
                Handler::Sync(handler) => {
                    match catch_unwind(AssertUnwindSafe(|| handler(event.as_ref()))) {
                        Ok(Ok(())) => {
                            self.counters.handled.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(Err(e)) => self.handler_failed(event, &subscription, format!("{e:#}")),
                        Err(payload) => self.handler_failed(
                            event,
                            &subscription,
                            format!("handler panicked: {}", panic_message(&*payload)),
                        ),
                    }
                }
                Handler::Async(handler) => {
                    self.spawn_async(event, &subscription, Arc::clone(handler))
                }
            }
        }

        self.counters.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn spawn_async(
        self: &Arc<Self>,
        event: &Arc<Event>,
        subscription: &Arc<Subscription>,
        handler: subscription::AsyncHandler,
    ) {
        let Some(runtime) = &self.runtime else {
            self.handler_failed(event, subscription, "no tokio runtime for async handler".into());
            return;
        };

        let inner = Arc::clone(self);
        let event = Arc::clone(event);
        let subscription = Arc::clone(subscription);
        let pool = Arc::clone(&self.async_pool);
        runtime.spawn(async move {
            let Ok(_permit) = pool.acquire_owned().await else {
                debug!(subscription_id = %subscription.id, "async pool closed; handler skipped");
                return;
            };
            let call = Arc::clone(&event);
            let outcome = tokio::spawn(async move { handler(call).await }).await;
            match outcome {
                Ok(Ok(())) => {
                    inner.counters.handled.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => inner.handler_failed(&event, &subscription, format!("{e:#}")),
                Err(e) if e.is_panic() => inner.handler_failed(
                    &event,
                    &subscription,
                    format!("handler panicked: {}", panic_message(&*e.into_panic())),
                ),
                Err(e) => inner.handler_failed(&event, &subscription, e.to_string()),
            }
        });
    }

    fn handler_failed(&self, event: &Event, subscription: &Subscription, message: String) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        let event_type = event.event_type();
        metrics::handler_failures().add(
            1,
            &[
                KeyValue::new("event_type", event_type.to_string()),
                KeyValue::new("mode", subscription.handler.mode()),
            ],
        );
        warn!(
            event_id = %event.id,
            event_type = %event_type,
            subscription_id = %subscription.id,
            error = %message,
            "event handler failed"
        );

        if event.is_error() {
            return;
        }
        let report = Event::error("handler_execution_error", message)
            .with_source("event_bus")
            .with_correlation_id(event.id.0.to_string())
            .with_metadata("subscription_id", subscription.id.to_string())
            .with_metadata("original_event_type", event_type.to_string());
        if let Err(e) = self.enqueue(Arc::new(report)) {
            debug!("handler failure not re-published: {e}");
        }
    }
}
