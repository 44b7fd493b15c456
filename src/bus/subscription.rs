//! Subscriptions: handler, ordering priority, filter and invocation cap.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

use crate::event::{Event, EventPriority, EventType};

/// Opaque handle returned by `subscribe`; the only way to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>;
pub type SyncHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;
pub type AsyncHandler = Arc<dyn Fn(Arc<Event>) -> HandlerFuture + Send + Sync>;
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

#[derive(Clone)]
pub(crate) enum Handler {
    /// Runs inline on the dispatch thread.
    Sync(SyncHandler),
    /// Spawned on the async pool; dispatch does not wait for it.
    Async(AsyncHandler),
}

impl Handler {
    pub(crate) fn mode(&self) -> &'static str {
        match self {
            Handler::Sync(_) => "sync",
            Handler::Async(_) => "async",
        }
    }
}

/// Per-subscription options.
#[derive(Clone, Default)]
pub struct SubscriptionOptions {
    pub(crate) priority: EventPriority,
    pub(crate) filter: Option<EventFilter>,
    pub(crate) max_executions: Option<u64>,
}

impl SubscriptionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handler order within one event; higher runs first.
    pub fn priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Skip events for which `filter` returns false.
    pub fn filter(mut self, filter: impl Fn(&Event) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Invoke the handler at most `max` times. The subscription stays
    /// registered once the cap is reached.
    pub fn max_executions(mut self, max: u64) -> Self {
        self.max_executions = Some(max);
        self
    }
}

pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) event_type: EventType,
    pub(crate) handler: Handler,
    pub(crate) priority: EventPriority,
    pub(crate) filter: Option<EventFilter>,
    pub(crate) max_executions: Option<u64>,
    invocations: AtomicU64,
}

impl Subscription {
    pub(crate) fn new(
        event_type: EventType,
        handler: Handler,
        options: SubscriptionOptions,
    ) -> Self {
        Self {
            id: SubscriptionId::new(),
            event_type,
            handler,
            priority: options.priority,
            filter: options.filter,
            max_executions: options.max_executions,
            invocations: AtomicU64::new(0),
        }
    }

    pub(crate) fn accepts(&self, event: &Event) -> bool {
        self.filter.as_ref().is_none_or(|filter| filter(event))
    }

    /// Reserve one invocation. False once the cap is reached.
    ///
    /// Only the dispatch thread calls this, so load-then-increment cannot
    /// race with another reservation.
    pub(crate) fn try_reserve(&self) -> bool {
        if let Some(max) = self.max_executions
            && self.invocations.load(Ordering::Acquire) >= max
        {
            return false;
        }
        self.invocations.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Acquire)
    }
}
