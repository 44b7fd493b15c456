//! Bounded priority queue feeding the dispatch thread.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::event::Event;

pub(crate) enum Entry {
    Event(Arc<Event>),
    /// Stops the dispatch thread once everything ahead of it drained.
    Shutdown,
}

struct Queued {
    entry: Entry,
    seq: u64,
}

impl Queued {
    fn rank(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest element: "greater" means dispatch
        // sooner. The sentinel goes after every event.
        let by_event = match (&self.entry, &other.entry) {
            (Entry::Event(a), Entry::Event(b)) => b.dispatch_cmp(a),
            (Entry::Event(_), Entry::Shutdown) => Ordering::Greater,
            (Entry::Shutdown, Entry::Event(_)) => Ordering::Less,
            (Entry::Shutdown, Entry::Shutdown) => Ordering::Equal,
        };
        by_event.then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank(other)
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    closed: bool,
}

pub(crate) struct EventQueue {
    capacity: usize,
    state: Mutex<State>,
    ready: Condvar,
}

impl EventQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(State::default()),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn push(&self, event: Arc<Event>) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ShutDown("event bus"));
        }
        if state.heap.len() >= self.capacity {
            return Err(Error::QueueFull(self.capacity));
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Queued {
            entry: Entry::Event(event),
            seq,
        });
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Refuse further events and enqueue the sentinel. Returns false if the
    /// queue was already closed.
    pub(crate) fn close(&self) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.heap.push(Queued {
            entry: Entry::Shutdown,
            seq,
        });
        drop(state);
        self.ready.notify_all();
        true
    }

    /// Next entry, waiting at most `wait`. `None` on an idle timeout so the
    /// caller can re-check its own state.
    pub(crate) fn pop(&self, wait: Duration) -> Option<Entry> {
        let mut state = self.state.lock();
        if state.heap.is_empty() {
            self.ready.wait_for(&mut state, wait);
        }
        state.heap.pop().map(|queued| queued.entry)
    }

    pub(crate) fn len(&self) -> usize {
        let state = self.state.lock();
        state
            .heap
            .iter()
            .filter(|queued| matches!(queued.entry, Entry::Event(_)))
            .count()
    }
}
