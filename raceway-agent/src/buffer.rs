use std::collections::VecDeque;
use std::sync::atomic::{
    AtomicBool, AtomicU64,
    Ordering::{AcqRel, Relaxed, Release},
};

use raceway_api::Event;
use tokio::sync::Notify;

use crate::sync::Mutex;

/// Bounded in-memory queue between the tracker and the shipper.
///
/// Appends never block beyond the internal mutex: when the queue is full
/// the oldest event is dropped and counted, keeping the host's critical
/// path unaffected (best-effort semantics). Crossing `batch_size` trips the
/// flush signal so the shipper drains ahead of its timer.
#[derive(Debug)]
pub(crate) struct Buffer {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    batch_size: usize,
    dropped: AtomicU64,
    flush: Flush,
}

/// Signals the shipper that the queue crossed the batch threshold.
#[derive(Debug, Default)]
pub(crate) struct Flush {
    should_flush: Notify,
    triggered: AtomicBool,
}

impl Buffer {
    pub(crate) fn new(capacity: usize, batch_size: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            capacity,
            batch_size,
            dropped: AtomicU64::new(0),
            flush: Flush::default(),
        }
    }

    pub(crate) fn append(&self, event: Event) {
        let len = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Relaxed) + 1;
                tracing::debug!(dropped, "event buffer full; dropping oldest event");
            }
            queue.push_back(event);
            queue.len()
        };
        if len >= self.batch_size {
            self.flush.trigger();
        }
    }

    /// Takes every buffered event, oldest first.
    pub(crate) fn drain(&self) -> Vec<Event> {
        let drained = std::mem::take(&mut *self.queue.lock());
        self.flush.acknowledge();
        drained.into()
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Events discarded to overflow since construction.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Relaxed)
    }

    pub(crate) fn trigger_flush(&self) {
        self.flush.trigger();
    }

    /// Resolves when a flush has been requested.
    pub(crate) async fn flush_requested(&self) {
        self.flush.should_flush.notified().await;
    }
}

impl Flush {
    /// Requests a drain. Triggers arriving while one is already pending
    /// collapse into the single outstanding wakeup.
    fn trigger(&self) {
        if self.triggered.swap(true, AcqRel) {
            return;
        }
        self.should_flush.notify_one();
    }

    /// Re-arms the trigger after a drain.
    fn acknowledge(&self) {
        self.triggered.store(false, Release);
    }
}
