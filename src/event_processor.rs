//! Bounded event queue with synchronous flush and a circuit breaker for rejected credentials.
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex, PoisonError,
};

use crate::{Error, Event, EventPublisher, EventSerializer, Result};

/// Queues analytics events and hands them to an [`EventPublisher`] in batches.
///
/// Enqueueing never blocks on the network. When the queue is full, new events are dropped. Once
/// the publisher reports [`Error::Unauthorized`], the processor is disabled for good: the queue is
/// cleared and every later call is a no-op.
pub struct EventProcessor {
    queue: Mutex<Vec<Event>>,
    capacity: usize,
    publisher: Arc<dyn EventPublisher + Send + Sync>,
    serializer: EventSerializer,
    disabled: AtomicBool,
    dropped: AtomicU64,
    /// Set after the first overflow warning so a full queue logs once per flush cycle.
    overflow_logged: AtomicBool,
}

impl EventProcessor {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(
        publisher: Arc<dyn EventPublisher + Send + Sync>,
        serializer: EventSerializer,
        capacity: usize,
    ) -> EventProcessor {
        EventProcessor {
            queue: Mutex::new(Vec::new()),
            capacity,
            publisher,
            serializer,
            disabled: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
            overflow_logged: AtomicBool::new(false),
        }
    }

    /// Add `event` to the queue. Returns `false` if the event was dropped, either because the
    /// queue is full or because the processor is disabled.
    pub fn enqueue(&self, event: Event) -> bool {
        if self.is_disabled() {
            return false;
        }

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        // `disable` clears the queue under this lock, so check again before pushing.
        if self.is_disabled() {
            return false;
        }
        if queue.len() >= self.capacity {
            drop(queue);
            self.dropped.fetch_add(1, Ordering::Relaxed);
            if !self.overflow_logged.swap(true, Ordering::Relaxed) {
                log::warn!(target: "flagship", capacity = self.capacity; "event queue is full, dropping events");
            }
            return false;
        }
        queue.push(event);
        true
    }

    /// Publish all queued events.
    ///
    /// Returns `Ok(true)` when there was nothing to do or the batch was accepted, and `Ok(false)`
    /// when the batch was lost to a transient failure. Lost batches are not retried.
    ///
    /// Returns `Err(Error::Unauthorized)` when the publisher rejected the SDK key. The processor
    /// is disabled before returning.
    pub fn flush(&self) -> Result<bool> {
        if self.is_disabled() {
            return Ok(true);
        }

        let batch = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *queue)
        };
        self.overflow_logged.store(false, Ordering::Relaxed);
        if batch.is_empty() {
            return Ok(true);
        }

        let payload = match self.serializer.serialize_batch(&batch) {
            Ok(payload) => payload,
            Err(err) => {
                log::warn!(target: "flagship", events = batch.len(); "failed to serialize events: {err}");
                return Ok(false);
            }
        };

        match self.publisher.publish(&payload) {
            Ok(()) => {
                log::debug!(target: "flagship", events = batch.len(); "flushed events");
                Ok(true)
            }
            Err(Error::Unauthorized) => {
                log::error!(target: "flagship", "events service rejected the SDK key, disabling events");
                self.disable();
                Err(Error::Unauthorized)
            }
            Err(err) => {
                log::warn!(target: "flagship", events = batch.len(); "failed to publish events: {err}");
                Ok(false)
            }
        }
    }

    /// Permanently stop queueing and publishing events, discarding anything queued.
    pub fn disable(&self) {
        if !self.disabled.swap(true, Ordering::AcqRel) {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            queue.clear();
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::Acquire)
    }

    pub fn queued_event_count(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_event_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
