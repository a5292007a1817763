//! Priority-ordered, bounded outbound queue.
//!
//! Messages are kept in a binary heap keyed by `(priority, insertion order)`,
//! so the head is always the oldest message of the highest priority present.
//! A requeued message gets a fresh insertion number and therefore goes to the
//! tail of its priority band.

use std::{
    cmp::Ordering,
    collections::{BinaryHeap, HashSet},
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{sync::MutexGuard, time::Instant};

use crate::{
    error::{Error, Result},
    message::QueuedMessage,
    store::Store,
};

pub mod state;
pub mod validator;

pub use state::QueueStateManager;
pub use validator::{QueueValidation, QueueValidator};

/// Running delivery metrics, persisted with every queue snapshot.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct QueueMetrics {
    pub total_processed: u64,
    pub failed_deliveries: u64,
    pub avg_processing_time_ms: f64,
}

impl QueueMetrics {
    fn record(&mut self, elapsed_ms: f64, success: bool) {
        self.total_processed += 1;
        if !success {
            self.failed_deliveries += 1;
        }
        self.avg_processing_time_ms +=
            (elapsed_ms - self.avg_processing_time_ms) / self.total_processed as f64;
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    message: QueuedMessage,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Max-heap: higher priority first, then lower sequence number first.
    fn cmp(&self, other: &Self) -> Ordering {
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Processing {
    message_id: String,
    started_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    processing: Option<Processing>,
    metrics: QueueMetrics,
}

impl Inner {
    fn contains(&self, id: &str) -> bool {
        self.heap.iter().any(|entry| entry.message.id == id)
    }

    fn ordered(&self) -> Vec<QueuedMessage> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|e| e.message.clone()).collect()
    }
}

pub struct MessageQueue {
    inner: Mutex<Inner>,
    settling: tokio::sync::Mutex<()>,
    max_size: usize,
    max_retries: u32,
    validator: QueueValidator,
    state: QueueStateManager,
}

impl MessageQueue {
    pub fn new(store: Store, max_size: usize, max_retries: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settling: tokio::sync::Mutex::new(()),
            max_size,
            max_retries,
            validator: QueueValidator::new(store.clone()),
            state: QueueStateManager::new(store),
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Retry budget given to messages created for this queue.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Adds a message, reporting why it was refused.
    pub fn try_enqueue(&self, message: QueuedMessage) -> Result<()> {
        message.validate()?;

        let mut inner = self.inner.lock();
        if inner.heap.len() >= self.max_size {
            return Err(Error::QueueFull {
                capacity: self.max_size,
            });
        }
        if inner.contains(&message.id) {
            return Err(Error::validation(format!(
                "message {} is already queued",
                message.id
            )));
        }

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(Entry { seq, message });

        Ok(())
    }

    /// Returns `false` when the queue is full, the message is malformed, or
    /// its id is already queued.
    pub fn enqueue(&self, message: QueuedMessage) -> bool {
        let id = message.id.clone();
        match self.try_enqueue(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(message_id = %id, error = %e, "message not enqueued");
                false
            }
        }
    }

    /// Puts a message back at the tail of its priority band.
    pub fn requeue(&self, message: QueuedMessage) -> bool {
        self.remove(&message.id);
        self.enqueue(message)
    }

    pub fn dequeue(&self) -> Option<QueuedMessage> {
        self.inner.lock().heap.pop().map(|entry| entry.message)
    }

    pub fn peek(&self) -> Option<QueuedMessage> {
        self.inner.lock().heap.peek().map(|entry| entry.message.clone())
    }

    pub fn remove(&self, id: &str) -> Option<QueuedMessage> {
        let mut inner = self.inner.lock();
        let mut removed = None;
        inner.heap.retain(|entry| {
            if removed.is_none() && entry.message.id == id {
                removed = Some(entry.message.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued messages, head first.
    pub fn messages(&self) -> Vec<QueuedMessage> {
        self.inner.lock().ordered()
    }

    /// Queued message ids, head first.
    pub fn ids(&self) -> Vec<String> {
        self.messages().into_iter().map(|m| m.id).collect()
    }

    pub fn id_set(&self) -> HashSet<String> {
        self.inner
            .lock()
            .heap
            .iter()
            .map(|entry| entry.message.id.clone())
            .collect()
    }

    pub fn metrics(&self) -> QueueMetrics {
        self.inner.lock().metrics.clone()
    }

    pub fn processing_message(&self) -> Option<String> {
        self.inner
            .lock()
            .processing
            .as_ref()
            .map(|p| p.message_id.clone())
    }

    /// Serializes work that moves messages between the queue and the store.
    ///
    /// Held while a message is delivered and its outcome recorded, and while
    /// the queue is rebuilt from the store, so recovery never observes a
    /// message that has left the queue but is still `pending` in the store.
    pub async fn settling(&self) -> MutexGuard<'_, ()> {
        self.settling.lock().await
    }

    pub fn begin_processing(&self, message_id: &str) {
        self.inner.lock().processing = Some(Processing {
            message_id: message_id.to_owned(),
            started_at: Instant::now(),
        });
    }

    /// Records the outcome of the current processing pass and snapshots the
    /// queue to the durable store.
    pub async fn complete_processing(&self, success: bool) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let elapsed_ms = inner
                .processing
                .take()
                .map(|p| p.started_at.elapsed().as_secs_f64() * 1000.0)
                .unwrap_or_default();
            inner.metrics.record(elapsed_ms, success);
        }

        self.state.save_snapshot(self).await
    }

    /// Structural, ordering and store cross-check validation of the live queue.
    pub async fn validate_queue(&self) -> Result<QueueValidation> {
        let messages = self.messages();
        self.validator.validate(&messages).await
    }

    pub fn state(&self) -> &QueueStateManager {
        &self.state
    }
}
