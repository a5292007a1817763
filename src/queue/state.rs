use chrono::Utc;

use super::MessageQueue;
use crate::{
    error::Result,
    store::{QueueSnapshot, Store},
};

/// Snapshots the in-memory queue to the durable store and reads it back.
#[derive(Clone)]
pub struct QueueStateManager {
    store: Store,
}

impl QueueStateManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn save_snapshot(&self, queue: &MessageQueue) -> Result<()> {
        let snapshot = QueueSnapshot {
            message_ids: queue.ids(),
            metrics: queue.metrics(),
            saved_at: Utc::now(),
        };
        self.store.save_queue_state(&snapshot).await?;

        tracing::trace!(queued = snapshot.message_ids.len(), "saved queue snapshot");
        Ok(())
    }

    pub async fn load_snapshot(&self) -> Result<Option<QueueSnapshot>> {
        self.store.load_queue_state().await
    }

    /// Ids present in the last snapshot that are no longer in `queue`.
    pub async fn missing_since_snapshot(&self, queue: &MessageQueue) -> Result<Vec<String>> {
        let Some(snapshot) = self.load_snapshot().await? else {
            return Ok(Vec::new());
        };

        let live = queue.id_set();
        Ok(snapshot
            .message_ids
            .into_iter()
            .filter(|id| !live.contains(id))
            .collect())
    }
}
