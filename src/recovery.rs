//! Rebuilding the in-memory queue from the local store.
//!
//! Nothing ties an enqueue to its persist, so after a crash or a long
//! offline period the two can disagree. These routines make the queue match
//! what the store says is still owed.

use std::sync::Arc;

use crate::{
    error::{Error, Result},
    message::MessageStatus,
    queue::MessageQueue,
    store::Store,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Persisted messages put back into the queue.
    pub recovered: usize,
    /// Persisted messages that were malformed and marked failed.
    pub failed: usize,
}

pub struct MessageRecoveryService {
    store: Store,
    queue: Arc<MessageQueue>,
}

impl MessageRecoveryService {
    pub fn new(store: Store, queue: Arc<MessageQueue>) -> Self {
        Self { store, queue }
    }

    /// Enqueues every persisted `pending` message that is not already queued.
    ///
    /// Messages that no longer pass validation are marked `failed` instead.
    /// Recovery stops early, leaving the remainder `pending`, if the queue
    /// fills up.
    pub async fn recover_messages(&self) -> Result<RecoveryReport> {
        let _settling = self.queue.settling().await;
        let pending = self.store.messages_by_status(MessageStatus::Pending).await?;
        let mut report = RecoveryReport::default();

        for stored in pending {
            if self.queue.contains(&stored.id) {
                continue;
            }

            let message = match stored.to_queued(self.queue.max_retries()) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(message_id = %stored.id, error = %e, "unrecoverable message");
                    self.store
                        .update_status(&stored.id, MessageStatus::Failed, None)
                        .await?;
                    report.failed += 1;
                    continue;
                }
            };

            match self.queue.try_enqueue(message) {
                Ok(()) => report.recovered += 1,
                Err(Error::QueueFull { capacity }) => {
                    tracing::warn!(capacity, "queue full, stopping recovery");
                    break;
                }
                Err(e) => {
                    tracing::warn!(message_id = %stored.id, error = %e, "could not requeue message");
                }
            }
        }

        if report != RecoveryReport::default() {
            tracing::info!(
                recovered = report.recovered,
                failed = report.failed,
                "recovered messages from local store"
            );
        }

        Ok(report)
    }

    /// Ids remembered in the last queue snapshot that are no longer queued.
    pub async fn validate_queue_integrity(&self) -> Result<Vec<String>> {
        let missing = self.queue.state().missing_since_snapshot(&self.queue).await?;
        if !missing.is_empty() {
            tracing::warn!(?missing, "messages disappeared since the last snapshot");
        }
        Ok(missing)
    }

    /// Brings the queue back in line with the store after a failed validation.
    ///
    /// Queued messages the store already records as delivered or failed are
    /// dropped; queued messages the store has never seen are persisted as
    /// `pending`. Returns the number of messages touched.
    pub async fn reconcile_queue(&self) -> Result<usize> {
        let _settling = self.queue.settling().await;
        let mut touched = 0;

        for message in self.queue.messages() {
            if let Err(e) = message.validate() {
                tracing::warn!(message_id = %message.id, error = %e, "dropping malformed message");
                self.queue.remove(&message.id);
                touched += 1;
                continue;
            }

            match self.store.get_message(&message.id).await? {
                None => {
                    self.store
                        .persist_message(&message, MessageStatus::Pending)
                        .await?;
                    touched += 1;
                }
                Some(stored) if stored.status != MessageStatus::Pending => {
                    tracing::info!(
                        message_id = %message.id,
                        status = %stored.status,
                        "dropping settled message from queue"
                    );
                    self.queue.remove(&message.id);
                    touched += 1;
                }
                Some(_) => {}
            }
        }

        Ok(touched)
    }
}
