use std::sync::Arc;

use crate::{
    ack::{AckStatus, AcknowledgmentService},
    delivery::DeliveryService,
    error::Result,
    message::{MessageStatus, MessageType, Priority, QueuedMessage},
    queue::MessageQueue,
    store::Store,
};

/// Moves single messages through delivery and records the outcome in the
/// queue, the local store and the acknowledgment log.
#[derive(bon::Builder)]
pub struct ProcessingService {
    queue: Arc<MessageQueue>,
    store: Store,
    delivery: Arc<DeliveryService>,
    acks: Arc<AcknowledgmentService>,
}

impl ProcessingService {
    /// Builds a message with a fresh id and the queue's retry budget.
    pub fn create_message(
        &self,
        sender: &str,
        receiver: &str,
        message_type: MessageType,
        content: serde_json::Value,
        priority: Priority,
    ) -> Result<QueuedMessage> {
        QueuedMessage::new(
            sender,
            receiver,
            message_type,
            content,
            priority,
            self.queue.max_retries(),
        )
    }

    /// Delivers `message` once.
    ///
    /// On success the message leaves the queue. On failure it goes back to
    /// the tail of its priority band, or, once its retry budget is spent, is
    /// marked failed and dropped from the queue.
    pub async fn process_message(&self, message: QueuedMessage) -> Result<bool> {
        let _settling = self.queue.settling().await;
        if !self.queue.contains(&message.id) {
            tracing::debug!(message_id = %message.id, "message left the queue, skipping");
            return Ok(false);
        }

        self.queue.begin_processing(&message.id);
        let outcome = self.attempt(message).await;
        self.queue
            .complete_processing(matches!(outcome, Ok(true)))
            .await?;
        outcome
    }

    async fn attempt(&self, mut message: QueuedMessage) -> Result<bool> {
        if self.delivery.deliver_message(&mut message).await? {
            // The store moves first so a message is never absent from the
            // queue while still `pending`.
            let persisted = self
                .store
                .update_status(&message.id, MessageStatus::Sent, Some(message.retry_count))
                .await;
            self.queue.remove(&message.id);
            if !persisted? {
                tracing::warn!(message_id = %message.id, "delivered message was never persisted");
            }
            self.acks
                .update_acknowledgment(&message.id, AckStatus::Received, None)
                .await?;
            return Ok(true);
        }

        message.retry_count += 1;

        if !message.retries_exhausted() {
            self.store
                .update_status(&message.id, MessageStatus::Pending, Some(message.retry_count))
                .await?;

            let id = message.id.clone();
            let retry_count = message.retry_count;
            if !self.queue.requeue(message) {
                tracing::warn!(message_id = %id, "could not requeue, leaving it to recovery");
            }
            tracing::debug!(message_id = %id, retry_count, "message requeued");
            return Ok(false);
        }

        let persisted = self
            .store
            .update_status(&message.id, MessageStatus::Failed, Some(message.retry_count))
            .await;
        self.queue.remove(&message.id);
        persisted?;

        if let Err(e) = self.delivery.handle_failed_delivery(&message).await {
            tracing::error!(
                message_id = %message.id,
                error = %e,
                "could not record terminal delivery failure"
            );
        }

        Ok(false)
    }

    /// Records that the receiver finished processing `message_id`.
    pub async fn confirm_processed(&self, message_id: &str) -> Result<bool> {
        let acked = self
            .acks
            .update_acknowledgment(message_id, AckStatus::Processed, None)
            .await?;
        let stored = self
            .store
            .update_status(message_id, MessageStatus::Acknowledged, None)
            .await?;
        Ok(acked && stored)
    }
}
