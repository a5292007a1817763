use std::sync::Arc;

use chrono::Utc;

use crate::{
    ack::{AckStatus, AcknowledgmentService},
    backend::{tables, Backend},
    circuit::CircuitBreaker,
    error::Result,
    message::QueuedMessage,
    retry::{RetryConfig, RetryService},
    row,
};

pub const EXHAUSTED_REASON: &str = "Maximum retry attempts exceeded";

/// Circuit and retry context used for a single message.
pub fn delivery_context(message_id: &str) -> String {
    format!("MessageDelivery.{message_id}")
}

/// Pushes messages to the backend's message log.
#[derive(bon::Builder)]
pub struct DeliveryService {
    backend: Arc<dyn Backend>,
    acks: Arc<AcknowledgmentService>,
    #[builder(default)]
    retry: Arc<RetryService>,
    #[builder(default)]
    circuit: Arc<CircuitBreaker>,
    #[builder(default = RetryConfig::database_operation())]
    retry_config: RetryConfig,
}

impl DeliveryService {
    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    /// Attempts one delivery of `message`, updating its delivery status.
    ///
    /// Backend failures are retried, recorded against the message's circuit
    /// and reported as `Ok(false)`. An open circuit skips the backend entirely.
    pub async fn deliver_message(&self, message: &mut QueuedMessage) -> Result<bool> {
        let context = delivery_context(&message.id);

        if self.circuit.is_open(&context) {
            tracing::debug!(message_id = %message.id, "circuit open, skipping delivery");
            return Ok(false);
        }

        let record = row! {
            "message_id" => message.id,
            "sender_id" => message.sender,
            "receiver_id" => message.receiver,
            "message_type" => message.message_type,
            "priority" => message.priority,
            "content" => message.content,
            "status" => "sent",
            "timestamp" => Utc::now(),
        };

        // Each delivery gets the full retry budget; earlier failures of
        // this message only count toward its circuit.
        self.retry.reset(&context);
        let inserted = self
            .retry
            .handle_retry(
                || {
                    self.backend
                        .insert(tables::AGENT_COMMUNICATIONS, record.clone())
                },
                &context,
                &self.retry_config,
            )
            .await;

        let delivered = match inserted {
            Ok(()) => self
                .acks
                .create_acknowledgment(&message.id, &message.receiver)
                .await
                .map(|_| ()),
            Err(e) => Err(e),
        };

        match delivered {
            Ok(()) => {
                message.delivery_status.record_success();
                self.circuit.record_success(&context);
                tracing::info!(
                    message_id = %message.id,
                    receiver = %message.receiver,
                    "message delivered"
                );
                Ok(true)
            }
            Err(e) => {
                message.delivery_status.record_failure(e.to_string());
                self.circuit.record_error(&context);
                tracing::warn!(message_id = %message.id, error = %e, "delivery failed");
                Ok(false)
            }
        }
    }

    /// Records a terminal failure for a message whose retry budget is spent.
    pub async fn handle_failed_delivery(&self, message: &QueuedMessage) -> Result<()> {
        let record = row! {
            "message_id" => message.id,
            "sender_id" => message.sender,
            "receiver_id" => message.receiver,
            "message_type" => message.message_type,
            "priority" => message.priority,
            "content" => message.content,
            "status" => "failed",
            "error" => message.delivery_status.error.as_deref().unwrap_or(EXHAUSTED_REASON),
            "attempts" => message.delivery_status.attempts,
            "timestamp" => Utc::now(),
        };
        self.backend
            .insert(tables::AGENT_COMMUNICATIONS, record)
            .await?;

        let updated = self
            .acks
            .update_acknowledgment(&message.id, AckStatus::Failed, Some(EXHAUSTED_REASON))
            .await?;
        if !updated {
            // Never reached the backend, so there is no acknowledgment yet.
            let ack = self
                .acks
                .create_acknowledgment(&message.id, &message.receiver)
                .await?;
            self.acks
                .update_acknowledgment(&ack.message_id, AckStatus::Failed, Some(EXHAUSTED_REASON))
                .await?;
        }

        tracing::error!(
            message_id = %message.id,
            attempts = message.delivery_status.attempts,
            "delivery abandoned"
        );
        Ok(())
    }
}
