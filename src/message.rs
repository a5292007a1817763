//! Message types and status management for the agent messaging pipeline.
//!
//! A [`QueuedMessage`] is the unit of work that flows through the queue. Its
//! durable projection, [`StoredMessage`], lives in the local store and follows
//! the lifecycle below.
//!
//! # Message Lifecycle
//!
//! 1. Messages are persisted in `Pending` status when they are sent
//! 2. When the backend accepts them, they move to `Sent`
//! 3. When the receiver confirms processing, they move to `Acknowledged`
//! 4. If delivery keeps failing past the retry budget, they move to `Failed`
//!
//! Stored messages of any status are garbage-collected once they are older
//! than the configured maximum age.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    utils::generate_message_id,
};

/// The kind of exchange a message represents between two agents.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Task,
    Result,
    Query,
    Response,
    StateUpdate,
}

/// Delivery priority. Ordering is `High > Medium > Low`.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Default,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Outcome of the most recent delivery attempt.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct DeliveryStatus {
    pub delivered: bool,
    pub timestamp: Option<DateTime<Utc>>,
    /// Number of delivery attempts made. Never decreases.
    pub attempts: u32,
    pub error: Option<String>,
}

impl DeliveryStatus {
    pub fn record_success(&mut self) {
        self.delivered = true;
        self.timestamp = Some(Utc::now());
        self.attempts += 1;
        self.error = None;
    }

    pub fn record_failure(&mut self, error: impl Into<String>) {
        self.delivered = false;
        self.timestamp = Some(Utc::now());
        self.attempts += 1;
        self.error = Some(error.into());
    }
}

/// A message waiting in, or moving through, the outbound queue.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub priority: Priority,
    pub content: serde_json::Value,
    pub sender: String,
    pub receiver: String,
    pub timestamp: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
    pub retry_count: u32,
    pub max_retries: u32,
}

impl QueuedMessage {
    /// Builds a fresh message with a new id and zeroed delivery state.
    pub fn new(
        sender: impl Into<String>,
        receiver: impl Into<String>,
        message_type: MessageType,
        content: serde_json::Value,
        priority: Priority,
        max_retries: u32,
    ) -> Result<Self> {
        Ok(Self {
            id: generate_message_id()?,
            message_type,
            priority,
            content,
            sender: sender.into(),
            receiver: receiver.into(),
            timestamp: Utc::now(),
            delivery_status: DeliveryStatus::default(),
            retry_count: 0,
            max_retries,
        })
    }

    /// Structural checks shared by the queue, recovery and the public API.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::validation("message id is empty"));
        }
        if self.sender.trim().is_empty() {
            return Err(Error::validation(format!("message {} has no sender", self.id)));
        }
        if self.receiver.trim().is_empty() {
            return Err(Error::validation(format!(
                "message {} has no receiver",
                self.id
            )));
        }
        if self.content.is_null() {
            return Err(Error::validation(format!("message {} has no content", self.id)));
        }
        Ok(())
    }

    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

/// Status of a message in the durable store.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageStatus {
    /// Waiting to be delivered, or waiting for another attempt
    Pending,
    /// Accepted by the backend
    Sent,
    /// Delivery failed permanently after all retry attempts
    Failed,
    /// The receiver confirmed it processed the message
    Acknowledged,
}

/// Sender and receiver, kept beside the stored message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredMetadata {
    pub sender: String,
    pub receiver: String,
}

/// Durable projection of a [`QueuedMessage`].
///
/// Type and priority are kept as plain strings so that rows written by an
/// older or newer client still load; [`StoredMessage::to_queued`] decides
/// what to do with values it cannot parse.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub id: String,
    pub message_type: Option<String>,
    pub priority: Option<String>,
    pub content: serde_json::Value,
    pub status: MessageStatus,
    pub retry_count: u32,
    pub metadata: StoredMetadata,
    pub timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn from_queued(message: &QueuedMessage, status: MessageStatus) -> Self {
        Self {
            id: message.id.clone(),
            message_type: Some(message.message_type.to_string()),
            priority: Some(message.priority.to_string()),
            content: message.content.clone(),
            status,
            retry_count: message.retry_count,
            metadata: StoredMetadata {
                sender: message.sender.clone(),
                receiver: message.receiver.clone(),
            },
            timestamp: message.timestamp,
            updated_at: Utc::now(),
        }
    }

    /// Rebuilds a queue entry with reset delivery and retry state.
    ///
    /// Missing type or priority fall back to `Task` / `Medium`; values that
    /// are present but unparseable are an error.
    pub fn to_queued(&self, max_retries: u32) -> Result<QueuedMessage> {
        let message_type = match self.message_type.as_deref() {
            None | Some("") => MessageType::Task,
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::validation(format!("unknown message type {raw:?}")))?,
        };
        let priority = match self.priority.as_deref() {
            None | Some("") => Priority::Medium,
            Some(raw) => raw
                .parse()
                .map_err(|_| Error::validation(format!("unknown priority {raw:?}")))?,
        };

        let message = QueuedMessage {
            id: self.id.clone(),
            message_type,
            priority,
            content: self.content.clone(),
            sender: self.metadata.sender.clone(),
            receiver: self.metadata.receiver.clone(),
            timestamp: self.timestamp,
            delivery_status: DeliveryStatus::default(),
            retry_count: 0,
            max_retries,
        };
        message.validate()?;
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message() -> QueuedMessage {
        QueuedMessage::new(
            "dm1",
            "rules1",
            MessageType::Task,
            json!({"x": 1}),
            Priority::High,
            3,
        )
        .unwrap()
    }

    #[test]
    fn priority_orders_high_first() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert_eq!(Priority::default(), Priority::Medium);
    }

    #[test]
    fn enums_round_trip_through_strings() {
        assert_eq!(MessageType::StateUpdate.to_string(), "STATE_UPDATE");
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!(MessageStatus::Acknowledged.as_ref(), "acknowledged");
        assert_eq!(
            serde_json::to_value(MessageType::Query).unwrap(),
            json!("QUERY")
        );
    }

    #[test]
    fn rejects_structurally_invalid_messages() {
        let mut msg = message();
        msg.sender.clear();
        assert!(matches!(msg.validate(), Err(Error::Validation { .. })));

        let mut msg = message();
        msg.content = serde_json::Value::Null;
        assert!(msg.validate().is_err());

        assert!(message().validate().is_ok());
    }

    #[test]
    fn delivery_attempts_only_increase() {
        let mut status = DeliveryStatus::default();
        status.record_failure("offline");
        status.record_success();
        assert_eq!(status.attempts, 2);
        assert!(status.delivered);
        assert!(status.error.is_none());
    }

    #[test]
    fn stored_message_defaults_missing_fields() {
        let mut stored = StoredMessage::from_queued(&message(), MessageStatus::Pending);
        stored.message_type = None;
        stored.priority = Some(String::new());
        stored.retry_count = 2;

        let queued = stored.to_queued(5).unwrap();
        assert_eq!(queued.message_type, MessageType::Task);
        assert_eq!(queued.priority, Priority::Medium);
        assert_eq!(queued.retry_count, 0);
        assert_eq!(queued.max_retries, 5);
    }

    #[test]
    fn stored_message_rejects_unknown_priority() {
        let mut stored = StoredMessage::from_queued(&message(), MessageStatus::Pending);
        stored.priority = Some("URGENT".into());
        assert!(stored.to_queued(3).is_err());
    }
}
