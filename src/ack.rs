//! Delivery acknowledgments.
//!
//! Each delivered message gets a `pending` acknowledgment row with a
//! deadline. The receiver side moves it to `received`/`processed`; a timeout
//! sweep moves stale `pending` rows to `failed`. Timeouts are advisory and
//! only evaluated when [`AcknowledgmentService::handle_timeout`] is called.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    backend::{from_row, tables, to_row, Backend, Filter, Row},
    error::Result,
};

pub const DEFAULT_TIMEOUT: TimeDelta = TimeDelta::minutes(5);

#[derive(
    Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AckStatus {
    Pending,
    Received,
    Processed,
    Failed,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Acknowledgment {
    pub message_id: String,
    pub receiver_id: String,
    pub status: AckStatus,
    pub timeout_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Acknowledgment joined with its delivery record.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct AckStatusReport {
    pub message_id: String,
    pub receiver_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub status: AckStatus,
}

pub struct AcknowledgmentService {
    backend: Arc<dyn Backend>,
    timeout: TimeDelta,
}

impl AcknowledgmentService {
    pub fn new(backend: Arc<dyn Backend>, timeout: TimeDelta) -> Self {
        Self { backend, timeout }
    }

    pub async fn create_acknowledgment(
        &self,
        message_id: &str,
        receiver_id: &str,
    ) -> Result<Acknowledgment> {
        let ack = Acknowledgment {
            message_id: message_id.to_owned(),
            receiver_id: receiver_id.to_owned(),
            status: AckStatus::Pending,
            timeout_at: Utc::now() + self.timeout,
            attempts: 0,
            last_attempt: None,
            acknowledged_at: None,
            error: None,
        };

        self.backend
            .insert(tables::MESSAGE_ACKNOWLEDGMENTS, to_row(&ack)?)
            .await?;

        tracing::debug!(message_id, receiver_id, "acknowledgment created");
        Ok(ack)
    }

    pub async fn get_acknowledgment(&self, message_id: &str) -> Result<Option<Acknowledgment>> {
        let rows = self
            .backend
            .select(
                tables::MESSAGE_ACKNOWLEDGMENTS,
                Filter::all().eq("message_id", message_id),
            )
            .await?;

        rows.into_iter().next().map(from_row).transpose()
    }

    /// Returns `false` when no acknowledgment exists for `message_id`.
    pub async fn update_acknowledgment(
        &self,
        message_id: &str,
        status: AckStatus,
        error: Option<&str>,
    ) -> Result<bool> {
        let Some(current) = self.get_acknowledgment(message_id).await? else {
            tracing::warn!(message_id, %status, "no acknowledgment to update");
            return Ok(false);
        };

        let now = Utc::now();
        let mut patch = Row::new();
        patch.insert("status".into(), serde_json::to_value(status)?);
        patch.insert("attempts".into(), (current.attempts + 1).into());
        patch.insert("last_attempt".into(), serde_json::to_value(now)?);
        if status == AckStatus::Processed {
            patch.insert("acknowledged_at".into(), serde_json::to_value(now)?);
        }
        if let Some(error) = error {
            patch.insert("error".into(), error.into());
        }

        let changed = self
            .backend
            .update(
                tables::MESSAGE_ACKNOWLEDGMENTS,
                patch,
                Filter::all().eq("message_id", message_id),
            )
            .await?;

        Ok(changed > 0)
    }

    pub async fn check_acknowledgment_status(
        &self,
        message_id: &str,
    ) -> Result<Option<AckStatusReport>> {
        let Some(ack) = self.get_acknowledgment(message_id).await? else {
            return Ok(None);
        };

        let delivery = self
            .backend
            .select(
                tables::AGENT_COMMUNICATIONS,
                Filter::all().eq("message_id", message_id),
            )
            .await?;

        let timestamp = delivery
            .first()
            .and_then(|row| row.get("timestamp"))
            .and_then(|ts| serde_json::from_value(ts.clone()).ok());

        Ok(Some(AckStatusReport {
            message_id: ack.message_id,
            receiver_id: ack.receiver_id,
            timestamp,
            status: ack.status,
        }))
    }

    /// Marks a `pending` acknowledgment past its deadline as `failed`.
    ///
    /// Returns whether the acknowledgment timed out.
    pub async fn handle_timeout(&self, message_id: &str) -> Result<bool> {
        let Some(ack) = self.get_acknowledgment(message_id).await? else {
            return Ok(false);
        };

        if ack.status != AckStatus::Pending || ack.timeout_at > Utc::now() {
            return Ok(false);
        }

        tracing::warn!(message_id, timeout_at = %ack.timeout_at, "acknowledgment timed out");
        self.update_acknowledgment(
            message_id,
            AckStatus::Failed,
            Some("Acknowledgment timeout exceeded"),
        )
        .await
    }

    /// Runs [`Self::handle_timeout`] over `message_ids`, returning those that timed out.
    pub async fn sweep_timeouts<'a>(
        &self,
        message_ids: impl IntoIterator<Item = &'a str>,
    ) -> Result<Vec<String>> {
        let mut timed_out = Vec::new();
        for id in message_ids {
            if self.handle_timeout(id).await? {
                timed_out.push(id.to_owned());
            }
        }
        Ok(timed_out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MemoryBackend, row};

    fn service(timeout: TimeDelta) -> (AcknowledgmentService, MemoryBackend) {
        let backend = MemoryBackend::new();
        (
            AcknowledgmentService::new(Arc::new(backend.clone()), timeout),
            backend,
        )
    }

    #[tokio::test]
    async fn lifecycle_records_attempts_and_ack_time() {
        let (acks, _) = service(DEFAULT_TIMEOUT);
        acks.create_acknowledgment("m1", "rules1").await.unwrap();

        assert!(acks
            .update_acknowledgment("m1", AckStatus::Received, None)
            .await
            .unwrap());
        assert!(acks
            .update_acknowledgment("m1", AckStatus::Processed, None)
            .await
            .unwrap());

        let ack = acks.get_acknowledgment("m1").await.unwrap().unwrap();
        assert_eq!(ack.status, AckStatus::Processed);
        assert_eq!(ack.attempts, 2);
        assert!(ack.acknowledged_at.is_some());
    }

    #[tokio::test]
    async fn updating_missing_acknowledgment_reports_false() {
        let (acks, _) = service(DEFAULT_TIMEOUT);
        assert!(!acks
            .update_acknowledgment("nope", AckStatus::Received, None)
            .await
            .unwrap());
        assert!(acks.check_acknowledgment_status("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_report_joins_delivery_record() {
        let (acks, backend) = service(DEFAULT_TIMEOUT);
        let sent_at = Utc::now();
        backend
            .insert(
                tables::AGENT_COMMUNICATIONS,
                row! { "message_id" => "m1", "timestamp" => sent_at },
            )
            .await
            .unwrap();
        acks.create_acknowledgment("m1", "rules1").await.unwrap();

        let report = acks.check_acknowledgment_status("m1").await.unwrap().unwrap();
        assert_eq!(report.receiver_id, "rules1");
        assert_eq!(report.status, AckStatus::Pending);
        assert_eq!(report.timestamp, Some(sent_at));
    }

    #[tokio::test]
    async fn only_expired_pending_acknowledgments_time_out() {
        let (expired, _) = service(TimeDelta::zero());
        expired.create_acknowledgment("m1", "rules1").await.unwrap();
        expired.create_acknowledgment("m2", "rules1").await.unwrap();
        expired
            .update_acknowledgment("m2", AckStatus::Received, None)
            .await
            .unwrap();

        let timed_out = expired.sweep_timeouts(["m1", "m2"]).await.unwrap();
        assert_eq!(timed_out, vec!["m1".to_owned()]);

        let ack = expired.get_acknowledgment("m1").await.unwrap().unwrap();
        assert_eq!(ack.status, AckStatus::Failed);
        assert!(ack.error.is_some());

        let (fresh, _) = service(DEFAULT_TIMEOUT);
        fresh.create_acknowledgment("m3", "rules1").await.unwrap();
        assert!(!fresh.handle_timeout("m3").await.unwrap());
    }
}
