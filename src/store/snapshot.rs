use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;

use crate::{error::Result, offline::OfflineState, queue::QueueMetrics};

/// The queue as it looked the last time it was persisted.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    /// Queued message ids, head first.
    pub message_ids: Vec<String>,
    pub metrics: QueueMetrics,
    pub saved_at: DateTime<Utc>,
}

pub async fn save_queue_state(db: &mut SqliteConnection, snapshot: &QueueSnapshot) -> Result<()> {
    sqlx::query(
        "
        INSERT INTO queue_state (id, message_ids, metrics, saved_at)
        VALUES (1, $1, $2, $3)
        ON CONFLICT (id) DO UPDATE SET
            message_ids = excluded.message_ids,
            metrics = excluded.metrics,
            saved_at = excluded.saved_at
        ",
    )
    .bind(serde_json::to_string(&snapshot.message_ids)?)
    .bind(serde_json::to_string(&snapshot.metrics)?)
    .bind(snapshot.saved_at.timestamp_millis())
    .execute(db)
    .await?;

    Ok(())
}

pub async fn load_queue_state(db: &mut SqliteConnection) -> Result<Option<QueueSnapshot>> {
    let row: Option<(String, String, i64)> =
        sqlx::query_as("SELECT message_ids, metrics, saved_at FROM queue_state WHERE id = 1")
            .fetch_optional(db)
            .await?;

    row.map(|(ids, metrics, saved_at)| -> Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            message_ids: serde_json::from_str(&ids)?,
            metrics: serde_json::from_str(&metrics)?,
            saved_at: DateTime::from_timestamp_millis(saved_at).unwrap_or_default(),
        })
    })
    .transpose()
}

pub async fn save_offline_state(db: &mut SqliteConnection, state: &OfflineState) -> Result<()> {
    sqlx::query(
        "
        INSERT INTO offline_state (id, state, saved_at)
        VALUES (1, $1, $2)
        ON CONFLICT (id) DO UPDATE SET
            state = excluded.state,
            saved_at = excluded.saved_at
        ",
    )
    .bind(serde_json::to_string(state)?)
    .bind(Utc::now().timestamp_millis())
    .execute(db)
    .await?;

    Ok(())
}

pub async fn load_offline_state(db: &mut SqliteConnection) -> Result<Option<OfflineState>> {
    let state: Option<String> = sqlx::query_scalar("SELECT state FROM offline_state WHERE id = 1")
        .fetch_optional(db)
        .await?;

    Ok(state.map(|s| serde_json::from_str(&s)).transpose()?)
}
