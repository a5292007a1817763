use chrono::{DateTime, Utc};
use sqlx::{prelude::FromRow, SqliteConnection};
use tokio_stream::StreamExt;

use crate::{
    error::{Error, Result},
    message::{MessageStatus, StoredMessage, StoredMetadata},
};

/// Row shape of the `messages` table.
#[derive(FromRow, Debug)]
pub struct MessageRecord {
    id: String,
    message_type: Option<String>,
    priority: Option<String>,
    content: String,
    status: String,
    retry_count: i64,
    sender: String,
    receiver: String,
    timestamp: i64,
    updated_at: i64,
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

impl TryFrom<MessageRecord> for StoredMessage {
    type Error = Error;

    fn try_from(row: MessageRecord) -> Result<Self> {
        let status = row
            .status
            .parse::<MessageStatus>()
            .map_err(|_| Error::validation(format!("unknown stored status {:?}", row.status)))?;

        Ok(StoredMessage {
            id: row.id,
            message_type: row.message_type,
            priority: row.priority,
            content: serde_json::from_str(&row.content)?,
            status,
            retry_count: row.retry_count.max(0) as u32,
            metadata: StoredMetadata {
                sender: row.sender,
                receiver: row.receiver,
            },
            timestamp: from_millis(row.timestamp),
            updated_at: from_millis(row.updated_at),
        })
    }
}

impl MessageRecord {
    pub async fn upsert(db: &mut SqliteConnection, message: &StoredMessage) -> Result<()> {
        sqlx::query(
            "
            INSERT INTO messages
                (id, message_type, priority, content, status, retry_count, sender, receiver, timestamp, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO UPDATE SET
                message_type = excluded.message_type,
                priority = excluded.priority,
                content = excluded.content,
                status = excluded.status,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at
            ",
        )
        .bind(&message.id)
        .bind(&message.message_type)
        .bind(&message.priority)
        .bind(serde_json::to_string(&message.content)?)
        .bind(message.status.as_ref())
        .bind(message.retry_count as i64)
        .bind(&message.metadata.sender)
        .bind(&message.metadata.receiver)
        .bind(message.timestamp.timestamp_millis())
        .bind(message.updated_at.timestamp_millis())
        .execute(db)
        .await?;

        Ok(())
    }

    pub async fn update_status(
        db: &mut SqliteConnection,
        id: &str,
        status: MessageStatus,
        retry_count: Option<u32>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "
            UPDATE messages
            SET status = $1, retry_count = COALESCE($2, retry_count), updated_at = $3
            WHERE id = $4
            ",
        )
        .bind(status.as_ref())
        .bind(retry_count.map(i64::from))
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(db)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_content(
        db: &mut SqliteConnection,
        id: &str,
        content: &serde_json::Value,
    ) -> Result<bool> {
        let result =
            sqlx::query("UPDATE messages SET content = $1, updated_at = $2 WHERE id = $3")
                .bind(serde_json::to_string(content)?)
                .bind(Utc::now().timestamp_millis())
                .bind(id)
                .execute(db)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn get(db: &mut SqliteConnection, id: &str) -> Result<Option<StoredMessage>> {
        let row: Option<MessageRecord> = sqlx::query_as("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?;

        row.map(StoredMessage::try_from).transpose()
    }

    /// Oldest first, so recovery re-enqueues in the order messages were sent.
    pub async fn list_by_status(
        db: &mut SqliteConnection,
        status: MessageStatus,
    ) -> Result<Vec<StoredMessage>> {
        let mut stream = sqlx::query_as::<_, MessageRecord>(
            "SELECT * FROM messages WHERE status = $1 ORDER BY timestamp ASC",
        )
        .bind(status.as_ref())
        .fetch(db);

        let mut messages = Vec::new();

        while let Some(row) = stream.next().await.transpose()? {
            messages.push(StoredMessage::try_from(row)?);
        }

        Ok(messages)
    }

    pub async fn delete_before(db: &mut SqliteConnection, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE timestamp < $1")
            .bind(cutoff.timestamp_millis())
            .execute(db)
            .await?;

        Ok(result.rows_affected())
    }
}
