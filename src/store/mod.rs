//! Durable local store.
//!
//! A single SQLite database holds three partitions: persisted messages
//! (indexed by status and timestamp), the current queue snapshot, and the
//! current offline-state snapshot. Schema upgrades run through the embedded
//! migrations when the store is opened.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    Acquire, SqlitePool,
};

use crate::{
    config::Config,
    error::Result,
    message::{MessageStatus, QueuedMessage, StoredMessage},
    offline::OfflineState,
};

pub mod message;
pub mod snapshot;

use message::MessageRecord;
pub use snapshot::QueueSnapshot;

#[derive(Clone)]
pub struct Store {
    db: SqlitePool,
}

impl Store {
    /// Opens an in-memory store. Contents do not survive the process.
    pub async fn connect() -> Result<Self> {
        Self::connect_with(&Config::default()).await
    }

    pub async fn connect_with(config: &Config) -> Result<Self> {
        let (opts, max_connections) = if let Some(path) = config.db_path() {
            (
                SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true),
                8,
            )
        } else {
            // Every in-memory connection is its own database.
            (SqliteConnectOptions::new().in_memory(true), 1)
        };

        let opts = opts
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::debug!(path = ?config.db_path(), "opened local store");

        Ok(Self { db: pool })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    /// Inserts or replaces the stored projection of `message`.
    pub async fn persist_message(
        &self,
        message: &QueuedMessage,
        status: MessageStatus,
    ) -> Result<()> {
        let stored = StoredMessage::from_queued(message, status);

        let mut tx = self.db.begin().await?;
        MessageRecord::upsert(tx.acquire().await?, &stored).await?;
        tx.commit().await?;

        Ok(())
    }

    /// Returns `false` when no message with `id` is stored.
    pub async fn update_status(
        &self,
        id: &str,
        status: MessageStatus,
        retry_count: Option<u32>,
    ) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        MessageRecord::update_status(&mut conn, id, status, retry_count).await
    }

    pub async fn update_content(&self, id: &str, content: &serde_json::Value) -> Result<bool> {
        let mut conn = self.db.acquire().await?;
        MessageRecord::update_content(&mut conn, id, content).await
    }

    pub async fn get_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        let mut conn = self.db.acquire().await?;
        MessageRecord::get(&mut conn, id).await
    }

    pub async fn messages_by_status(&self, status: MessageStatus) -> Result<Vec<StoredMessage>> {
        let mut conn = self.db.acquire().await?;
        MessageRecord::list_by_status(&mut conn, status).await
    }

    /// Deletes every stored message older than `max_age`, whatever its status.
    pub async fn delete_older_than(&self, max_age: TimeDelta) -> Result<u64> {
        let cutoff: DateTime<Utc> = Utc::now() - max_age;
        let mut conn = self.db.acquire().await?;
        let deleted = MessageRecord::delete_before(&mut conn, cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, "removed expired messages from local store");
        }
        Ok(deleted)
    }

    pub async fn save_queue_state(&self, snapshot: &QueueSnapshot) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        snapshot::save_queue_state(&mut conn, snapshot).await
    }

    pub async fn load_queue_state(&self) -> Result<Option<QueueSnapshot>> {
        let mut conn = self.db.acquire().await?;
        snapshot::load_queue_state(&mut conn).await
    }

    pub async fn save_offline_state(&self, state: &OfflineState) -> Result<()> {
        let mut conn = self.db.acquire().await?;
        snapshot::save_offline_state(&mut conn, state).await
    }

    pub async fn load_offline_state(&self) -> Result<Option<OfflineState>> {
        let mut conn = self.db.acquire().await?;
        snapshot::load_offline_state(&mut conn).await
    }
}
