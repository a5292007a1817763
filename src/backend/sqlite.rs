//! SQLite-based implementation of the backend.
//!
//! Stores every table's rows as JSON documents in one SQLite table. It stands
//! in for the hosted service when running the binary locally; filtering
//! happens in process, which is fine for the row counts a single client sees.

use serde_json::Value;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tokio_stream::StreamExt;

use super::{Backend, BackendFuture, Filter, Row};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Opens (or creates) the backend database at `path`.
    pub async fn open(path: &str) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::new(pool).await
    }

    /// Wraps an existing pool, creating the row table if it doesn't exist.
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        // Not part of the local store migrations: the local store and the
        // backend stand-in are separate databases.
        sqlx::query(
            "
            CREATE TABLE IF NOT EXISTS missive_backend_rows (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                tbl TEXT NOT NULL,
                data TEXT NOT NULL
            )
            ",
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS missive_backend_rows_tbl_idx ON missive_backend_rows (tbl)",
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool })
    }

    async fn load(&self, table: &str) -> Result<Vec<(i64, Row)>> {
        let mut stream = sqlx::query_as::<_, (i64, String)>(
            "SELECT id, data FROM missive_backend_rows WHERE tbl = $1 ORDER BY id ASC",
        )
        .bind(table)
        .fetch(&self.pool);

        let mut rows = Vec::new();
        while let Some((id, data)) = stream.next().await.transpose()? {
            rows.push((id, serde_json::from_str(&data)?));
        }

        Ok(rows)
    }

    async fn apply_patch(&self, table: &str, patch: &Row, filter: &Filter) -> Result<u64> {
        let rows = self.load(table).await?;

        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        for (id, mut row) in rows.into_iter().filter(|(_, row)| filter.matches(row)) {
            for (k, v) in patch {
                row.insert(k.clone(), v.clone());
            }

            sqlx::query("UPDATE missive_backend_rows SET data = $1 WHERE id = $2")
                .bind(serde_json::to_string(&row)?)
                .bind(id)
                .execute(&mut *tx)
                .await?;

            changed += 1;
        }

        tx.commit().await?;

        Ok(changed)
    }
}

fn backend_error<'a>(
    operation: &'static str,
    target: &'a str,
) -> impl FnOnce(Error) -> Error + 'a {
    move |e| match e {
        Error::Database { source } => Error::backend(operation, target, source.to_string()),
        other => other,
    }
}

impl Backend for SqliteBackend {
    fn insert<'a>(&'a self, table: &'a str, row: Row) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query("INSERT INTO missive_backend_rows (tbl, data) VALUES ($1, $2)")
                .bind(table)
                .bind(serde_json::to_string(&row)?)
                .execute(&self.pool)
                .await
                .map_err(Error::from)
                .map_err(backend_error("insert", table))?;

            Ok(())
        })
    }

    fn update<'a>(
        &'a self,
        table: &'a str,
        patch: Row,
        filter: Filter,
    ) -> BackendFuture<'a, u64> {
        Box::pin(async move {
            self.apply_patch(table, &patch, &filter)
                .await
                .map_err(backend_error("update", table))
        })
    }

    fn select<'a>(&'a self, table: &'a str, filter: Filter) -> BackendFuture<'a, Vec<Row>> {
        Box::pin(async move {
            Ok(self
                .load(table)
                .await
                .map_err(backend_error("select", table))?
                .into_iter()
                .map(|(_, row)| row)
                .filter(|row| filter.matches(row))
                .collect())
        })
    }

    fn invoke<'a>(&'a self, function: &'a str, payload: Value) -> BackendFuture<'a, Value> {
        Box::pin(async move {
            // There is no function runtime locally; calls are recorded so
            // they can be inspected and replayed against the real service.
            let mut call = Row::new();
            call.insert("function".into(), Value::from(function));
            call.insert("payload".into(), payload);
            self.insert("function_calls", call).await?;

            Ok(Value::Null)
        })
    }

    fn ping(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map_err(Error::from)
                .map_err(backend_error("ping", "sqlite"))?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    async fn backend() -> (SqliteBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.db");
        let backend = SqliteBackend::open(&path.to_string_lossy()).await.unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backend.db").to_string_lossy().to_string();

        {
            let backend = SqliteBackend::open(&path).await.unwrap();
            backend
                .insert("agent_states", row! { "agent_id" => "dm1", "status" => "idle" })
                .await
                .unwrap();
        }

        let backend = SqliteBackend::open(&path).await.unwrap();
        let rows = backend
            .select("agent_states", Filter::all().eq("agent_id", "dm1"))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["status"], "idle");
    }

    #[tokio::test]
    async fn update_and_select_round_trip() {
        let (backend, _dir) = backend().await;
        backend
            .insert("message_acknowledgments", row! { "message_id" => "m1", "status" => "pending" })
            .await
            .unwrap();

        let changed = backend
            .update(
                "message_acknowledgments",
                row! { "status" => "processed" },
                Filter::all().eq("message_id", "m1"),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let rows = backend
            .select("message_acknowledgments", Filter::all())
            .await
            .unwrap();
        assert_eq!(rows[0]["status"], "processed");
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn database_failures_surface_as_backend_errors() {
        let (backend, _dir) = backend().await;
        backend.pool.close().await;

        let update = backend
            .update("message_acknowledgments", row! { "status" => "failed" }, Filter::all())
            .await;
        assert!(matches!(
            update,
            Err(Error::Backend { operation: "update", .. })
        ));

        let insert = backend
            .insert("message_acknowledgments", row! { "message_id" => "m1" })
            .await;
        assert!(matches!(
            insert,
            Err(Error::Backend { operation: "insert", .. })
        ));
        assert!(insert.unwrap_err().is_retryable());
    }
}
