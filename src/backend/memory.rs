//! In-memory implementation of the backend.
//!
//! Primarily used for tests and local development. Connectivity can be
//! switched off, and individual failures injected, to exercise the offline
//! and retry paths.

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;
use serde_json::Value;

use super::{Backend, BackendFuture, Filter, Row};
use crate::error::{Error, Result};

#[derive(Clone)]
/// Thread-safe in-memory backend.
///
/// Tables live in a concurrent hash map keyed by table name.
pub struct MemoryBackend {
    tables: Arc<papaya::HashMap<String, Arc<Mutex<Vec<Row>>>>>,
    invocations: Arc<Mutex<Vec<(String, Value)>>>,
    online: Arc<AtomicBool>,
    failures: Arc<AtomicU32>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            tables: Arc::new(papaya::HashMap::new()),
            invocations: Arc::new(Mutex::new(Vec::new())),
            online: Arc::new(AtomicBool::new(true)),
            failures: Arc::new(AtomicU32::new(0)),
        }
    }

    /// While offline every operation fails with a backend error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Makes the next `count` operations fail.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Snapshot of every row currently in `table`.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.tables
            .pin()
            .get(table)
            .map(|rows| rows.lock().clone())
            .unwrap_or_default()
    }

    pub fn invocations(&self) -> Vec<(String, Value)> {
        self.invocations.lock().clone()
    }

    fn check(&self, operation: &'static str, target: &str) -> Result<()> {
        if !self.is_online() {
            return Err(Error::backend(operation, target, "backend unreachable"));
        }

        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(Error::backend(operation, target, "injected failure"));
        }

        Ok(())
    }

    fn table(&self, table: &str) -> Arc<Mutex<Vec<Row>>> {
        self.tables
            .pin()
            .get_or_insert_with(table.to_owned(), Default::default)
            .clone()
    }
}

impl Backend for MemoryBackend {
    fn insert<'a>(&'a self, table: &'a str, row: Row) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            self.check("insert", table)?;
            self.table(table).lock().push(row);
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
            self.check("update", table)?;

            let rows = self.table(table);
            let mut rows = rows.lock();
            let mut changed = 0;
            for row in rows.iter_mut().filter(|row| filter.matches(row)) {
                for (k, v) in &patch {
                    row.insert(k.clone(), v.clone());
                }
                changed += 1;
            }

            Ok(changed)
        })
    }

    fn select<'a>(&'a self, table: &'a str, filter: Filter) -> BackendFuture<'a, Vec<Row>> {
        Box::pin(async move {
            self.check("select", table)?;

            Ok(self
                .rows(table)
                .into_iter()
                .filter(|row| filter.matches(row))
                .collect())
        })
    }

    fn invoke<'a>(&'a self, function: &'a str, payload: Value) -> BackendFuture<'a, Value> {
        Box::pin(async move {
            self.check("invoke", function)?;
            self.invocations
                .lock()
                .push((function.to_owned(), payload.clone()));
            Ok(serde_json::json!({ "function": function, "payload": payload }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row;

    #[tokio::test]
    async fn update_patches_matching_rows_only() {
        let backend = MemoryBackend::new();
        backend
            .insert("acks", row! { "message_id" => "a", "status" => "pending" })
            .await
            .unwrap();
        backend
            .insert("acks", row! { "message_id" => "b", "status" => "pending" })
            .await
            .unwrap();

        let changed = backend
            .update(
                "acks",
                row! { "status" => "received" },
                Filter::all().eq("message_id", "a"),
            )
            .await
            .unwrap();
        assert_eq!(changed, 1);

        let received = backend
            .select("acks", Filter::all().eq("status", "received"))
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0]["message_id"], "a");
    }

    #[tokio::test]
    async fn offline_backend_rejects_operations() {
        let backend = MemoryBackend::new();
        backend.set_online(false);
        assert!(backend.ping().await.is_err());

        backend.set_online(true);
        assert!(backend.ping().await.is_ok());
    }

    #[tokio::test]
    async fn injected_failures_are_consumed() {
        let backend = MemoryBackend::new();
        backend.fail_next(2);

        assert!(backend.insert("t", Row::new()).await.is_err());
        assert!(backend.insert("t", Row::new()).await.is_err());
        assert!(backend.insert("t", Row::new()).await.is_ok());
        assert_eq!(backend.rows("t").len(), 1);
    }
}
