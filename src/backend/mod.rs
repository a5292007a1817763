//! The hosted backend, seen from the client.
//!
//! The pipeline only needs four table-style operations plus a cheap
//! reachability probe. Rows are JSON objects; filters are conjunctions of
//! field equalities.

use std::{future::Future, pin::Pin};

use serde_json::Value;

use crate::error::{Error, Result};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Table names that form the contract with the hosted service.
pub mod tables {
    pub const AGENT_COMMUNICATIONS: &str = "agent_communications";
    pub const MESSAGE_ACKNOWLEDGMENTS: &str = "message_acknowledgments";
    pub const AGENT_STATES: &str = "agent_states";
    pub const MESSAGE_SEQUENCES: &str = "message_sequences";
    pub const SYNC_STATUS: &str = "sync_status";
}

pub type Row = serde_json::Map<String, Value>;

pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Conjunction of `field == value` conditions. An empty filter matches every row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<(String, Value)>,
}

impl Filter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions
            .iter()
            .all(|(field, value)| row.get(field) == Some(value))
    }
}

pub fn to_row<T: serde::Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(row) => Ok(row),
        other => Err(Error::internal(eyre::eyre!(
            "expected an object row, got {other}"
        ))),
    }
}

pub fn from_row<T: serde::de::DeserializeOwned>(row: Row) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(row))?)
}

/// Builds a [`Row`] from `field => value` pairs.
#[macro_export]
macro_rules! row {
    ($($field:expr => $value:expr),* $(,)?) => {{
        let mut row = $crate::backend::Row::new();
        $(row.insert(($field).into(), ::serde_json::json!($value));)*
        row
    }};
}

/// Core trait for the hosted database/function service.
///
/// Every method is a suspension point: callers must not assume queue or
/// connection state is unchanged when the future resolves.
pub trait Backend: Send + Sync + 'static {
    /// Appends `row` to `table`.
    fn insert<'a>(&'a self, table: &'a str, row: Row) -> BackendFuture<'a, ()>;

    /// Merges `patch` into every row of `table` matching `filter`.
    ///
    /// # Returns
    /// The number of rows changed
    fn update<'a>(&'a self, table: &'a str, patch: Row, filter: Filter)
        -> BackendFuture<'a, u64>;

    /// Returns every row of `table` matching `filter`, in insertion order.
    fn select<'a>(&'a self, table: &'a str, filter: Filter) -> BackendFuture<'a, Vec<Row>>;

    /// Calls a server-side function.
    fn invoke<'a>(&'a self, function: &'a str, payload: Value) -> BackendFuture<'a, Value>;

    /// Cheap reachability check used by reconnection attempts.
    fn ping(&self) -> BackendFuture<'_, ()> {
        Box::pin(async move {
            self.select(tables::AGENT_STATES, Filter::all().eq("agent_id", "__ping__"))
                .await
                .map(|_| ())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_requires_every_condition() {
        let row = row! { "message_id" => "a", "status" => "pending" };

        assert!(Filter::all().matches(&row));
        assert!(Filter::all().eq("message_id", "a").matches(&row));
        assert!(!Filter::all()
            .eq("message_id", "a")
            .eq("status", "failed")
            .matches(&row));
        assert!(!Filter::all().eq("missing", "a").matches(&row));
    }
}
