//! Pluggable conflict resolution and consistency checking.

use std::collections::HashSet;

use serde_json::{json, Value};

use super::clock::MessageSequence;
use crate::{
    backend::{tables, Backend, BackendFuture, Filter},
    message::{MessageStatus, StoredMessage},
    store::Store,
};

/// The remote side of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteVersion {
    pub sequence: MessageSequence,
    /// Content from the backend's message log, if it has any.
    pub content: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    KeepLocal,
    /// Overwrite the stored content.
    TakeRemote(Value),
}

pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, local: &StoredMessage, remote: &RemoteVersion) -> Resolution;
}

/// Whichever side was written last wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatestTimestampWins;

impl ConflictResolver for LatestTimestampWins {
    fn resolve(&self, local: &StoredMessage, remote: &RemoteVersion) -> Resolution {
        match &remote.content {
            Some(content) if remote.sequence.timestamp > local.updated_at => {
                Resolution::TakeRemote(content.clone())
            }
            _ => Resolution::KeepLocal,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConsistencyReport {
    /// Delivered message ids the backend has no sequence for.
    pub missing: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing.is_empty()
    }
}

pub trait ConsistencyValidator: Send + Sync {
    fn validate<'a>(
        &'a self,
        store: &'a Store,
        backend: &'a dyn Backend,
    ) -> BackendFuture<'a, ConsistencyReport>;
}

async fn delivered_ids(store: &Store) -> crate::error::Result<Vec<String>> {
    let mut ids = Vec::new();
    for status in [MessageStatus::Sent, MessageStatus::Acknowledged] {
        ids.extend(
            store
                .messages_by_status(status)
                .await?
                .into_iter()
                .map(|m| m.id),
        );
    }
    Ok(ids)
}

/// Every delivered message must have a published sequence.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceCoverageValidator;

impl ConsistencyValidator for SequenceCoverageValidator {
    fn validate<'a>(
        &'a self,
        store: &'a Store,
        backend: &'a dyn Backend,
    ) -> BackendFuture<'a, ConsistencyReport> {
        Box::pin(async move {
            let published: HashSet<String> = backend
                .select(tables::MESSAGE_SEQUENCES, Filter::all())
                .await?
                .into_iter()
                .filter_map(|row| row.get("message_id")?.as_str().map(str::to_owned))
                .collect();

            let missing = delivered_ids(store)
                .await?
                .into_iter()
                .filter(|id| !published.contains(id))
                .collect();

            Ok(ConsistencyReport { missing })
        })
    }
}

/// Delegates the check to a server-side function.
///
/// The function receives `{"message_ids": [...]}` with every delivered id
/// and may answer `{"missing": [...]}`. Any other answer counts as
/// consistent.
#[derive(Debug, Clone)]
pub struct RemoteConsistencyValidator {
    function: String,
}

impl RemoteConsistencyValidator {
    pub fn new(function: impl Into<String>) -> Self {
        Self {
            function: function.into(),
        }
    }
}

impl ConsistencyValidator for RemoteConsistencyValidator {
    fn validate<'a>(
        &'a self,
        store: &'a Store,
        backend: &'a dyn Backend,
    ) -> BackendFuture<'a, ConsistencyReport> {
        Box::pin(async move {
            let ids = delivered_ids(store).await?;
            let answer = backend
                .invoke(&self.function, json!({ "message_ids": ids }))
                .await?;

            let missing = answer
                .get("missing")
                .and_then(Value::as_array)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| id.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();

            Ok(ConsistencyReport { missing })
        })
    }
}
