//! Causal synchronization of outbound messages.
//!
//! Every outbound message bumps the sender's counter in this client's
//! [`VectorClock`] and publishes a [`MessageSequence`] to the backend.
//! A synchronization pass pulls every published sequence and folds it into
//! the local clock. Sequences concurrent with the local clock are conflicts:
//! a [`ConflictResolver`] decides whether the remote content replaces the
//! stored message before the clocks are merged.

use std::{cmp::Ordering, sync::Arc};

use chrono::Utc;
use parking_lot::Mutex;

use crate::{
    backend::{from_row, tables, to_row, Backend, Filter},
    error::Result,
    message::QueuedMessage,
    row,
    store::Store,
    utils::generate_token,
};

pub mod clock;
pub mod resolver;

pub use clock::{MessageSequence, VectorClock};
pub use resolver::{
    ConflictResolver, ConsistencyReport, ConsistencyValidator, LatestTimestampWins,
    RemoteConsistencyValidator, RemoteVersion, Resolution, SequenceCoverageValidator,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub merged: usize,
    pub conflicts: usize,
    pub rewritten: usize,
}

pub struct SynchronizationService {
    client_id: String,
    backend: Arc<dyn Backend>,
    store: Store,
    clock: Mutex<VectorClock>,
    resolver: Box<dyn ConflictResolver>,
    validator: Box<dyn ConsistencyValidator>,
}

impl SynchronizationService {
    pub fn new(backend: Arc<dyn Backend>, store: Store) -> Result<Self> {
        Ok(Self {
            client_id: generate_token::<8>(rand::thread_rng())?,
            backend,
            store,
            clock: Mutex::new(VectorClock::new()),
            resolver: Box::new(LatestTimestampWins),
            validator: Box::new(SequenceCoverageValidator),
        })
    }

    pub fn with_resolver(mut self, resolver: impl ConflictResolver + 'static) -> Self {
        self.resolver = Box::new(resolver);
        self
    }

    pub fn with_validator(self, validator: impl ConsistencyValidator + 'static) -> Self {
        self.with_boxed_validator(Box::new(validator))
    }

    pub fn with_boxed_validator(mut self, validator: Box<dyn ConsistencyValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn clock(&self) -> VectorClock {
        self.clock.lock().clone()
    }

    /// Publishes the causal position of `message`.
    pub async fn synchronize_message(&self, message: &QueuedMessage) -> Result<MessageSequence> {
        self.publish(&message.id, &message.sender).await
    }

    async fn publish(&self, message_id: &str, sender: &str) -> Result<MessageSequence> {
        let sequence = {
            let mut clock = self.clock.lock();
            let sequence_number = clock.increment(sender);
            MessageSequence {
                message_id: message_id.to_owned(),
                sequence_number,
                vector_clock: clock.clone(),
                timestamp: Utc::now(),
            }
        };

        self.backend
            .insert(tables::MESSAGE_SEQUENCES, to_row(&sequence)?)
            .await?;

        tracing::trace!(message_id, sequence = sequence.sequence_number, "published sequence");
        Ok(sequence)
    }

    /// Folds every published sequence into the local clock, resolving
    /// concurrent ones first.
    pub async fn synchronize(&self) -> Result<SyncReport> {
        let rows = self
            .backend
            .select(tables::MESSAGE_SEQUENCES, Filter::all())
            .await?;

        let mut report = SyncReport::default();
        for row in rows {
            let sequence: MessageSequence = match from_row(row) {
                Ok(sequence) => sequence,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed sequence");
                    continue;
                }
            };

            let ordering = self.clock.lock().compare(&sequence.vector_clock);
            match ordering {
                None => {
                    report.conflicts += 1;
                    if self.resolve_conflict(&sequence).await? {
                        report.rewritten += 1;
                    }
                }
                Some(Ordering::Less) => report.merged += 1,
                Some(_) => {}
            }

            self.clock.lock().merge(&sequence.vector_clock);
        }

        self.record_status(&report).await?;

        if report.conflicts > 0 {
            tracing::info!(
                conflicts = report.conflicts,
                rewritten = report.rewritten,
                "resolved synchronization conflicts"
            );
        }
        Ok(report)
    }

    async fn resolve_conflict(&self, sequence: &MessageSequence) -> Result<bool> {
        let Some(local) = self.store.get_message(&sequence.message_id).await? else {
            return Ok(false);
        };

        let content = self
            .backend
            .select(
                tables::AGENT_COMMUNICATIONS,
                Filter::all().eq("message_id", sequence.message_id.as_str()),
            )
            .await?
            .into_iter()
            .rev()
            .find_map(|mut row| row.remove("content"));

        let remote = RemoteVersion {
            sequence: sequence.clone(),
            content,
        };

        match self.resolver.resolve(&local, &remote) {
            Resolution::KeepLocal => Ok(false),
            Resolution::TakeRemote(content) => {
                tracing::debug!(message_id = %local.id, "remote version wins");
                self.store.update_content(&local.id, &content).await
            }
        }
    }

    async fn record_status(&self, report: &SyncReport) -> Result<()> {
        let clock = serde_json::to_value(self.clock())?;
        let patch = row! {
            "vector_clock" => clock,
            "last_sync" => Utc::now(),
            "merged" => report.merged,
            "conflicts" => report.conflicts,
        };

        let filter = Filter::all().eq("client_id", self.client_id.as_str());
        let updated = self
            .backend
            .update(tables::SYNC_STATUS, patch.clone(), filter)
            .await?;
        if updated == 0 {
            let mut row = patch;
            row.insert("client_id".into(), self.client_id.clone().into());
            self.backend.insert(tables::SYNC_STATUS, row).await?;
        }
        Ok(())
    }

    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        self.validator
            .validate(&self.store, self.backend.as_ref())
            .await
    }

    /// Publishes sequences for delivered messages the backend lacks, then
    /// runs a normal synchronization pass.
    pub async fn resync(&self, missing: &[String]) -> Result<SyncReport> {
        for id in missing {
            match self.store.get_message(id).await? {
                Some(stored) => {
                    self.publish(&stored.id, &stored.metadata.sender).await?;
                }
                None => tracing::debug!(message_id = %id, "no local copy to republish"),
            }
        }
        self.synchronize().await
    }

    /// Runs the consistency check and resynchronizes if it fails.
    ///
    /// Returns whether a resync was needed.
    pub async fn enforce_consistency(&self) -> Result<bool> {
        let report = self.check_consistency().await?;
        if report.is_consistent() {
            return Ok(false);
        }

        tracing::warn!(missing = report.missing.len(), "inconsistent with backend, resyncing");
        self.resync(&report.missing).await?;
        Ok(true)
    }
}
