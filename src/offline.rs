//! Offline bookkeeping.
//!
//! [`OfflineStateService`] remembers whether the client believes it is
//! online, whether work is waiting to be synchronized and how many
//! reconnection probes have been made. The state is written to the local
//! store on every change and read back when the service is loaded, so a
//! restarted client knows it went down while offline.
//!
//! The service owns no timers. Reconnection progress arrives as
//! [`ConnectivityEvent`]s from the reconnection manager.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::Result,
    queue::MessageQueue,
    reconnect::ConnectivityEvent,
    recovery::{MessageRecoveryService, RecoveryReport},
    store::Store,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OfflineState {
    pub is_online: bool,
    pub last_online_timestamp: Option<DateTime<Utc>>,
    pub last_offline_timestamp: Option<DateTime<Utc>>,
    /// Messages were produced while offline and still need synchronizing.
    pub pending_sync: bool,
    pub queue_size: usize,
    pub reconnection_attempts: u32,
}

impl Default for OfflineState {
    fn default() -> Self {
        Self {
            is_online: true,
            last_online_timestamp: None,
            last_offline_timestamp: None,
            pending_sync: false,
            queue_size: 0,
            reconnection_attempts: 0,
        }
    }
}

pub struct OfflineStateService {
    store: Store,
    queue: Arc<MessageQueue>,
    recovery: Arc<MessageRecoveryService>,
    state: Mutex<OfflineState>,
}

impl OfflineStateService {
    /// Restores the last persisted state, or starts online.
    pub async fn load(
        store: Store,
        queue: Arc<MessageQueue>,
        recovery: Arc<MessageRecoveryService>,
    ) -> Result<Self> {
        let state = store.load_offline_state().await?.unwrap_or_default();
        tracing::debug!(
            is_online = state.is_online,
            pending_sync = state.pending_sync,
            "restored offline state"
        );

        Ok(Self {
            store,
            queue,
            recovery,
            state: Mutex::new(state),
        })
    }

    pub fn state(&self) -> OfflineState {
        let mut state = self.state.lock().clone();
        state.queue_size = self.queue.len();
        state
    }

    pub fn is_online(&self) -> bool {
        self.state.lock().is_online
    }

    /// Reconciles the queue with the local store and marks the client online.
    ///
    /// The queue is validated first and repaired if that fails; then every
    /// unsent persisted message is pulled back in. Recovery problems are
    /// logged and do not prevent the transition.
    pub async fn handle_online(&self) -> Result<RecoveryReport> {
        match self.queue.validate_queue().await {
            Ok(validation) if !validation.is_valid() => {
                match self.recovery.reconcile_queue().await {
                    Ok(repaired) => tracing::info!(repaired, "repaired queue"),
                    Err(e) => tracing::error!(error = %e, "queue repair failed"),
                }
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "queue validation failed"),
        }

        let report = self.recovery.recover_messages().await.unwrap_or_else(|e| {
            tracing::error!(error = %e, "recovery failed");
            RecoveryReport::default()
        });

        self.update(|state| {
            state.is_online = true;
            state.last_online_timestamp = Some(Utc::now());
            state.pending_sync = false;
            state.reconnection_attempts = 0;
        })
        .await?;

        Ok(report)
    }

    pub async fn handle_offline(&self) -> Result<()> {
        self.update(|state| {
            state.is_online = false;
            state.last_offline_timestamp = Some(Utc::now());
            state.pending_sync = true;
        })
        .await?;

        tracing::info!(queued = self.queue.len(), "offline");
        Ok(())
    }

    /// Flags that a message was produced that the backend has not seen.
    pub async fn mark_pending_sync(&self) -> Result<()> {
        if self.state.lock().pending_sync {
            return Ok(());
        }
        self.update(|state| state.pending_sync = true).await?;
        Ok(())
    }

    pub async fn record_event(&self, event: &ConnectivityEvent) -> Result<()> {
        match *event {
            ConnectivityEvent::ReconnectionAttempt { attempt }
            | ConnectivityEvent::ReconnectionFailure { attempts: attempt } => {
                self.update(|state| state.reconnection_attempts = attempt)
                    .await?;
            }
            ConnectivityEvent::BackendReachable | ConnectivityEvent::ReconnectionSuccessful => {}
        }
        Ok(())
    }

    async fn update(&self, apply: impl FnOnce(&mut OfflineState)) -> Result<OfflineState> {
        let snapshot = {
            let mut state = self.state.lock();
            apply(&mut state);
            state.queue_size = self.queue.len();
            state.clone()
        };
        self.store.save_offline_state(&snapshot).await?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::{MessageStatus, MessageType, Priority, QueuedMessage};

    async fn service(store: &Store) -> (Arc<MessageQueue>, OfflineStateService) {
        let queue = Arc::new(MessageQueue::new(store.clone(), 100, 3));
        let recovery = Arc::new(MessageRecoveryService::new(store.clone(), queue.clone()));
        let offline = OfflineStateService::load(store.clone(), queue.clone(), recovery)
            .await
            .unwrap();
        (queue, offline)
    }

    fn message() -> QueuedMessage {
        QueuedMessage::new("dm1", "rules1", MessageType::Task, json!(1), Priority::Low, 3).unwrap()
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let store = Store::connect().await.unwrap();
        let (_, offline) = service(&store).await;
        assert!(offline.is_online());

        offline.handle_offline().await.unwrap();
        offline
            .record_event(&ConnectivityEvent::ReconnectionAttempt { attempt: 4 })
            .await
            .unwrap();

        let (_, reloaded) = service(&store).await;
        let state = reloaded.state();
        assert!(!state.is_online);
        assert!(state.pending_sync);
        assert_eq!(state.reconnection_attempts, 4);
        assert!(state.last_offline_timestamp.is_some());
    }

    #[tokio::test]
    async fn coming_online_pulls_pending_messages_and_clears_counters() {
        let store = Store::connect().await.unwrap();
        let (queue, offline) = service(&store).await;
        offline.handle_offline().await.unwrap();
        offline
            .record_event(&ConnectivityEvent::ReconnectionAttempt { attempt: 2 })
            .await
            .unwrap();

        let persisted = message();
        store
            .persist_message(&persisted, MessageStatus::Pending)
            .await
            .unwrap();

        let report = offline.handle_online().await.unwrap();

        assert_eq!(report.recovered, 1);
        assert!(queue.contains(&persisted.id));
        let state = offline.state();
        assert!(state.is_online);
        assert!(!state.pending_sync);
        assert_eq!(state.reconnection_attempts, 0);
        assert_eq!(state.queue_size, 1);
    }

    #[tokio::test]
    async fn coming_online_drops_already_delivered_messages() {
        let store = Store::connect().await.unwrap();
        let (queue, offline) = service(&store).await;
        let delivered = message();
        store
            .persist_message(&delivered, MessageStatus::Sent)
            .await
            .unwrap();
        queue.enqueue(delivered.clone());

        offline.handle_online().await.unwrap();

        assert!(!queue.contains(&delivered.id));
    }
}
