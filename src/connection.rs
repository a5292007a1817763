use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    error::Result,
    offline::OfflineStateService,
    reconnect::{ConnectivityEvent, ReconnectionManager},
};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub last_connected: Option<DateTime<Utc>>,
    pub last_disconnected: Option<DateTime<Utc>>,
    pub reconnecting: bool,
}

/// Authentication session changes, treated as connectivity triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn,
    SignedOut,
}

/// Tracks whether the backend is reachable and drives the transitions
/// between connected and disconnected.
pub struct ConnectionStateService {
    state: Mutex<ConnectionState>,
    offline: Arc<OfflineStateService>,
    reconnect: Arc<ReconnectionManager>,
}

impl ConnectionStateService {
    /// Starts in whichever state the offline service last persisted.
    pub fn new(offline: Arc<OfflineStateService>, reconnect: Arc<ReconnectionManager>) -> Self {
        let restored = offline.state();
        let status = if restored.is_online {
            ConnectionStatus::Connected
        } else {
            ConnectionStatus::Disconnected
        };

        Self {
            state: Mutex::new(ConnectionState {
                status,
                last_connected: restored.last_online_timestamp,
                last_disconnected: restored.last_offline_timestamp,
                reconnecting: false,
            }),
            offline,
            reconnect,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().status == ConnectionStatus::Connected
    }

    /// Restores the connection: stops probing, reconciles the queue with
    /// the local store and announces [`ConnectivityEvent::ReconnectionSuccessful`].
    pub async fn handle_online(&self) -> Result<()> {
        self.reconnect.stop();

        let report = self.offline.handle_online().await?;

        {
            let mut state = self.state.lock();
            state.status = ConnectionStatus::Connected;
            state.last_connected = Some(Utc::now());
            state.reconnecting = false;
        }

        tracing::info!(recovered = report.recovered, "connection restored");
        self.reconnect.emit(ConnectivityEvent::ReconnectionSuccessful);
        Ok(())
    }

    /// Marks the connection lost and starts the reconnection manager.
    pub async fn handle_offline(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Disconnected && state.reconnecting {
                return Ok(());
            }
            state.status = ConnectionStatus::Disconnected;
            state.last_disconnected = Some(Utc::now());
            state.reconnecting = true;
        }

        tracing::warn!("connection lost");
        self.offline.handle_offline().await?;
        self.reconnect.start();
        Ok(())
    }

    pub async fn handle_auth_event(&self, event: AuthEvent) -> Result<()> {
        tracing::debug!(?event, "auth state changed");
        match event {
            AuthEvent::SignedIn => self.handle_online().await,
            AuthEvent::SignedOut => self.handle_offline().await,
        }
    }

    /// Reacts to the reconnection manager's broadcasts.
    pub async fn handle_event(&self, event: &ConnectivityEvent) -> Result<()> {
        match event {
            ConnectivityEvent::BackendReachable => self.handle_online().await?,
            ConnectivityEvent::ReconnectionAttempt { .. } => {
                self.state.lock().reconnecting = true;
            }
            ConnectivityEvent::ReconnectionFailure { attempts } => {
                tracing::error!(attempts, "reconnection abandoned; waiting for an online signal");
                self.state.lock().reconnecting = false;
            }
            ConnectivityEvent::ReconnectionSuccessful => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{
        backend::MemoryBackend, queue::MessageQueue, reconnect::ReconnectPolicy,
        recovery::MessageRecoveryService, store::Store,
    };

    async fn service(backend: &MemoryBackend) -> (ConnectionStateService, Arc<ReconnectionManager>) {
        let store = Store::connect().await.unwrap();
        let queue = Arc::new(MessageQueue::new(store.clone(), 100, 3));
        let recovery = Arc::new(MessageRecoveryService::new(store.clone(), queue.clone()));
        let offline = Arc::new(
            OfflineStateService::load(store, queue, recovery)
                .await
                .unwrap(),
        );
        let reconnect = ReconnectionManager::new(
            Arc::new(backend.clone()),
            ReconnectPolicy::builder()
                .initial_delay(std::time::Duration::from_secs(3_600))
                .build(),
            CancellationToken::new(),
        );
        (
            ConnectionStateService::new(offline, reconnect.clone()),
            reconnect,
        )
    }

    #[tokio::test]
    async fn going_offline_starts_reconnection_once() {
        let backend = MemoryBackend::new();
        let (connection, reconnect) = service(&backend).await;
        assert!(connection.is_connected());

        connection.handle_offline().await.unwrap();
        connection.handle_offline().await.unwrap();

        let state = connection.state();
        assert_eq!(state.status, ConnectionStatus::Disconnected);
        assert!(state.reconnecting);
        assert!(state.last_disconnected.is_some());
        assert!(reconnect.is_running());
    }

    #[tokio::test]
    async fn coming_online_stops_reconnection_and_announces_it() {
        let backend = MemoryBackend::new();
        let (connection, reconnect) = service(&backend).await;
        let mut events = reconnect.subscribe();

        connection.handle_offline().await.unwrap();
        connection
            .handle_event(&ConnectivityEvent::BackendReachable)
            .await
            .unwrap();

        assert!(connection.is_connected());
        assert!(!connection.state().reconnecting);
        assert!(!reconnect.is_running());
        assert_eq!(
            events.recv().await.unwrap(),
            ConnectivityEvent::ReconnectionSuccessful
        );
    }

    #[tokio::test]
    async fn auth_events_drive_connectivity() {
        let backend = MemoryBackend::new();
        let (connection, _) = service(&backend).await;

        connection.handle_auth_event(AuthEvent::SignedOut).await.unwrap();
        assert!(!connection.is_connected());

        connection.handle_auth_event(AuthEvent::SignedIn).await.unwrap();
        assert!(connection.is_connected());
    }
}
