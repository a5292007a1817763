//! The messaging pipeline as the rest of the application sees it.
//!
//! [`Pipeline`] wires every service together around one queue, one local
//! store and one backend, and owns the background tasks that keep them
//! moving:
//!
//! * a processor that drains the queue while connected,
//! * periodic synchronization and consistency checks,
//! * hourly garbage collection of old stored messages,
//! * a listener for the reconnection manager's events.
//!
//! All tasks stop when [`Pipeline::shutdown`] is called.

use std::{collections::HashSet, future::Future, sync::Arc, time::Duration};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{sync::broadcast::error::RecvError, task::JoinHandle, time::MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::{
    ack::AcknowledgmentService,
    backend::Backend,
    circuit::CircuitBreaker,
    config::Config,
    connection::{AuthEvent, ConnectionStateService},
    delivery::DeliveryService,
    error::{Error, Result},
    message::{MessageStatus, MessageType, Priority},
    offline::{OfflineState, OfflineStateService},
    processing::ProcessingService,
    queue::{MessageQueue, QueueMetrics},
    reconnect::{ConnectivityEvent, ReconnectionManager},
    recovery::MessageRecoveryService,
    retry::RetryService,
    store::Store,
    sync::{ConsistencyValidator, SynchronizationService},
};

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub queue_length: usize,
    pub processing_message: Option<String>,
    pub is_online: bool,
    pub metrics: QueueMetrics,
    pub offline_state: Option<OfflineState>,
}

pub struct Pipeline {
    config: Config,
    store: Store,
    queue: Arc<MessageQueue>,
    acks: Arc<AcknowledgmentService>,
    processing: Arc<ProcessingService>,
    recovery: Arc<MessageRecoveryService>,
    offline: Arc<OfflineStateService>,
    connection: Arc<ConnectionStateService>,
    reconnect: Arc<ReconnectionManager>,
    sync: Arc<SynchronizationService>,
    processing_pass: tokio::sync::Mutex<()>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[bon::bon]
impl Pipeline {
    /// Wires up every service. Background work only begins with [`Pipeline::start`].
    ///
    /// Without an explicit `store` one is opened from `config`.
    #[builder(finish_fn = connect)]
    pub async fn new(
        #[builder(default)] config: Config,
        backend: Arc<dyn Backend>,
        store: Option<Store>,
        consistency_validator: Option<Box<dyn ConsistencyValidator>>,
    ) -> Result<Arc<Self>> {
        let store = match store {
            Some(store) => store,
            None => Store::connect_with(&config).await?,
        };
        let shutdown = CancellationToken::new();

        let queue = Arc::new(MessageQueue::new(
            store.clone(),
            config.max_queue_size,
            config.max_retries,
        ));
        let acks = Arc::new(AcknowledgmentService::new(
            backend.clone(),
            config.ack_timeout(),
        ));
        let delivery = Arc::new(
            DeliveryService::builder()
                .backend(backend.clone())
                .acks(acks.clone())
                .retry(Arc::new(RetryService::new()))
                .circuit(Arc::new(CircuitBreaker::new(
                    config.failure_threshold,
                    config.reset_timeout(),
                )))
                .retry_config(config.delivery_retry())
                .build(),
        );
        let processing = Arc::new(
            ProcessingService::builder()
                .queue(queue.clone())
                .store(store.clone())
                .delivery(delivery)
                .acks(acks.clone())
                .build(),
        );
        let recovery = Arc::new(MessageRecoveryService::new(store.clone(), queue.clone()));
        let offline = Arc::new(
            OfflineStateService::load(store.clone(), queue.clone(), recovery.clone()).await?,
        );
        let reconnect = ReconnectionManager::new(
            backend.clone(),
            config.reconnect_policy(),
            shutdown.clone(),
        );
        let connection = Arc::new(ConnectionStateService::new(
            offline.clone(),
            reconnect.clone(),
        ));

        let mut sync = SynchronizationService::new(backend, store.clone())?;
        if let Some(validator) = consistency_validator {
            sync = sync.with_boxed_validator(validator);
        }

        Ok(Arc::new(Self {
            config,
            store,
            queue,
            acks,
            processing,
            recovery,
            offline,
            connection,
            reconnect,
            sync: Arc::new(sync),
            processing_pass: tokio::sync::Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

impl Pipeline {
    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    pub fn acks(&self) -> &AcknowledgmentService {
        &self.acks
    }

    pub fn processing(&self) -> &ProcessingService {
        &self.processing
    }

    pub fn recovery(&self) -> &MessageRecoveryService {
        &self.recovery
    }

    pub fn connection(&self) -> &ConnectionStateService {
        &self.connection
    }

    pub fn reconnect(&self) -> &ReconnectionManager {
        &self.reconnect
    }

    pub fn sync(&self) -> &SynchronizationService {
        &self.sync
    }

    pub fn is_online(&self) -> bool {
        self.connection.is_connected()
    }

    /// Accepts a message for delivery.
    ///
    /// The message is persisted as `pending` and queued. While online it is
    /// published to the synchronization log and a processing pass runs
    /// immediately. Returns `false` if the queue refused the message or its
    /// delivery failed permanently; the message then stays in the local
    /// store. Malformed messages and local store failures are errors.
    pub async fn send_message(
        &self,
        sender: &str,
        receiver: &str,
        message_type: MessageType,
        content: serde_json::Value,
        priority: Option<Priority>,
    ) -> Result<bool> {
        let message = self.processing.create_message(
            sender,
            receiver,
            message_type,
            content,
            priority.unwrap_or_default(),
        )?;
        message.validate()?;

        self.store
            .persist_message(&message, MessageStatus::Pending)
            .await?;

        match self.queue.try_enqueue(message.clone()) {
            Ok(()) => {}
            Err(Error::QueueFull { capacity }) => {
                tracing::warn!(message_id = %message.id, capacity, "queue full, message left in store");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        tracing::debug!(
            message_id = %message.id,
            sender,
            receiver,
            priority = %message.priority,
            "message queued"
        );

        if !self.is_online() {
            self.offline.mark_pending_sync().await?;
            return Ok(true);
        }

        if let Err(e) = self.sync.synchronize_message(&message).await {
            tracing::warn!(message_id = %message.id, error = %e, "could not publish sequence");
            self.offline.mark_pending_sync().await?;
        }

        if let Err(e) = self.process_queue().await {
            tracing::error!(error = %e, "processing pass failed");
        }

        let failed = self
            .store
            .get_message(&message.id)
            .await?
            .is_some_and(|stored| stored.status == MessageStatus::Failed);
        Ok(!failed)
    }

    pub fn queue_status(&self) -> QueueStatus {
        QueueStatus {
            queue_length: self.queue.len(),
            processing_message: self.queue.processing_message(),
            is_online: self.is_online(),
            metrics: self.queue.metrics(),
            offline_state: Some(self.offline.state()),
        }
    }

    /// Gives every queued message one delivery attempt, head first.
    ///
    /// The queue is validated against the store first and repaired if it
    /// disagrees, so settled messages are never handed out again. Only one
    /// pass runs at a time; a call made while another pass is in progress
    /// returns immediately. Stops early if the connection drops. Returns the
    /// number of messages delivered.
    pub async fn process_queue(&self) -> Result<usize> {
        let Ok(_pass) = self.processing_pass.try_lock() else {
            return Ok(0);
        };

        if !self.queue.is_empty() && !self.queue.validate_queue().await?.is_valid() {
            let repaired = self.recovery.reconcile_queue().await?;
            tracing::info!(repaired, "repaired queue before processing");
        }

        let mut attempted = HashSet::new();
        let mut delivered = 0;

        while self.is_online() {
            let Some(head) = self.queue.peek() else {
                break;
            };
            if !attempted.insert(head.id.clone()) {
                break;
            }
            if self.processing.process_message(head).await? {
                delivered += 1;
            }
        }

        Ok(delivered)
    }

    /// Restores the connection, then synchronizes and drains the queue.
    pub async fn handle_online(&self) -> Result<()> {
        self.connection.handle_online().await?;
        self.resume().await;
        Ok(())
    }

    pub async fn handle_offline(&self) -> Result<()> {
        self.connection.handle_offline().await
    }

    pub async fn handle_auth_event(&self, event: AuthEvent) -> Result<()> {
        match event {
            AuthEvent::SignedIn => self.handle_online().await,
            AuthEvent::SignedOut => self.connection.handle_auth_event(event).await,
        }
    }

    async fn resume(&self) {
        if let Err(e) = self.sync.enforce_consistency().await {
            tracing::warn!(error = %e, "consistency check after reconnect failed");
        }
        match self.process_queue().await {
            Ok(delivered) => tracing::info!(delivered, "queue resumed"),
            Err(e) => tracing::error!(error = %e, "processing after reconnect failed"),
        }
    }

    /// Recovers persisted work and starts the background tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        match self.recovery.recover_messages().await {
            Ok(report) => tracing::info!(
                recovered = report.recovered,
                failed = report.failed,
                "startup recovery finished"
            ),
            Err(e) => tracing::error!(error = %e, "startup recovery failed"),
        }

        let this = self.clone();
        self.spawn_ticker("processor", self.config.processing_interval(), move || {
            let this = this.clone();
            async move {
                if this.is_online() {
                    if let Err(e) = this.process_queue().await {
                        tracing::error!(error = %e, "processing pass failed");
                    }
                }
            }
        });

        let this = self.clone();
        self.spawn_ticker("sync", self.config.sync_interval(), move || {
            let this = this.clone();
            async move {
                if this.is_online() {
                    if let Err(e) = this.sync.synchronize().await {
                        tracing::warn!(error = %e, "synchronization failed");
                    }
                }
            }
        });

        let this = self.clone();
        self.spawn_ticker("consistency", self.config.consistency_interval(), move || {
            let this = this.clone();
            async move {
                if this.is_online() {
                    if let Err(e) = this.sync.enforce_consistency().await {
                        tracing::warn!(error = %e, "consistency check failed");
                    }
                }
            }
        });

        let this = self.clone();
        self.spawn_ticker("cleanup", self.config.cleanup_interval(), move || {
            let this = this.clone();
            async move {
                if let Err(e) = this.store.delete_older_than(this.config.message_max_age()).await {
                    tracing::warn!(error = %e, "local store cleanup failed");
                }
            }
        });

        self.spawn_event_listener();

        if !self.is_online() {
            self.reconnect.start();
        }

        tracing::info!(queued = self.queue.len(), online = self.is_online(), "pipeline started");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.reconnect.stop();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "background task did not exit cleanly");
            }
        }
        tracing::info!("pipeline stopped");
    }

    fn spawn_ticker<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            tracing::debug!(task = name, "stopped");
        });
        self.tasks.lock().push(handle);
    }

    fn spawn_event_listener(self: &Arc<Self>) {
        let token = self.shutdown.child_token();
        let mut events = self.reconnect.subscribe();
        let this = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };

                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "missed connectivity events");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };

                let handled = match event {
                    ConnectivityEvent::BackendReachable => this.handle_online().await,
                    other => match this.connection.handle_event(&other).await {
                        Ok(()) => this.offline.record_event(&other).await,
                        Err(e) => Err(e),
                    },
                };
                if let Err(e) = handled {
                    tracing::error!(error = %e, "failed to handle connectivity event");
                }
            }
        });
        self.tasks.lock().push(handle);
    }
}
