//! The single reconnection authority.
//!
//! When connectivity is lost the manager probes the backend on an
//! exponential backoff schedule and broadcasts what happens on a
//! [`ConnectivityEvent`] channel. The connection and offline services both
//! subscribe to that channel instead of running timers of their own.

use std::{
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, bon::Builder)]
pub struct ReconnectPolicy {
    #[builder(default = Duration::from_millis(1_000))]
    pub initial_delay: Duration,
    #[builder(default = Duration::from_millis(30_000))]
    pub max_delay: Duration,
    #[builder(default = 2.0)]
    pub factor: f64,
    #[builder(default = 10)]
    pub max_attempts: u32,
    /// Scales every delay by a random factor in `[0.5, 1.5)`.
    #[builder(default)]
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ReconnectPolicy {
    /// Delay before the attempt that follows `attempts` earlier ones.
    pub fn delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(i32::MAX as u32) as i32;
        let mut millis = self.initial_delay.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter {
            millis *= rand::thread_rng().gen_range(0.5..1.5);
        }
        let capped = millis.min(self.max_delay.as_millis() as f64);

        if capped.is_finite() && capped >= 0.0 {
            Duration::from_millis(capped as u64)
        } else {
            self.max_delay
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectivityEvent {
    /// A probe was made; `attempt` is 1-based.
    ReconnectionAttempt { attempt: u32 },
    /// A probe succeeded. Listeners should restore the connection.
    BackendReachable,
    /// The connection was restored and the queue resumed.
    ReconnectionSuccessful,
    /// The manager gave up after `attempts` probes.
    ReconnectionFailure { attempts: u32 },
}

struct Running {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

pub struct ReconnectionManager {
    backend: Arc<dyn Backend>,
    policy: ReconnectPolicy,
    events: broadcast::Sender<ConnectivityEvent>,
    attempts: AtomicU32,
    running: Mutex<Option<Running>>,
    shutdown: CancellationToken,
}

impl ReconnectionManager {
    /// `shutdown` cancels any probe loop in progress.
    pub fn new(
        backend: Arc<dyn Backend>,
        policy: ReconnectPolicy,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            backend,
            policy,
            events,
            attempts: AtomicU32::new(0),
            running: Mutex::new(None),
            shutdown,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: ConnectivityEvent) {
        tracing::debug!(?event, "connectivity event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
    }

    /// Starts probing. Does nothing if a probe loop is already active.
    pub fn start(self: &Arc<Self>) {
        let mut running = self.running.lock();
        if running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return;
        }

        self.attempts.store(0, Ordering::SeqCst);
        let token = self.shutdown.child_token();
        let handle = tokio::spawn(self.clone().probe_loop(token.clone()));
        *running = Some(Running { token, handle });

        tracing::info!("reconnection started");
    }

    /// Cancels the probe loop, if any, and clears the attempt counter.
    pub fn stop(&self) {
        if let Some(running) = self.running.lock().take() {
            running.token.cancel();
        }
        self.attempts.store(0, Ordering::SeqCst);
    }

    async fn probe_loop(self: Arc<Self>, token: CancellationToken) {
        loop {
            let made = self.attempts.load(Ordering::SeqCst);
            if made >= self.policy.max_attempts {
                tracing::error!(attempts = made, "giving up on reconnection");
                self.emit(ConnectivityEvent::ReconnectionFailure { attempts: made });
                return;
            }

            let delay = self.policy.delay(made);
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let attempt = made + 1;
            self.attempts.store(attempt, Ordering::SeqCst);
            let probe = self.backend.ping().await;
            if token.is_cancelled() {
                return;
            }

            self.emit(ConnectivityEvent::ReconnectionAttempt { attempt });
            match probe {
                Ok(()) => {
                    tracing::info!(attempt, "backend reachable");
                    self.emit(ConnectivityEvent::BackendReachable);
                    return;
                }
                Err(e) => {
                    tracing::debug!(attempt, ?delay, error = %e, "reconnection attempt failed");
                }
            }
        }
    }
}
