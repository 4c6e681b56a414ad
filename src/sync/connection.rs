//! Connection manager: one logical link to the backend realtime channel.
//!
//! State machine:
//!
//! ```text
//! idle ──connect──▶ connecting ──ok──▶ connected ──ping fails──▶ error
//!                        │                                          │
//!                        └──fails──▶ error ──attempt < max──▶ reconnecting ──timer──▶ connecting
//!                                          └──exhausted────▶ disconnected (until foreground/connect)
//! ```
//!
//! The liveness check is `Backend::ping` under a hard timeout; a timeout and a
//! transport failure take the same path. A realtime channel whose socket
//! dies while we are `connected` is reported through [`TransportObserver`]
//! and also lands on `error`. After any successful connect that follows an
//! outage, registered [`ConnectionObserver`]s are told so they can re-open
//! channels and refetch what they missed.

use crate::backend::Backend;
use crate::config::ConnectionConfig;
use crate::error::BackendError;
use crate::sync::cache::CacheStore;
use crate::sync::scheduler::{Scheduler, TimerId};
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Not started, or shut down
    Idle,
    /// Liveness ping in flight
    Connecting,
    /// Ping succeeded; health check running
    Connected,
    /// Waiting for the backoff timer
    Reconnecting,
    /// Ping or channel failed; transient before `Reconnecting`/`Disconnected`
    Error,
    /// Retries exhausted; waits for foreground or an explicit `connect()`
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reconnect bookkeeping. `delay()` is `base_delay * 2^attempt`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Consecutive failures since the last successful connect
    pub attempt: u32,
    /// Failures tolerated before giving up
    pub max_attempts: u32,
    /// Delay unit doubled per attempt
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base_delay,
        }
    }

    pub fn delay(&self) -> Duration {
        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Notified after the connection comes back from an outage.
#[async_trait]
pub trait ConnectionObserver: Send + Sync {
    async fn on_reconnected(&self);
}

/// Told when an open realtime channel ends without being unsubscribed.
pub trait TransportObserver: Send + Sync {
    fn on_transport_lost(&self, error: &BackendError);
}

pub struct ConnectionManager {
    backend: Arc<dyn Backend>,
    cache: CacheStore,
    scheduler: Scheduler,
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    retry: Mutex<RetryPolicy>,
    /// Set after the first successful connect; later connects are reconnects.
    ever_connected: AtomicBool,
    observers: Mutex<Vec<Weak<dyn ConnectionObserver>>>,
    me: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn new(
        backend: Arc<dyn Backend>,
        cache: CacheStore,
        scheduler: Scheduler,
        config: ConnectionConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let retry = RetryPolicy::new(config.max_attempts, config.base_delay());
        Arc::new_cyclic(|me| Self {
            backend,
            cache,
            scheduler,
            config,
            state,
            retry: Mutex::new(retry),
            ever_connected: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that sees every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        *self.retry.lock()
    }

    /// Delay of the pending reconnect, if one is scheduled.
    pub fn next_retry_delay(&self) -> Option<Duration> {
        (self.state() == ConnectionState::Reconnecting).then(|| self.retry.lock().delay())
    }

    pub fn add_observer(&self, observer: Weak<dyn ConnectionObserver>) {
        self.observers.lock().push(observer);
    }

    /// Ping the backend and enter `connected` on success.
    ///
    /// No-op while already `connecting` or `connected`. Cancels a pending
    /// reconnect timer, so an explicit call short-cuts the backoff.
    pub async fn connect(self: &Arc<Self>) {
        let began = self.state.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            _ => {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if !began {
            tracing::debug!(state = %self.state(), "connect() ignored");
            return;
        }
        self.scheduler.cancel(TimerId::Reconnect);
        tracing::info!(backend = self.backend.name(), "Connecting");

        match self.check_liveness().await {
            Ok(()) => self.on_connected().await,
            Err(e) => self.on_link_failure(&e),
        }
    }

    /// A realtime channel died on its own.
    ///
    /// While `connected` this takes the same path as a failed ping, so the
    /// backoff runs and observers resynchronize once the link is back. In any
    /// other state a reconnect is already pending or was given up on.
    pub fn report_transport_loss(self: &Arc<Self>, error: &BackendError) {
        if self.state() != ConnectionState::Connected {
            tracing::debug!(state = %self.state(), %error, "Transport loss outside connected ignored");
            return;
        }
        self.on_link_failure(error);
    }

    /// App went to the background: stop probing and drop cached data.
    pub fn notify_background(&self) {
        self.scheduler.cancel(TimerId::HealthCheck);
        self.cache.clear();
        tracing::info!(state = %self.state(), "Backgrounded: health check suspended");
    }

    /// App came back to the foreground.
    ///
    /// From `disconnected` the retry budget is reset and a new connect is
    /// attempted. While `connected` the health check cancelled by
    /// [`notify_background`](Self::notify_background) is re-armed.
    pub async fn notify_foreground(self: &Arc<Self>) {
        match self.state() {
            ConnectionState::Disconnected => {
                self.retry.lock().attempt = 0;
                tracing::info!("Foregrounded while disconnected, reconnecting");
                self.connect().await;
            }
            ConnectionState::Connected => self.start_health_check(),
            _ => {}
        }
    }

    /// Cancel timers and return to `idle`.
    pub fn shutdown(&self) {
        self.scheduler.cancel(TimerId::Reconnect);
        self.scheduler.cancel(TimerId::HealthCheck);
        self.set_state(ConnectionState::Idle);
    }

    // ── Internal ────────────────────────────────────────────────

    async fn check_liveness(&self) -> Result<(), BackendError> {
        let timeout = self.config.ping_timeout();
        match tokio::time::timeout(timeout, self.backend.ping()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(from = %previous, to = %next, "Connection state changed");
        }
    }

    async fn on_connected(self: &Arc<Self>) {
        self.retry.lock().attempt = 0;
        self.set_state(ConnectionState::Connected);
        self.start_health_check();

        if !self.ever_connected.swap(true, Ordering::SeqCst) {
            tracing::info!("Connected");
            return;
        }

        let observers: Vec<Arc<dyn ConnectionObserver>> = {
            let mut observers = self.observers.lock();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        tracing::info!(observers = observers.len(), "Reconnected, resynchronizing");
        for observer in observers {
            observer.on_reconnected().await;
        }
    }

    fn on_link_failure(self: &Arc<Self>, error: &BackendError) {
        tracing::warn!(%error, "Connection failed");
        self.scheduler.cancel(TimerId::HealthCheck);
        self.set_state(ConnectionState::Error);

        let next = {
            let mut retry = self.retry.lock();
            if retry.can_retry() {
                retry.attempt += 1;
                Some((retry.attempt, retry.delay()))
            } else {
                None
            }
        };

        match next {
            Some((attempt, delay)) => {
                self.set_state(ConnectionState::Reconnecting);
                tracing::info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                self.scheduler.schedule_once(
                    TimerId::Reconnect,
                    delay,
                    Arc::clone(self).reconnect_task(),
                );
            }
            None => {
                self.set_state(ConnectionState::Disconnected);
                tracing::warn!(
                    max_attempts = self.config.max_attempts,
                    "Reconnect attempts exhausted, waiting for foreground or connect()"
                );
            }
        }
    }

    fn reconnect_task(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move { self.connect().await }.boxed()
    }

    fn health_check_task(self: Arc<Self>) -> BoxFuture<'static, ()> {
        async move {
            if self.state() != ConnectionState::Connected {
                return;
            }
            match self.check_liveness().await {
                Ok(()) => tracing::trace!("Health check ok"),
                Err(e) => self.on_link_failure(&e),
            }
        }
        .boxed()
    }

    fn start_health_check(self: &Arc<Self>) {
        let this = Arc::downgrade(self);
        self.scheduler.schedule_every(
            TimerId::HealthCheck,
            self.config.health_check_interval(),
            move || {
                let this = this.clone();
                async move {
                    if let Some(this) = this.upgrade() {
                        this.health_check_task().await;
                    }
                }
            },
        );
    }
}

impl TransportObserver for ConnectionManager {
    fn on_transport_lost(&self, error: &BackendError) {
        if let Some(this) = self.me.upgrade() {
            this.report_transport_loss(error);
        }
    }
}
