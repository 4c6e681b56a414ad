//! Memory/lifecycle governor.
//!
//! Runs the periodic stale-entry sweep and turns OS lifecycle notifications
//! into cache clears and connection hooks. Platform glue forwards those
//! notifications as [`LifecycleSignal`]s, either by calling the `on_*`
//! methods directly or through [`LifecycleGovernor::spawn_signal_listener`].

use crate::config::GovernorConfig;
use crate::sync::cache::CacheStore;
use crate::sync::connection::ConnectionManager;
use crate::sync::scheduler::{Scheduler, TimerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    Background,
    Foreground,
    MemoryPressure,
}

pub struct LifecycleGovernor {
    cache: CacheStore,
    connection: Arc<ConnectionManager>,
    scheduler: Scheduler,
    config: GovernorConfig,
}

impl LifecycleGovernor {
    pub fn new(
        cache: CacheStore,
        connection: Arc<ConnectionManager>,
        scheduler: Scheduler,
        config: GovernorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            connection,
            scheduler,
            config,
        })
    }

    /// Start the periodic sweep. Restarting replaces the running one.
    pub fn start(&self) {
        let cache = self.cache.clone();
        let max_age = self.config.max_age();
        self.scheduler
            .schedule_every(TimerId::Sweep, self.config.sweep_interval(), move || {
                let cache = cache.clone();
                async move {
                    sweep(&cache, max_age);
                }
            });
        tracing::info!(
            interval_ms = self.config.sweep_interval_ms,
            max_age_ms = self.config.max_age_ms,
            "Cache sweep started"
        );
    }

    pub fn stop(&self) {
        if self.scheduler.cancel(TimerId::Sweep) {
            tracing::info!("Cache sweep stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_scheduled(TimerId::Sweep)
    }

    /// Run one sweep immediately. Returns the number of evicted entries.
    pub fn sweep_now(&self) -> usize {
        sweep(&self.cache, self.config.max_age())
    }

    pub fn on_background(&self) {
        self.cache.clear();
        self.connection.notify_background();
    }

    pub async fn on_foreground(&self) {
        self.connection.notify_foreground().await;
    }

    /// Free memory without touching the connection.
    pub fn on_memory_pressure(&self) {
        tracing::info!(entries = self.cache.len(), "Memory pressure: clearing cache");
        self.cache.clear();
    }

    pub async fn handle(&self, signal: LifecycleSignal) {
        tracing::debug!(?signal, "Lifecycle signal");
        match signal {
            LifecycleSignal::Background => self.on_background(),
            LifecycleSignal::Foreground => self.on_foreground().await,
            LifecycleSignal::MemoryPressure => self.on_memory_pressure(),
        }
    }

    /// Handle signals from `signals` until the sender side is dropped.
    pub fn spawn_signal_listener(self: &Arc<Self>, mut signals: mpsc::Receiver<LifecycleSignal>) -> JoinHandle<()> {
        let governor = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                governor.handle(signal).await;
            }
            tracing::debug!("Lifecycle signal channel closed");
        })
    }
}

fn sweep(cache: &CacheStore, max_age: Duration) -> usize {
    let evicted = cache.evict_stale(max_age);
    if evicted > 0 {
        tracing::info!(evicted, remaining = cache.len(), "Swept stale cache entries");
    } else {
        tracing::trace!("Sweep found nothing to evict");
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::config::ConnectionConfig;
    use crate::sync::cache::{CacheKey, CacheValue};
    use crate::sync::connection::ConnectionState;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    struct Fixture {
        backend: InMemoryBackend,
        cache: CacheStore,
        scheduler: Scheduler,
        connection: Arc<ConnectionManager>,
        governor: Arc<LifecycleGovernor>,
    }

    fn fixture() -> Fixture {
        let backend = InMemoryBackend::new("db");
        let cache = CacheStore::new(Duration::from_secs(300));
        let scheduler = Scheduler::new();
        let connection = ConnectionManager::new(
            Arc::new(backend.clone()),
            cache.clone(),
            scheduler.clone(),
            ConnectionConfig::default(),
        );
        let governor = LifecycleGovernor::new(
            cache.clone(),
            Arc::clone(&connection),
            scheduler.clone(),
            GovernorConfig::default(),
        );
        Fixture {
            backend,
            cache,
            scheduler,
            connection,
            governor,
        }
    }

    async fn fill(cache: &CacheStore, key: &CacheKey) {
        cache
            .refresh(key, || async { Ok(CacheValue::List(vec![])) })
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_evicts_old_unwatched_entries() {
        let f = fixture();
        let idle = CacheKey::list("chats", vec![]);
        let watched = CacheKey::document("chats", "c1");
        fill(&f.cache, &idle).await;
        fill(&f.cache, &watched).await;
        f.cache.add_subscriber(&watched);

        f.governor.start();
        assert!(f.governor.is_running());

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(300)).await;
            settle().await;
        }
        // Exactly 30 minutes old: not yet past max age.
        assert_eq!(f.cache.len(), 2);

        tokio::time::advance(Duration::from_secs(300)).await;
        settle().await;
        assert!(f.cache.get(&idle).is_none());
        assert!(f.cache.get(&watched).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_sweep() {
        let f = fixture();
        let key = CacheKey::list("chats", vec![]);
        fill(&f.cache, &key).await;

        f.governor.start();
        f.governor.stop();
        assert!(!f.governor.is_running());

        tokio::time::advance(Duration::from_secs(3600)).await;
        settle().await;
        assert_eq!(f.cache.len(), 1);
        assert_eq!(f.governor.sweep_now(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn background_clears_cache_and_suspends_health_check() {
        let f = fixture();
        f.connection.connect().await;
        fill(&f.cache, &CacheKey::list("chats", vec![])).await;

        f.governor.on_background();
        assert!(f.cache.is_empty());
        assert!(!f.scheduler.is_scheduled(TimerId::HealthCheck));

        f.governor.on_foreground().await;
        assert!(f.scheduler.is_scheduled(TimerId::HealthCheck));
        assert_eq!(f.connection.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn memory_pressure_leaves_connection_alone() {
        let f = fixture();
        f.connection.connect().await;
        fill(&f.cache, &CacheKey::list("chats", vec![])).await;

        f.governor.on_memory_pressure();
        assert!(f.cache.is_empty());
        assert!(f.scheduler.is_scheduled(TimerId::HealthCheck));
    }

    #[tokio::test(start_paused = true)]
    async fn signal_listener_dispatches_until_closed() {
        let f = fixture();
        f.backend.set_online(false);
        f.connection.connect().await;
        for _ in 0..5 {
            let delay = f.connection.next_retry_delay().unwrap();
            tokio::time::advance(delay).await;
            settle().await;
        }
        assert_eq!(f.connection.state(), ConnectionState::Disconnected);
        f.backend.set_online(true);

        let (tx, rx) = mpsc::channel(4);
        let listener = f.governor.spawn_signal_listener(rx);
        fill(&f.cache, &CacheKey::list("chats", vec![])).await;

        tx.send(LifecycleSignal::Background).await.unwrap();
        settle().await;
        assert!(f.cache.is_empty());

        tx.send(LifecycleSignal::Foreground).await.unwrap();
        settle().await;
        assert_eq!(f.connection.state(), ConnectionState::Connected);

        drop(tx);
        listener.await.unwrap();
    }
}
