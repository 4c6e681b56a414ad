//! Process-wide sync context.
//!
//! Built once at startup and handed to whatever needs it. Owns the single
//! cache, scheduler and connection, and wires the live query registry to
//! the connection so channels are re-opened after an outage.

use crate::backend::{AppwriteBackend, Backend};
use crate::config::{AppwriteConfig, SyncConfig};
use crate::sync::cache::CacheStore;
use crate::sync::chat::ChatSynchronizer;
use crate::sync::connection::{
    ConnectionManager, ConnectionObserver, ConnectionState, TransportObserver,
};
use crate::sync::governor::LifecycleGovernor;
use crate::sync::live_query::LiveQueryRegistry;
use crate::sync::scheduler::Scheduler;
use anyhow::Context;
use std::sync::Arc;

pub struct SyncContext {
    config: SyncConfig,
    backend: Arc<dyn Backend>,
    scheduler: Scheduler,
    cache: CacheStore,
    connection: Arc<ConnectionManager>,
    live: Arc<LiveQueryRegistry>,
    chat: ChatSynchronizer,
    governor: Arc<LifecycleGovernor>,
}

impl SyncContext {
    /// Wire every component around `backend`.
    pub fn new(config: SyncConfig, backend: Arc<dyn Backend>) -> Self {
        let scheduler = Scheduler::new();
        let cache = CacheStore::new(config.cache.stale_after());
        let connection = ConnectionManager::new(
            Arc::clone(&backend),
            cache.clone(),
            scheduler.clone(),
            config.connection.clone(),
        );
        let live = LiveQueryRegistry::new(Arc::clone(&backend), cache.clone());
        let observer: Arc<dyn ConnectionObserver> = live.clone();
        connection.add_observer(Arc::downgrade(&observer));
        let transport: Arc<dyn TransportObserver> = connection.clone();
        live.add_transport_observer(Arc::downgrade(&transport));

        let chat = ChatSynchronizer::new(
            Arc::clone(&backend),
            Arc::clone(&live),
            config.database_id.as_str(),
            config.chat.clone(),
        );
        let governor = LifecycleGovernor::new(
            cache.clone(),
            Arc::clone(&connection),
            scheduler.clone(),
            config.governor.clone(),
        );

        Self {
            config,
            backend,
            scheduler,
            cache,
            connection,
            live,
            chat,
            governor,
        }
    }

    /// Build a context talking to the Appwrite server from `[appwrite]` or
    /// the `APPWRITE_*` environment variables.
    pub fn from_config(config: SyncConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let appwrite = config
            .appwrite
            .clone()
            .or_else(AppwriteConfig::from_env)
            .context("No [appwrite] section and APPWRITE_ENDPOINT/APPWRITE_PROJECT_ID are not set")?;
        let backend = AppwriteBackend::new(appwrite, config.database_id.as_str())?;
        Ok(Self::new(config, Arc::new(backend)))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn live_queries(&self) -> &Arc<LiveQueryRegistry> {
        &self.live
    }

    pub fn chat(&self) -> &ChatSynchronizer {
        &self.chat
    }

    pub fn governor(&self) -> &Arc<LifecycleGovernor> {
        &self.governor
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Start the sweep and connect.
    pub async fn start(&self) {
        tracing::info!(backend = self.backend.name(), database = %self.config.database_id, "Starting sync context");
        self.governor.start();
        self.connection.connect().await;
    }

    /// Close every subscription and cancel every timer.
    pub async fn shutdown(&self) {
        self.chat.unsubscribe_all().await;
        self.live.detach_all();
        self.governor.stop();
        self.connection.shutdown();
        self.scheduler.cancel_all();
        tracing::info!("Sync context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{ChannelPath, Document, InMemoryBackend};
    use crate::error::BackendError;
    use crate::sync::cache::{CacheKey, CacheValue};
    use crate::sync::chat::DeliveryState;
    use crate::sync::event::{ChangeEvent, ChangeOperation};
    use crate::sync::scheduler::TimerId;
    use serde_json::Map;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    fn context() -> (InMemoryBackend, SyncContext) {
        let backend = InMemoryBackend::new("default");
        let ctx = SyncContext::new(SyncConfig::default(), Arc::new(backend.clone()));
        (backend, ctx)
    }

    fn doc(collection: &str, id: &str) -> Document {
        Document::new(collection, id, Map::new())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_fetches_invoke_fetcher_once() {
        let (_backend, ctx) = context();
        let key = CacheKey::list("chats", vec![]);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetcher = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok::<_, BackendError>(CacheValue::List(vec![doc("chats", "a")]))
            }
        };

        let (a, b) = tokio::join!(
            ctx.cache().fetch_or_get(&key, fetcher(Arc::clone(&calls))),
            ctx.cache().fetch_or_get(&key, fetcher(Arc::clone(&calls))),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap(), b.unwrap());
    }

    #[tokio::test]
    async fn delete_event_removes_document_from_listing() {
        let (_backend, ctx) = context();
        let key = CacheKey::list("chats", vec![]);
        ctx.cache()
            .fetch_or_get(&key, || async {
                Ok(CacheValue::List(vec![doc("chats", "X"), doc("chats", "Y")]))
            })
            .await
            .unwrap();

        ctx.cache()
            .patch(&key, &ChangeEvent::new(ChangeOperation::Delete, doc("chats", "X")));
        let value = ctx.cache().get(&key).unwrap().value;
        let ids: Vec<&str> = value.documents().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["Y"]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_reopens_channels_and_refetches_once() {
        let (backend, ctx) = context();
        ctx.start().await;
        assert_eq!(ctx.connection_state(), ConnectionState::Connected);

        let chats = CacheKey::list("chats", vec![]);
        let profile = CacheKey::document("users", "u1");
        let h1 = ctx
            .live_queries()
            .attach(chats.clone(), ChannelPath::collection("default", "chats"), None)
            .await;
        let h2 = ctx
            .live_queries()
            .attach(profile.clone(), ChannelPath::document("default", "users", "u1"), None)
            .await;
        ctx.live_queries().query(&chats).await.unwrap();
        ctx.live_queries().query(&profile).await.unwrap();
        let (lists, gets, subs) = (backend.list_calls(), backend.get_calls(), backend.subscribe_calls());

        // connected -> error -> reconnecting
        backend.set_online(false);
        tokio::time::advance(ctx.config().connection.health_check_interval()).await;
        settle().await;
        assert_eq!(ctx.connection_state(), ConnectionState::Reconnecting);

        // A write lands while we are away; the channel will not replay it.
        backend.seed(doc("chats", "missed"));

        // reconnecting -> connected
        backend.set_online(true);
        tokio::time::advance(ctx.connection().next_retry_delay().unwrap()).await;
        settle().await;
        assert_eq!(ctx.connection_state(), ConnectionState::Connected);

        assert_eq!(backend.subscribe_calls(), subs + 2);
        assert_eq!(backend.active_subscriptions(), 2);
        assert_eq!(backend.list_calls(), lists + 1);
        assert_eq!(backend.get_calls(), gets + 1);
        let value = ctx.cache().get(&chats).unwrap().value;
        assert!(value.documents().iter().any(|d| d.id == "missed"));

        ctx.live_queries().detach(h1);
        ctx.live_queries().detach(h2);
        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_socket_reconnects_and_refetches() {
        let (backend, ctx) = context();
        ctx.start().await;
        ctx.chat().subscribe("c1").await;
        ctx.chat().load_history("c1").await.unwrap();
        let lists = backend.list_calls();

        // REST stays up; only the realtime transport dies.
        backend.sever_subscriptions();
        assert_eq!(ctx.connection_state(), ConnectionState::Reconnecting);
        assert_eq!(ctx.live_queries().open_channels(), 0);

        // Written while no channel was open.
        let missed = match serde_json::json!({"chatId": "c1", "senderId": "u2", "content": "missed"}) {
            serde_json::Value::Object(map) => map,
            _ => Map::new(),
        };
        backend.seed(Document::new("messages", "m-missed", missed));

        tokio::time::advance(ctx.connection().next_retry_delay().unwrap()).await;
        settle().await;
        assert_eq!(ctx.connection_state(), ConnectionState::Connected);
        assert_eq!(backend.active_subscriptions(), 1);
        assert_eq!(backend.list_calls(), lists + 1);
        assert!(ctx.chat().messages("c1").iter().any(|m| m.id == "m-missed"));
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn failed_send_stays_in_timeline() {
        let (backend, ctx) = context();
        ctx.chat().subscribe("c1").await;
        backend.fail_next_writes(1);

        assert!(ctx.chat().send_message("c1", "u1", "hello").await.is_err());
        let messages = ctx.chat().messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].delivery_state, DeliveryState::Failed);

        // Later traffic does not drop it.
        ctx.chat().send_message("c1", "u2", "anyone?").await.unwrap();
        let states: Vec<DeliveryState> = ctx
            .chat()
            .messages("c1")
            .iter()
            .map(|m| m.delivery_state)
            .collect();
        assert_eq!(states.len(), 2);
        assert!(states.contains(&DeliveryState::Failed));
        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn background_empties_cache_and_cancels_health_check() {
        let (_backend, ctx) = context();
        ctx.start().await;
        ctx.live_queries()
            .query(&CacheKey::list("chats", vec![]))
            .await
            .unwrap();
        assert!(!ctx.cache().is_empty());
        assert!(ctx.scheduler().is_scheduled(TimerId::HealthCheck));

        ctx.governor().on_background();
        assert!(ctx.cache().is_empty());
        assert!(!ctx.scheduler().is_scheduled(TimerId::HealthCheck));
        ctx.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_everything() {
        let (backend, ctx) = context();
        ctx.start().await;
        ctx.chat().subscribe("c1").await;
        assert_eq!(backend.active_subscriptions(), 1);

        ctx.shutdown().await;
        assert_eq!(backend.active_subscriptions(), 0);
        assert_eq!(ctx.connection_state(), ConnectionState::Idle);
        for id in [TimerId::Reconnect, TimerId::HealthCheck, TimerId::Sweep] {
            assert!(!ctx.scheduler().is_scheduled(id));
        }
    }

    #[test]
    fn from_config_requires_a_server() {
        let config = SyncConfig {
            appwrite: Some(AppwriteConfig {
                endpoint: "https://appwrite.example.com/v1".into(),
                project_id: "proj".into(),
                api_key: None,
            }),
            ..SyncConfig::default()
        };
        let ctx = SyncContext::from_config(config).unwrap();
        assert_eq!(ctx.backend().name(), "appwrite");
    }
}
