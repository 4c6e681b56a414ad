//! Live queries: cache entries bound to realtime channels.
//!
//! Each channel path has at most one backend subscription, shared by every
//! cache key attached to it. The channel stays open while at least one
//! [`SubscriptionHandle`] for it is outstanding; per-key counts go to the
//! cache's subscriber ledger so the sweep never evicts a watched entry.
//!
//! Frames are parsed once at the boundary ([`ChangeEvent::from_frame`]) and
//! applied to every key on the channel in arrival order. Unrecognized frames
//! are logged and dropped.
//!
//! A channel whose transport dies on its own is dropped from the registry and
//! reported to every [`TransportObserver`]; the reconnect that follows
//! re-opens it through [`LiveQueryRegistry::resync`].

use crate::backend::{
    Backend, BackendResult, ChannelHandler, ChannelPath, ChannelSubscription, ClosedCallback,
    FrameCallback, RealtimeFrame,
};
use crate::error::{BackendError, SyncResult};
use crate::sync::cache::{CacheKey, CacheStore, CacheValue};
use crate::sync::connection::{ConnectionObserver, TransportObserver};
use crate::sync::event::ChangeEvent;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// Receives changes for one attached key.
pub trait ChangeListener: Send + Sync {
    /// Called after `event` was applied to the cache.
    fn on_event(&self, key: &CacheKey, event: &ChangeEvent);

    /// Called after a reconnect refetched `key`.
    fn on_resync(&self, _key: &CacheKey, _value: &CacheValue) {}
}

/// Proof of one `attach`. Give it back to [`LiveQueryRegistry::detach`].
#[must_use = "dropping a handle leaks the channel subscription; pass it to detach()"]
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    key: CacheKey,
    channel: ChannelPath,
}

impl SubscriptionHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn channel(&self) -> &ChannelPath {
        &self.channel
    }
}

/// Fetch the current server value of `key`.
pub fn fetch_key(backend: Arc<dyn Backend>, key: CacheKey) -> BoxFuture<'static, BackendResult<CacheValue>> {
    async move {
        match key.document_id() {
            Some(id) => backend
                .get_document(key.collection(), id)
                .await
                .map(CacheValue::Document),
            None => backend
                .list_documents(key.collection(), key.filters())
                .await
                .map(CacheValue::List),
        }
    }
    .boxed()
}

struct Attachment {
    key: CacheKey,
    listener: Option<Arc<dyn ChangeListener>>,
}

struct ChannelEntry {
    /// Distinguishes this entry from a later one for the same path.
    generation: u64,
    /// Id of the latest `open_channel` call; closures from older opens are stale.
    open_id: u64,
    subscription: Option<Box<dyn ChannelSubscription>>,
    opening: bool,
    attachments: HashMap<u64, Attachment>,
}

impl ChannelEntry {
    fn keys(&self) -> BTreeSet<String> {
        self.attachments.values().map(|a| a.key.to_string()).collect()
    }

    fn distinct_keys(&self) -> Vec<CacheKey> {
        let mut seen = BTreeSet::new();
        self.attachments
            .values()
            .filter(|a| seen.insert(a.key.to_string()))
            .map(|a| a.key.clone())
            .collect()
    }
}

#[derive(Default)]
struct Channels {
    entries: HashMap<ChannelPath, ChannelEntry>,
    next_generation: u64,
}

pub struct LiveQueryRegistry {
    backend: Arc<dyn Backend>,
    cache: CacheStore,
    channels: Mutex<Channels>,
    next_handle: AtomicU64,
    next_open: AtomicU64,
    transport_observers: Mutex<Vec<Weak<dyn TransportObserver>>>,
    me: Weak<LiveQueryRegistry>,
}

impl LiveQueryRegistry {
    pub fn new(backend: Arc<dyn Backend>, cache: CacheStore) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            backend,
            cache,
            channels: Mutex::new(Channels::default()),
            next_handle: AtomicU64::new(1),
            next_open: AtomicU64::new(1),
            transport_observers: Mutex::new(Vec::new()),
            me: me.clone(),
        })
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Register for channels that die on their own.
    pub fn add_transport_observer(&self, observer: Weak<dyn TransportObserver>) {
        self.transport_observers.lock().push(observer);
    }

    /// Cached value of `key`, fetching it from the backend when missing or stale.
    pub async fn query(&self, key: &CacheKey) -> SyncResult<Arc<CacheValue>> {
        let backend = Arc::clone(&self.backend);
        let fetch = key.clone();
        self.cache
            .fetch_or_get(key, move || fetch_key(backend, fetch))
            .await
    }

    /// Channels with a live backend subscription.
    pub fn open_channels(&self) -> usize {
        self.channels
            .lock()
            .entries
            .values()
            .filter(|e| e.subscription.is_some())
            .count()
    }

    /// Keys attached to `channel`, serialized.
    pub fn attached_keys(&self, channel: &ChannelPath) -> BTreeSet<String> {
        self.channels
            .lock()
            .entries
            .get(channel)
            .map(ChannelEntry::keys)
            .unwrap_or_default()
    }

    /// Watch `key` through `channel`.
    ///
    /// The first attachment to a channel opens the backend subscription. If
    /// that fails the attachment still counts and the channel is retried on
    /// the next reconnect.
    pub async fn attach(
        &self,
        key: CacheKey,
        channel: ChannelPath,
        listener: Option<Arc<dyn ChangeListener>>,
    ) -> SubscriptionHandle {
        let id = self.next_handle.fetch_add(1, Ordering::SeqCst);
        let subscribers = self.cache.add_subscriber(&key);

        let open_generation = {
            let mut channels = self.channels.lock();
            let generation = channels.next_generation;
            let entry = channels.entries.entry(channel.clone()).or_insert_with(|| ChannelEntry {
                generation,
                open_id: 0,
                subscription: None,
                opening: false,
                attachments: HashMap::new(),
            });
            let entry_generation = entry.generation;
            entry.attachments.insert(
                id,
                Attachment {
                    key: key.clone(),
                    listener,
                },
            );
            let needs_open = entry.subscription.is_none() && !entry.opening;
            if needs_open {
                entry.opening = true;
            }
            if entry_generation == generation {
                channels.next_generation += 1;
            }
            needs_open.then_some(entry_generation)
        };

        tracing::debug!(%key, %channel, subscribers, "Attached live query");
        if let Some(generation) = open_generation {
            self.open_channel(&channel, generation).await;
        }

        SubscriptionHandle { id, key, channel }
    }

    /// Release one attachment. The last one on a channel closes it.
    pub fn detach(&self, handle: SubscriptionHandle) {
        let closing = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.entries.get_mut(&handle.channel) else {
                tracing::debug!(key = %handle.key, channel = %handle.channel, "Detach after teardown ignored");
                return;
            };
            if entry.attachments.remove(&handle.id).is_none() {
                tracing::debug!(key = %handle.key, "Unknown handle ignored");
                return;
            }
            if entry.attachments.is_empty() {
                channels
                    .entries
                    .remove(&handle.channel)
                    .and_then(|e| e.subscription)
            } else {
                None
            }
        };

        let remaining = self.cache.remove_subscriber(&handle.key);
        tracing::debug!(key = %handle.key, channel = %handle.channel, remaining, "Detached live query");
        if let Some(subscription) = closing {
            close_subscription(subscription);
        }
    }

    /// Close every channel and drop every attachment.
    pub fn detach_all(&self) {
        let entries: Vec<ChannelEntry> = {
            let mut channels = self.channels.lock();
            channels.entries.drain().map(|(_, e)| e).collect()
        };
        for entry in entries {
            for attachment in entry.attachments.values() {
                self.cache.remove_subscriber(&attachment.key);
            }
            if let Some(subscription) = entry.subscription {
                close_subscription(subscription);
            }
        }
    }

    /// Re-open every channel and refetch every attached key once.
    ///
    /// A channel whose open is still in flight is left to finish, but its
    /// keys are refetched all the same.
    pub async fn resync(&self) {
        let mut reopen = Vec::new();
        let mut stale = Vec::new();
        let mut keys: Vec<(CacheKey, Vec<Arc<dyn ChangeListener>>)> = Vec::new();
        {
            let mut channels = self.channels.lock();
            for (path, entry) in channels.entries.iter_mut() {
                if !entry.opening {
                    if let Some(subscription) = entry.subscription.take() {
                        stale.push(subscription);
                    }
                    entry.opening = true;
                    reopen.push((path.clone(), entry.generation));
                }

                for key in entry.distinct_keys() {
                    let listeners: Vec<_> = entry
                        .attachments
                        .values()
                        .filter(|a| a.key == key)
                        .filter_map(|a| a.listener.clone())
                        .collect();
                    match keys.iter_mut().find(|(k, _)| *k == key) {
                        Some((_, existing)) => existing.extend(listeners),
                        None => keys.push((key, listeners)),
                    }
                }
            }
        }

        tracing::info!(channels = reopen.len(), keys = keys.len(), "Resynchronizing live queries");
        for subscription in stale {
            close_subscription(subscription);
        }
        for (channel, generation) in reopen {
            self.open_channel(&channel, generation).await;
        }
        for (key, listeners) in keys {
            let backend = Arc::clone(&self.backend);
            let fetch = key.clone();
            match self.cache.refresh(&key, move || fetch_key(backend, fetch)).await {
                Ok(value) => {
                    for listener in &listeners {
                        listener.on_resync(&key, &value);
                    }
                }
                Err(e) => tracing::warn!(%key, "Refetch after reconnect failed: {e}"),
            }
        }
    }

    // ── Internal ────────────────────────────────────────────────

    async fn open_channel(&self, channel: &ChannelPath, generation: u64) {
        let open_id = self.next_open.fetch_add(1, Ordering::SeqCst);
        if let Some(entry) = self.channels.lock().entries.get_mut(channel) {
            if entry.generation == generation {
                entry.open_id = open_id;
            }
        }

        let handler = ChannelHandler::new(
            self.frame_callback(channel.clone()),
            self.closed_callback(channel.clone(), open_id),
        );
        let result = self.backend.subscribe(channel, handler).await;

        let orphan = {
            let mut channels = self.channels.lock();
            match channels.entries.get_mut(channel) {
                Some(entry) if entry.generation == generation => {
                    entry.opening = false;
                    match result {
                        Ok(subscription) => {
                            tracing::info!(%channel, "Channel subscription opened");
                            entry.subscription = Some(subscription);
                        }
                        Err(e) => {
                            tracing::warn!(%channel, "Channel subscription failed, retrying on reconnect: {e}");
                        }
                    }
                    None
                }
                // Everyone detached while we were opening.
                _ => result.ok(),
            }
        };
        if let Some(subscription) = orphan {
            close_subscription(subscription);
        }
    }

    fn frame_callback(&self, channel: ChannelPath) -> FrameCallback {
        let registry = self.me.clone();
        Arc::new(move |frame: RealtimeFrame| {
            if let Some(registry) = registry.upgrade() {
                registry.dispatch(&channel, &frame);
            }
        })
    }

    fn closed_callback(&self, channel: ChannelPath, open_id: u64) -> ClosedCallback {
        let registry = self.me.clone();
        Arc::new(move |error: BackendError| {
            if let Some(registry) = registry.upgrade() {
                registry.channel_lost(&channel, open_id, &error);
            }
        })
    }

    fn channel_lost(&self, channel: &ChannelPath, open_id: u64, error: &BackendError) {
        let dead = {
            let mut channels = self.channels.lock();
            match channels.entries.get_mut(channel) {
                Some(entry) if entry.open_id == open_id => Some(entry.subscription.take()),
                _ => None,
            }
        };
        let Some(dead) = dead else {
            tracing::debug!(%channel, "Closure of a replaced subscription ignored");
            return;
        };
        // The transport is already gone; there is nothing to unsubscribe.
        drop(dead);
        tracing::warn!(%channel, %error, "Channel transport lost");

        let observers: Vec<Arc<dyn TransportObserver>> = {
            let mut observers = self.transport_observers.lock();
            observers.retain(|o| o.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            observer.on_transport_lost(error);
        }
    }

    fn dispatch(&self, channel: &ChannelPath, frame: &RealtimeFrame) {
        let event = match ChangeEvent::from_frame(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(%channel, "Dropping realtime frame: {e}");
                return;
            }
        };
        if !channel.covers(&event.collection, &event.document_id) {
            tracing::debug!(%channel, collection = %event.collection, "Event outside channel scope ignored");
            return;
        }

        let (keys, listeners) = {
            let channels = self.channels.lock();
            let Some(entry) = channels.entries.get(channel) else {
                return;
            };
            let listeners: Vec<(CacheKey, Arc<dyn ChangeListener>)> = entry
                .attachments
                .values()
                .filter_map(|a| a.listener.clone().map(|l| (a.key.clone(), l)))
                .collect();
            (entry.distinct_keys(), listeners)
        };

        tracing::debug!(%channel, op = %event.operation, id = %event.document_id, "Change event");
        for key in &keys {
            self.cache.patch(key, &event);
        }
        for (key, listener) in listeners {
            listener.on_event(&key, &event);
        }
    }
}

#[async_trait]
impl ConnectionObserver for LiveQueryRegistry {
    async fn on_reconnected(&self) {
        self.resync().await;
    }
}

fn close_subscription(subscription: Box<dyn ChannelSubscription>) {
    let channel = subscription.channel().clone();
    match subscription.unsubscribe() {
        Ok(()) => tracing::info!(%channel, "Channel subscription closed"),
        Err(e) => tracing::warn!(%channel, "Channel teardown failed: {e}"),
    }
}
