//! In-process backend.
//!
//! Stores documents in memory and publishes realtime frames to channel
//! subscribers synchronously after every write, the same shape the remote
//! server pushes. Used by tests and offline builds. Failure-injection knobs
//! (offline, failed or slow writes, slow ping or subscribe, severed
//! channels) make the connection and optimistic-write paths testable.

use super::{
    compare, field, Backend, BackendResult, ChannelPath, ChannelSubscription, Credentials,
    ChannelHandler, ClosedCallback, Document, Filter, FrameCallback, RealtimeFrame, Session,
    UNIQUE_ID,
};
use crate::error::BackendError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Create,
    Update,
    Delete,
}

impl WriteKind {
    fn suffix(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

struct Subscriber {
    channel: ChannelPath,
    handler: ChannelHandler,
}

#[derive(Default)]
struct Store {
    /// collection -> id -> document
    collections: HashMap<String, BTreeMap<String, Document>>,
    subscribers: HashMap<u64, Subscriber>,
}

struct Inner {
    database_id: String,
    store: Mutex<Store>,
    online: AtomicBool,
    failing_writes: AtomicUsize,
    ping_delay: Mutex<Option<Duration>>,
    subscribe_delay: Mutex<Option<Duration>>,
    create_delay: Mutex<Option<Duration>>,
    next_subscriber: AtomicU64,
    ping_calls: AtomicUsize,
    get_calls: AtomicUsize,
    list_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
}

/// In-memory [`Backend`].
#[derive(Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl InMemoryBackend {
    pub fn new(database_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                database_id: database_id.into(),
                store: Mutex::new(Store::default()),
                online: AtomicBool::new(true),
                failing_writes: AtomicUsize::new(0),
                ping_delay: Mutex::new(None),
                subscribe_delay: Mutex::new(None),
                create_delay: Mutex::new(None),
                next_subscriber: AtomicU64::new(1),
                ping_calls: AtomicUsize::new(0),
                get_calls: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
                subscribe_calls: AtomicUsize::new(0),
                unsubscribe_calls: AtomicUsize::new(0),
            }),
        }
    }

    pub fn database_id(&self) -> &str {
        &self.inner.database_id
    }

    // ── Failure injection ────────────────────────────────────

    /// Take the backend on/offline. Offline calls fail with a transport error.
    pub fn set_online(&self, online: bool) {
        self.inner.online.store(online, Ordering::SeqCst);
    }

    /// Reject the next `count` create/update/delete calls.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Delay every `ping` by `delay` (to exercise ping timeouts).
    pub fn set_ping_delay(&self, delay: Option<Duration>) {
        *self.inner.ping_delay.lock() = delay;
    }

    /// Delay every `subscribe` by `delay` (channel opens still in flight).
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        *self.inner.subscribe_delay.lock() = delay;
    }

    /// Delay every `create_document` by `delay` (sends still in flight).
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        *self.inner.create_delay.lock() = delay;
    }

    /// Drop every open channel as if the realtime socket died. Each
    /// subscriber's `on_closed` runs once.
    pub fn sever_subscriptions(&self) {
        let closed: Vec<(ChannelPath, ClosedCallback)> = {
            let mut store = self.inner.store.lock();
            store
                .subscribers
                .drain()
                .map(|(_, s)| (s.channel, s.handler.on_closed))
                .collect()
        };
        for (channel, on_closed) in closed {
            tracing::debug!(%channel, "Severing in-memory channel subscription");
            on_closed(BackendError::Transport("realtime connection reset".into()));
        }
    }

    // ── Fixtures ─────────────────────────────────────────────

    /// Store a document without publishing a realtime frame.
    pub fn seed(&self, doc: Document) {
        let mut store = self.inner.store.lock();
        store
            .collections
            .entry(doc.collection.clone())
            .or_default()
            .insert(doc.id.clone(), doc);
    }

    /// Deliver an arbitrary frame to every subscriber of `channel`.
    pub fn emit_raw(&self, channel: &ChannelPath, frame: RealtimeFrame) {
        let callbacks: Vec<FrameCallback> = {
            let store = self.inner.store.lock();
            store
                .subscribers
                .values()
                .filter(|s| &s.channel == channel)
                .map(|s| Arc::clone(&s.handler.on_frame))
                .collect()
        };
        for callback in callbacks {
            callback(frame.clone());
        }
    }

    /// Publish a change for a document as if another client had written it.
    pub fn emit_document_event(&self, operation: &str, doc: &Document) {
        let frame = self.frame_for(operation, doc);
        self.deliver(&doc.collection, &doc.id, frame);
    }

    // ── Counters ─────────────────────────────────────────────

    pub fn ping_calls(&self) -> usize {
        self.inner.ping_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.inner.get_calls.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn unsubscribe_calls(&self) -> usize {
        self.inner.unsubscribe_calls.load(Ordering::SeqCst)
    }

    /// Currently open channel subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.store.lock().subscribers.len()
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        let store = self.inner.store.lock();
        store.collections.get(collection)?.get(id).cloned()
    }

    // ── Internal ─────────────────────────────────────────────

    fn ensure_online(&self) -> BackendResult<()> {
        if self.inner.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Transport("backend offline".into()))
        }
    }

    fn take_write_failure(&self) -> bool {
        self.inner
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn check_write(&self) -> BackendResult<()> {
        self.ensure_online()?;
        if self.take_write_failure() {
            return Err(BackendError::Rejected {
                status: 503,
                message: "injected write failure".into(),
            });
        }
        Ok(())
    }

    fn frame_for(&self, operation: &str, doc: &Document) -> RealtimeFrame {
        let base = format!(
            "databases.{}.collections.{}.documents.{}",
            self.inner.database_id, doc.collection, doc.id
        );
        RealtimeFrame {
            events: vec![
                base.clone(),
                format!("{base}.{operation}"),
                format!("databases.*.collections.*.documents.*.{operation}"),
            ],
            channels: vec![
                ChannelPath::collection(&self.inner.database_id, &doc.collection).to_string(),
                ChannelPath::document(&self.inner.database_id, &doc.collection, &doc.id)
                    .to_string(),
            ],
            timestamp: Some(Value::String(Utc::now().to_rfc3339())),
            payload: serde_json::to_value(doc).unwrap_or(Value::Null),
        }
    }

    fn publish(&self, kind: WriteKind, doc: &Document) {
        let frame = self.frame_for(kind.suffix(), doc);
        self.deliver(&doc.collection, &doc.id, frame);
    }

    /// Callbacks run after the store lock is released so they may call back in.
    fn deliver(&self, collection: &str, id: &str, frame: RealtimeFrame) {
        let callbacks: Vec<FrameCallback> = {
            let store = self.inner.store.lock();
            store
                .subscribers
                .values()
                .filter(|s| s.channel.covers(collection, id))
                .map(|s| Arc::clone(&s.handler.on_frame))
                .collect()
        };
        tracing::trace!(collection, id, receivers = callbacks.len(), "Publishing frame");
        for callback in callbacks {
            callback(frame.clone());
        }
    }
}

fn order_documents(docs: &mut [Document], attribute: &str, descending: bool) {
    docs.sort_by(|a, b| {
        let ord = match attribute {
            "$createdAt" => a.created_at.cmp(&b.created_at),
            "$updatedAt" => a.updated_at.cmp(&b.updated_at),
            other => match (field(a, other), field(b, other)) {
                (Some(left), Some(right)) => {
                    compare(Some(&left), &right).unwrap_or(CmpOrdering::Equal)
                }
                (Some(_), None) => CmpOrdering::Greater,
                (None, Some(_)) => CmpOrdering::Less,
                (None, None) => CmpOrdering::Equal,
            },
        }
        .then_with(|| a.id.cmp(&b.id));
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

struct MemorySubscription {
    id: u64,
    channel: ChannelPath,
    inner: Weak<Inner>,
}

impl ChannelSubscription for MemorySubscription {
    fn channel(&self) -> &ChannelPath {
        &self.channel
    }

    fn unsubscribe(self: Box<Self>) -> BackendResult<()> {
        let inner = self
            .inner
            .upgrade()
            .ok_or_else(|| BackendError::Transport("backend dropped".into()))?;
        inner.unsubscribe_calls.fetch_add(1, Ordering::SeqCst);
        if inner.store.lock().subscribers.remove(&self.id).is_none() {
            return Err(BackendError::Protocol(format!(
                "subscription {} already closed",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn authenticate(&self, credentials: &Credentials) -> BackendResult<Session> {
        self.ensure_online()?;
        if credentials.email.is_empty() || credentials.password.is_empty() {
            return Err(BackendError::Unauthorized("missing credentials".into()));
        }
        Ok(Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: credentials.email.clone(),
            expires_at: Utc::now() + chrono::Duration::days(365),
            secret: None,
        })
    }

    async fn ping(&self) -> BackendResult<()> {
        self.inner.ping_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_online()
    }

    async fn get_document(&self, collection: &str, id: &str) -> BackendResult<Document> {
        self.inner.get_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;
        self.document(collection, id)
            .ok_or_else(|| BackendError::not_found(collection, id))
    }

    async fn list_documents(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> BackendResult<Vec<Document>> {
        self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_online()?;

        let mut docs: Vec<Document> = {
            let store = self.inner.store.lock();
            store
                .collections
                .get(collection)
                .map(|docs| {
                    docs.values()
                        .filter(|d| filters.iter().all(|f| f.matches(d)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        let mut limit = None;
        for filter in filters {
            match filter {
                Filter::OrderAsc { attribute } => order_documents(&mut docs, attribute, false),
                Filter::OrderDesc { attribute } => order_documents(&mut docs, attribute, true),
                Filter::Limit { value } => limit = Some(*value),
                _ => {}
            }
        }
        if let Some(limit) = limit {
            docs.truncate(limit);
        }
        Ok(docs)
    }

    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> BackendResult<Document> {
        let delay = *self.inner.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check_write()?;
        let id = if id == UNIQUE_ID {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            id.to_string()
        };

        let doc = Document::new(collection, id.clone(), data);
        {
            let mut store = self.inner.store.lock();
            let docs = store.collections.entry(collection.to_string()).or_default();
            if docs.contains_key(&id) {
                return Err(BackendError::Rejected {
                    status: 409,
                    message: format!("document {id} already exists"),
                });
            }
            docs.insert(id, doc.clone());
        }
        self.publish(WriteKind::Create, &doc);
        Ok(doc)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> BackendResult<Document> {
        self.check_write()?;
        let doc = {
            let mut store = self.inner.store.lock();
            let doc = store
                .collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| BackendError::not_found(collection, id))?;
            doc.data.extend(patch);
            doc.updated_at = Utc::now();
            doc.clone()
        };
        self.publish(WriteKind::Update, &doc);
        Ok(doc)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> BackendResult<()> {
        self.check_write()?;
        let doc = {
            let mut store = self.inner.store.lock();
            store
                .collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
                .ok_or_else(|| BackendError::not_found(collection, id))?
        };
        self.publish(WriteKind::Delete, &doc);
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &ChannelPath,
        handler: ChannelHandler,
    ) -> BackendResult<Box<dyn ChannelSubscription>> {
        self.inner.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.inner.subscribe_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.ensure_online()?;
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::SeqCst);
        self.inner.store.lock().subscribers.insert(
            id,
            Subscriber {
                channel: channel.clone(),
                handler,
            },
        );
        tracing::debug!(%channel, id, "Opened in-memory channel subscription");
        Ok(Box::new(MemorySubscription {
            id,
            channel: channel.clone(),
            inner: Arc::downgrade(&self.inner),
        }))
    }
}
