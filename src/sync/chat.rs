//! Chat message synchronizer.
//!
//! Keeps one ordered timeline per chat on top of the live query layer:
//! history comes from a cached listing (`chatId == …`, newest first, limited),
//! realtime events are folded in with id dedupe, and locally sent messages
//! are shown immediately as `pending` until the server confirms them.
//!
//! Ordering is `(created_at, id)` ascending. A message id never appears twice.
//!
//! ## Echo reconciliation
//!
//! Sends use a server-assigned id, so the realtime echo of our own create can
//! arrive before (or without) the create response and under an id we have not
//! seen yet. An unknown incoming message is treated as the echo of a pending
//! local message when sender and content are equal and the two `created_at`
//! values are within the configured echo window; the oldest such pending
//! message wins. The local → server id pair is kept in the optimistic mapping
//! until the create response arrives.

use crate::backend::{Backend, ChannelPath, Document, Filter, UNIQUE_ID};
use crate::config::ChatConfig;
use crate::error::{SyncError, SyncResult};
use crate::sync::cache::{CacheKey, CacheValue};
use crate::sync::event::{ChangeEvent, ChangeOperation};
use crate::sync::live_query::{ChangeListener, LiveQueryRegistry, SubscriptionHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Prefix of ids generated for optimistic messages.
const LOCAL_ID_PREFIX: &str = "local-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// Shown locally, create call in flight
    Pending,
    /// Stored on the server
    Sent,
    /// Create call failed; kept for retry
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server id, or `local-…` until the create is confirmed
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    /// Users who have seen the message; always includes the sender
    pub seen_by: BTreeSet<String>,
    pub delivery_state: DeliveryState,
}

impl Message {
    /// A not-yet-confirmed message with a local temporary id.
    fn local(chat_id: &str, sender_id: &str, content: &str) -> Self {
        Self {
            id: format!("{LOCAL_ID_PREFIX}{}", uuid::Uuid::new_v4()),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            seen_by: BTreeSet::from([sender_id.to_string()]),
            delivery_state: DeliveryState::Pending,
        }
    }

    /// Server message from a stored document. `None` if required fields are missing.
    pub fn from_document(doc: &Document) -> Option<Self> {
        let sender_id = doc.get_str("senderId")?.to_string();
        let mut seen_by: BTreeSet<String> = doc
            .get("seenBy")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        seen_by.insert(sender_id.clone());

        Some(Self {
            id: doc.id.clone(),
            chat_id: doc.get_str("chatId")?.to_string(),
            sender_id,
            content: doc.get_str("content")?.to_string(),
            created_at: doc.created_at,
            seen_by,
            delivery_state: DeliveryState::Sent,
        })
    }

    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    fn to_data(&self) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("chatId".into(), Value::from(self.chat_id.as_str()));
        data.insert("senderId".into(), Value::from(self.sender_id.as_str()));
        data.insert("content".into(), Value::from(self.content.as_str()));
        data.insert("seenBy".into(), seen_by_value(&self.seen_by));
        data
    }

    fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }
}

fn seen_by_value(seen_by: &BTreeSet<String>) -> Value {
    Value::Array(seen_by.iter().map(|id| Value::from(id.as_str())).collect())
}

// ── Timeline state ──────────────────────────────────────────────

#[derive(Default)]
struct Timeline {
    /// Sorted by `(created_at, id)`.
    messages: Vec<Message>,
}

impl Timeline {
    fn position(&self, id: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.id == id)
    }

    /// Insert or replace by id, keeping the order.
    fn upsert(&mut self, message: Message) {
        if let Some(i) = self.position(&message.id) {
            self.messages.remove(i);
        }
        let at = self
            .messages
            .partition_point(|m| m.order_key() < message.order_key());
        self.messages.insert(at, message);
    }

    fn remove(&mut self, id: &str) -> Option<Message> {
        self.position(id).map(|i| self.messages.remove(i))
    }

    /// Oldest pending local message that `incoming` could be the echo of.
    fn echo_candidate(&self, incoming: &Message, window: chrono::Duration) -> Option<String> {
        self.messages
            .iter()
            .filter(|m| m.delivery_state == DeliveryState::Pending && m.is_local())
            .filter(|m| m.sender_id == incoming.sender_id && m.content == incoming.content)
            .find(|m| {
                let delta = if m.created_at > incoming.created_at {
                    m.created_at - incoming.created_at
                } else {
                    incoming.created_at - m.created_at
                };
                delta <= window
            })
            .map(|m| m.id.clone())
    }
}

#[derive(Default)]
struct ChatState {
    timelines: HashMap<String, Timeline>,
    /// local temp id → server id, for echoes that beat the create response.
    optimistic: HashMap<String, String>,
}

impl ChatState {
    fn timeline(&mut self, chat_id: &str) -> &mut Timeline {
        self.timelines.entry(chat_id.to_string()).or_default()
    }

    /// Fold in a server message: replace by id, reconcile with a pending
    /// local message, or insert.
    fn absorb(&mut self, message: Message, window: chrono::Duration) {
        let chat_id = message.chat_id.clone();
        let timeline = self.timeline(&chat_id);
        if timeline.position(&message.id).is_some() {
            timeline.upsert(message);
            return;
        }

        match timeline.echo_candidate(&message, window) {
            Some(local_id) => {
                let mut confirmed = message;
                if let Some(local) = timeline.remove(&local_id) {
                    confirmed.seen_by.extend(local.seen_by);
                }
                tracing::debug!(chat = %chat_id, local = %local_id, server = %confirmed.id, "Echo reconciled pending message");
                let server_id = confirmed.id.clone();
                timeline.upsert(confirmed);
                self.optimistic.insert(local_id, server_id);
            }
            None => timeline.upsert(message),
        }
    }

    /// The create call for `local_id` returned `confirmed`.
    fn confirm(&mut self, local_id: &str, mut confirmed: Message) -> Message {
        let echoed_as = self.optimistic.remove(local_id);
        let timeline = self.timeline(&confirmed.chat_id);

        match timeline.remove(local_id) {
            Some(local) => {
                confirmed.seen_by.extend(local.seen_by);
                if let Some(echo) = timeline.remove(&confirmed.id) {
                    confirmed.seen_by.extend(echo.seen_by);
                }
                timeline.upsert(confirmed.clone());
                confirmed
            }
            None => {
                if echoed_as.as_deref() != Some(confirmed.id.as_str()) {
                    tracing::debug!(local = %local_id, server = %confirmed.id, "Confirmation without a matching local message");
                }
                match timeline.position(&confirmed.id) {
                    Some(i) => timeline.messages[i].clone(),
                    None => {
                        timeline.upsert(confirmed.clone());
                        confirmed
                    }
                }
            }
        }
    }

    fn set_delivery(&mut self, chat_id: &str, id: &str, state: DeliveryState) -> Option<Message> {
        let timeline = self.timelines.get_mut(chat_id)?;
        let i = timeline.position(id)?;
        timeline.messages[i].delivery_state = state;
        Some(timeline.messages[i].clone())
    }

    /// Server id a local message was reconciled to, if its echo came first.
    fn resolve<'a>(&'a self, id: &'a str) -> &'a str {
        self.optimistic.get(id).map(String::as_str).unwrap_or(id)
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Message> {
        self.timelines
            .values_mut()
            .find_map(|t| t.messages.iter_mut().find(|m| m.id == id))
    }
}

// ── Realtime listener ───────────────────────────────────────────

struct ChatListener {
    chat_id: String,
    state: Arc<Mutex<ChatState>>,
    echo_window: chrono::Duration,
}

impl ChangeListener for ChatListener {
    fn on_event(&self, _key: &CacheKey, event: &ChangeEvent) {
        let Some(message) = Message::from_document(&event.payload) else {
            tracing::debug!(id = %event.document_id, "Ignoring non-message document");
            return;
        };
        if message.chat_id != self.chat_id {
            return;
        }

        let mut state = self.state.lock();
        match event.operation {
            ChangeOperation::Create => state.absorb(message, self.echo_window),
            ChangeOperation::Update => {
                let timeline = state.timeline(&self.chat_id);
                if timeline.position(&message.id).is_some() {
                    timeline.upsert(message);
                }
            }
            ChangeOperation::Delete => {
                state.timeline(&self.chat_id).remove(&message.id);
            }
        }
    }

    fn on_resync(&self, _key: &CacheKey, value: &CacheValue) {
        let mut state = self.state.lock();
        for message in value.documents().iter().filter_map(Message::from_document) {
            if message.chat_id == self.chat_id {
                state.absorb(message, self.echo_window);
            }
        }
    }
}

// ── Synchronizer ────────────────────────────────────────────────

pub struct ChatSynchronizer {
    backend: Arc<dyn Backend>,
    live: Arc<LiveQueryRegistry>,
    database_id: String,
    config: ChatConfig,
    echo_window: chrono::Duration,
    state: Arc<Mutex<ChatState>>,
    subscriptions: tokio::sync::Mutex<HashMap<String, SubscriptionHandle>>,
}

impl ChatSynchronizer {
    pub fn new(
        backend: Arc<dyn Backend>,
        live: Arc<LiveQueryRegistry>,
        database_id: impl Into<String>,
        config: ChatConfig,
    ) -> Self {
        let echo_window =
            chrono::Duration::from_std(config.echo_match_window()).unwrap_or(chrono::Duration::MAX);
        Self {
            backend,
            live,
            database_id: database_id.into(),
            echo_window,
            config,
            state: Arc::new(Mutex::new(ChatState::default())),
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Cache key of a chat's history listing.
    pub fn history_key(&self, chat_id: &str) -> CacheKey {
        CacheKey::list(
            self.config.messages_collection.as_str(),
            vec![
                Filter::equal("chatId", chat_id),
                Filter::order_desc("$createdAt"),
                Filter::limit(self.config.history_limit),
            ],
        )
    }

    /// Realtime channel carrying a chat's messages.
    pub fn channel(&self) -> ChannelPath {
        ChannelPath::collection(self.database_id.as_str(), self.config.messages_collection.as_str())
    }

    /// Current ordered timeline of `chat_id`.
    pub fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.state
            .lock()
            .timelines
            .get(chat_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default()
    }

    /// Fetch the most recent messages and merge them into the timeline.
    ///
    /// Local messages that are still pending or failed stay in place.
    pub async fn load_history(&self, chat_id: &str) -> SyncResult<Vec<Message>> {
        let key = self.history_key(chat_id);
        let value = self.live.query(&key).await?;

        let mut state = self.state.lock();
        let mut loaded = 0usize;
        for message in value.documents().iter().filter_map(Message::from_document) {
            if message.chat_id == chat_id {
                state.absorb(message, self.echo_window);
                loaded += 1;
            }
        }
        tracing::debug!(chat = %chat_id, loaded, "History loaded");
        Ok(state
            .timelines
            .get(chat_id)
            .map(|t| t.messages.clone())
            .unwrap_or_default())
    }

    /// Show a message immediately, then create it on the server.
    ///
    /// On failure the message stays in the timeline as `failed` and the write
    /// error is returned; [`retry_message`](Self::retry_message) re-sends it.
    pub async fn send_message(&self, chat_id: &str, sender_id: &str, content: &str) -> SyncResult<Message> {
        let local = Message::local(chat_id, sender_id, content);
        self.state.lock().timeline(chat_id).upsert(local.clone());
        tracing::debug!(chat = %chat_id, local = %local.id, "Optimistic message inserted");
        self.deliver(local).await
    }

    /// Re-send a `failed` message.
    pub async fn retry_message(&self, chat_id: &str, local_id: &str) -> SyncResult<Message> {
        let local = {
            let mut state = self.state.lock();
            let current = state
                .timelines
                .get(chat_id)
                .and_then(|t| t.position(local_id).map(|i| t.messages[i].clone()));
            match current {
                Some(m) if m.delivery_state == DeliveryState::Failed => {
                    state.set_delivery(chat_id, local_id, DeliveryState::Pending);
                    m
                }
                _ => return Err(SyncError::MessageNotFound(local_id.to_string())),
            }
        };
        tracing::info!(chat = %chat_id, local = %local_id, "Retrying failed message");
        self.deliver(local).await
    }

    /// Add `user_id` to a message's `seenBy` set and push the set.
    ///
    /// No-op when the user is already in the set. A message whose create is
    /// still in flight only changes locally here; the send pushes the merged
    /// set once the server id is known.
    pub async fn mark_seen(&self, message_id: &str, user_id: &str) -> SyncResult<()> {
        let (server_id, seen_by) = {
            let mut state = self.state.lock();
            let id = state.resolve(message_id).to_string();
            let message = state
                .find_mut(&id)
                .ok_or_else(|| SyncError::MessageNotFound(message_id.to_string()))?;
            if !message.seen_by.insert(user_id.to_string()) {
                return Ok(());
            }
            if message.is_local() {
                return Ok(());
            }
            (id, message.seen_by.clone())
        };
        self.push_seen_by(&server_id, &seen_by).await
    }

    /// Follow a chat's realtime channel. Repeated calls are no-ops.
    pub async fn subscribe(&self, chat_id: &str) {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(chat_id) {
            return;
        }
        let listener = Arc::new(ChatListener {
            chat_id: chat_id.to_string(),
            state: Arc::clone(&self.state),
            echo_window: self.echo_window,
        });
        let handle = self
            .live
            .attach(self.history_key(chat_id), self.channel(), Some(listener))
            .await;
        subscriptions.insert(chat_id.to_string(), handle);
        tracing::info!(chat = %chat_id, "Subscribed to chat");
    }

    /// Stop following a chat. Returns whether it was subscribed.
    pub async fn unsubscribe(&self, chat_id: &str) -> bool {
        let handle = self.subscriptions.lock().await.remove(chat_id);
        match handle {
            Some(handle) => {
                self.live.detach(handle);
                tracing::info!(chat = %chat_id, "Unsubscribed from chat");
                true
            }
            None => false,
        }
    }

    pub async fn unsubscribe_all(&self) {
        let handles: Vec<SubscriptionHandle> = self
            .subscriptions
            .lock()
            .await
            .drain()
            .map(|(_, h)| h)
            .collect();
        for handle in handles {
            self.live.detach(handle);
        }
    }

    #[cfg(test)]
    fn pending_reconciliations(&self) -> usize {
        self.state.lock().optimistic.len()
    }

    async fn push_seen_by(&self, id: &str, seen_by: &BTreeSet<String>) -> SyncResult<()> {
        let mut patch = Map::new();
        patch.insert("seenBy".into(), seen_by_value(seen_by));
        self.backend
            .update_document(&self.config.messages_collection, id, patch)
            .await
            .map_err(|e| {
                tracing::warn!(%id, "Failed to push seenBy: {e}");
                SyncError::Write(e)
            })?;
        Ok(())
    }

    async fn deliver(&self, local: Message) -> SyncResult<Message> {
        let result = self
            .backend
            .create_document(&self.config.messages_collection, UNIQUE_ID, local.to_data())
            .await;

        match result {
            Ok(doc) => {
                let confirmed = Message::from_document(&doc).unwrap_or_else(|| Message {
                    id: doc.id.clone(),
                    created_at: doc.created_at,
                    delivery_state: DeliveryState::Sent,
                    ..local.clone()
                });
                let stored = confirmed.seen_by.clone();
                let message = self.state.lock().confirm(&local.id, confirmed);
                tracing::debug!(local = %local.id, server = %message.id, "Message confirmed");

                // Seen marks made while the create was in flight.
                if message.seen_by != stored {
                    if let Err(e) = self.push_seen_by(&message.id, &message.seen_by).await {
                        tracing::warn!(id = %message.id, "Seen marks kept locally only: {e}");
                    }
                }
                Ok(message)
            }
            Err(e) => {
                tracing::warn!(chat = %local.chat_id, local = %local.id, "Send failed: {e}");
                self.state
                    .lock()
                    .set_delivery(&local.chat_id, &local.id, DeliveryState::Failed);
                Err(SyncError::Write(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::sync::cache::CacheStore;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn setup() -> (InMemoryBackend, ChatSynchronizer) {
        let backend = InMemoryBackend::new("db");
        let shared: Arc<dyn Backend> = Arc::new(backend.clone());
        let live = LiveQueryRegistry::new(Arc::clone(&shared), CacheStore::new(Duration::from_secs(300)));
        let chat = ChatSynchronizer::new(shared, live, "db", ChatConfig::default());
        (backend, chat)
    }

    fn stored(id: &str, chat: &str, sender: &str, content: &str, at_secs: i64) -> Document {
        let data = match json!({"chatId": chat, "senderId": sender, "content": content, "seenBy": [sender]}) {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut doc = Document::new("messages", id, data);
        doc.created_at = Utc.timestamp_opt(1_700_000_000 + at_secs, 0).unwrap();
        doc.updated_at = doc.created_at;
        doc
    }

    fn assert_ordered(messages: &[Message]) {
        for pair in messages.windows(2) {
            assert!(pair[0].order_key() < pair[1].order_key(), "{:?} !< {:?}", pair[0].id, pair[1].id);
        }
    }

    #[tokio::test]
    async fn history_is_latest_n_ascending() {
        let (backend, chat) = setup();
        for i in 0..60 {
            backend.seed(stored(&format!("m{i:02}"), "c1", "u1", "hi", i));
        }
        backend.seed(stored("other", "c2", "u1", "hi", 100));

        let messages = chat.load_history("c1").await.unwrap();
        assert_eq!(messages.len(), 50);
        assert_eq!(messages.first().unwrap().id, "m10");
        assert_eq!(messages.last().unwrap().id, "m59");
        assert_ordered(&messages);
        assert!(messages.iter().all(|m| m.delivery_state == DeliveryState::Sent));
    }

    #[tokio::test]
    async fn equal_timestamps_break_ties_by_id() {
        let (backend, chat) = setup();
        backend.seed(stored("b", "c1", "u1", "x", 5));
        backend.seed(stored("a", "c1", "u2", "y", 5));
        backend.seed(stored("c", "c1", "u1", "z", 1));

        let ids: Vec<String> = chat.load_history("c1").await.unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[tokio::test]
    async fn send_with_echo_yields_one_sent_message() {
        let (backend, chat) = setup();
        chat.subscribe("c1").await;

        let sent = chat.send_message("c1", "u1", "hello").await.unwrap();
        assert_eq!(sent.delivery_state, DeliveryState::Sent);
        assert!(!sent.is_local());
        assert!(sent.seen_by.contains("u1"));

        let messages = chat.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, sent.id);
        assert_eq!(chat.pending_reconciliations(), 0);
        assert!(backend.document("messages", &sent.id).is_some());
    }

    #[tokio::test]
    async fn send_without_subscription_reconciles_on_response() {
        let (_backend, chat) = setup();
        let sent = chat.send_message("c1", "u1", "hello").await.unwrap();
        let messages = chat.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, sent.id);
        assert_eq!(messages[0].delivery_state, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn identical_sends_stay_distinct() {
        let (_backend, chat) = setup();
        chat.subscribe("c1").await;
        let first = chat.send_message("c1", "u1", "ok").await.unwrap();
        let second = chat.send_message("c1", "u1", "ok").await.unwrap();

        assert_ne!(first.id, second.id);
        let messages = chat.messages("c1");
        assert_eq!(messages.len(), 2);
        assert_ordered(&messages);
    }

    #[tokio::test]
    async fn failed_send_stays_visible_and_can_be_retried() {
        let (backend, chat) = setup();
        backend.fail_next_writes(1);

        let err = chat.send_message("c1", "u1", "lost?").await.unwrap_err();
        assert!(matches!(err, SyncError::Write(_)));
        let messages = chat.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].delivery_state, DeliveryState::Failed);
        assert!(messages[0].is_local());

        let retried = chat.retry_message("c1", &messages[0].id).await.unwrap();
        assert_eq!(retried.delivery_state, DeliveryState::Sent);
        assert_eq!(chat.messages("c1"), vec![retried]);

        let unknown = chat.retry_message("c1", "local-missing").await.unwrap_err();
        assert_eq!(unknown, SyncError::MessageNotFound("local-missing".into()));
    }

    #[tokio::test]
    async fn echo_before_response_is_not_duplicated() {
        let (_backend, chat) = setup();
        let local = Message::local("c1", "u1", "hi");
        chat.state.lock().timeline("c1").upsert(local.clone());

        // Echo under the server id arrives first.
        let mut echo = local.clone();
        echo.id = "srv1".into();
        echo.delivery_state = DeliveryState::Sent;
        chat.state.lock().absorb(echo.clone(), chat.echo_window);
        assert_eq!(chat.messages("c1").len(), 1);
        assert_eq!(chat.pending_reconciliations(), 1);

        // Then the create response.
        let confirmed = chat.state.lock().confirm(&local.id, echo);
        assert_eq!(confirmed.id, "srv1");
        assert_eq!(chat.messages("c1").len(), 1);
        assert_eq!(chat.pending_reconciliations(), 0);
    }

    #[tokio::test]
    async fn echo_outside_window_is_a_new_message() {
        let (_backend, chat) = setup();
        let local = Message::local("c1", "u1", "hi");
        chat.state.lock().timeline("c1").upsert(local.clone());

        let mut other = local.clone();
        other.id = "srv-old".into();
        other.created_at = local.created_at - chrono::Duration::seconds(60);
        other.delivery_state = DeliveryState::Sent;
        chat.state.lock().absorb(other, chat.echo_window);
        assert_eq!(chat.messages("c1").len(), 2);
    }

    #[tokio::test]
    async fn mark_seen_is_idempotent() {
        let (backend, chat) = setup();
        backend.seed(stored("m1", "c1", "u1", "hi", 0));
        chat.load_history("c1").await.unwrap();

        chat.mark_seen("m1", "u2").await.unwrap();
        let doc = backend.document("messages", "m1").unwrap();
        assert_eq!(doc.get("seenBy"), Some(&json!(["u1", "u2"])));

        // A second call must not reach the backend.
        backend.fail_next_writes(1);
        chat.mark_seen("m1", "u2").await.unwrap();
        assert_eq!(
            chat.messages("c1")[0].seen_by,
            BTreeSet::from(["u1".to_string(), "u2".to_string()])
        );

        assert!(matches!(
            chat.mark_seen("nope", "u2").await,
            Err(SyncError::MessageNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn seen_mark_during_send_reaches_server() {
        let (backend, chat) = setup();
        backend.set_create_delay(Some(Duration::from_millis(500)));

        let (sent, ()) = tokio::join!(chat.send_message("c1", "u1", "hello"), async {
            tokio::task::yield_now().await;
            let local = chat.messages("c1")[0].clone();
            assert!(local.is_local());
            chat.mark_seen(&local.id, "u2").await.unwrap();
        });
        let sent = sent.unwrap();

        let expected = BTreeSet::from(["u1".to_string(), "u2".to_string()]);
        assert_eq!(sent.seen_by, expected);
        assert_eq!(chat.messages("c1")[0].seen_by, expected);
        let doc = backend.document("messages", &sent.id).unwrap();
        assert_eq!(doc.get("seenBy"), Some(&json!(["u1", "u2"])));
    }

    #[tokio::test]
    async fn mark_seen_follows_an_echo_reconciled_local_id() {
        let (backend, chat) = setup();
        backend.seed(stored("srv1", "c1", "u1", "hi", 0));
        let local = Message::local("c1", "u1", "hi");
        chat.state.lock().timeline("c1").upsert(local.clone());
        let mut echo = local.clone();
        echo.id = "srv1".into();
        echo.delivery_state = DeliveryState::Sent;
        chat.state.lock().absorb(echo, chat.echo_window);

        chat.mark_seen(&local.id, "u2").await.unwrap();
        let doc = backend.document("messages", "srv1").unwrap();
        assert_eq!(doc.get("seenBy"), Some(&json!(["u1", "u2"])));
    }

    #[tokio::test]
    async fn remote_events_update_the_timeline() {
        let (backend, chat) = setup();
        chat.load_history("c1").await.unwrap();
        chat.subscribe("c1").await;
        chat.subscribe("c1").await;

        let from_other = stored("r1", "c1", "u2", "yo", 0);
        backend.emit_document_event("create", &from_other);
        backend.emit_document_event("create", &from_other);
        backend.emit_document_event("create", &stored("x1", "c9", "u2", "elsewhere", 0));
        assert_eq!(chat.messages("c1").len(), 1);

        let mut seen = from_other.clone();
        seen.data.insert("seenBy".into(), json!(["u2", "u1"]));
        backend.emit_document_event("update", &seen);
        assert!(chat.messages("c1")[0].seen_by.contains("u1"));

        backend.emit_document_event("delete", &seen);
        assert!(chat.messages("c1").is_empty());

        assert!(chat.unsubscribe("c1").await);
        assert!(!chat.unsubscribe("c1").await);
        assert_eq!(backend.active_subscriptions(), 0);
    }
}
