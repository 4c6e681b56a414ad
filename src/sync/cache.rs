//! In-memory read cache of query results.
//!
//! Entries are addressed by [`CacheKey`] (collection + optional document id +
//! canonical filter signature) and hold a [`CacheValue`]: a document listing,
//! a single document, or the "not found" sentinel.
//!
//! ## Guarantees
//! - Values are immutable once published. A patch builds a new value and
//!   swaps the `Arc`, so a reader never sees a half-applied change.
//! - Only one fetch per key is in flight; concurrent `fetch_or_get` calls
//!   join it instead of calling the backend again.
//! - Patches that arrive while a fetch is in flight are queued and replayed
//!   onto the fetched value, so a slow fetch cannot erase a newer event.
//! - Subscriber counts live in a ledger next to the entries. `clear()` drops
//!   every cached value but not the ledger, which belongs to the live query
//!   registry's channel bookkeeping.

use crate::backend::{BackendResult, Document, Filter};
use crate::error::{SyncError, SyncResult};
use crate::sync::event::{ChangeEvent, ChangeOperation};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Capacity of the change-notification channel.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

// ── Keys ────────────────────────────────────────────────────────

/// Cache address: `(collection, document id?, filter signature?)`.
///
/// Filters are stored in canonical order, so two keys built from the same
/// clauses in a different order are equal.
#[derive(Debug, Clone)]
pub struct CacheKey {
    collection: String,
    document_id: Option<String>,
    filters: Vec<Filter>,
    signature: Option<String>,
}

impl CacheKey {
    /// Key for a single document.
    pub fn document(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document_id: Some(id.into()),
            filters: Vec::new(),
            signature: None,
        }
    }

    /// Key for a (possibly filtered) collection listing.
    pub fn list(collection: impl Into<String>, filters: Vec<Filter>) -> Self {
        let mut keyed: Vec<(String, Filter)> =
            filters.into_iter().map(|f| (f.signature(), f)).collect();
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.dedup_by(|a, b| a.0 == b.0);

        let signature = if keyed.is_empty() {
            None
        } else {
            Some(
                keyed
                    .iter()
                    .map(|(sig, _)| sig.as_str())
                    .collect::<Vec<_>>()
                    .join("&"),
            )
        };

        Self {
            collection: collection.into(),
            document_id: None,
            filters: keyed.into_iter().map(|(_, f)| f).collect(),
            signature,
        }
    }

    /// Collection id the key reads from.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Set for single-document keys.
    pub fn document_id(&self) -> Option<&str> {
        self.document_id.as_deref()
    }

    /// Listing filters in canonical order.
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    /// Canonical filter string; `None` when there are no filters.
    pub fn filter_signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// True for filtered listings, false for single documents.
    pub fn is_listing(&self) -> bool {
        self.document_id.is_none()
    }

    /// Whether `doc` belongs to this key's result set.
    pub fn matches(&self, doc: &Document) -> bool {
        if doc.collection != self.collection {
            return false;
        }
        match &self.document_id {
            Some(id) => &doc.id == id,
            None => self.filters.iter().all(|f| f.matches(doc)),
        }
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.collection == other.collection
            && self.document_id == other.document_id
            && self.signature == other.signature
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.collection.hash(state);
        self.document_id.hash(state);
        self.signature.hash(state);
    }
}

/// `<collection>:<documentId|*>:<filterSignature|->`
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.collection,
            self.document_id.as_deref().unwrap_or("*"),
            self.signature.as_deref().unwrap_or("-")
        )
    }
}

// ── Values ──────────────────────────────────────────────────────

/// A cached query result.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheValue {
    List(Vec<Document>),
    Document(Document),
    /// A point lookup that resolved to "no such document".
    NotFound,
}

impl CacheValue {
    /// Listed documents, or the single document as a one-element slice.
    pub fn documents(&self) -> &[Document] {
        match self {
            Self::List(docs) => docs,
            Self::Document(doc) => std::slice::from_ref(doc),
            Self::NotFound => &[],
        }
    }

    pub fn document(&self) -> Option<&Document> {
        match self {
            Self::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Read-only snapshot of an entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Arc<CacheValue>,
    /// Last store or applied change; the sweep ages entries from here.
    pub last_updated_at: Instant,
    /// Live listeners attached to the key. Entries with listeners are never swept.
    pub subscriber_count: usize,
}

/// Apply one change to a value. `None` means the event does not affect it.
fn apply_event(key: &CacheKey, value: &CacheValue, event: &ChangeEvent) -> Option<CacheValue> {
    if event.collection != key.collection {
        return None;
    }

    match value {
        CacheValue::List(docs) => {
            if key.document_id.is_some() {
                return None;
            }
            let position = docs.iter().position(|d| d.id == event.document_id);
            match (event.operation, position) {
                (ChangeOperation::Create, None) if key.matches(&event.payload) => {
                    let mut next = docs.clone();
                    next.push(event.payload.clone());
                    Some(CacheValue::List(next))
                }
                (ChangeOperation::Create, _) => None,
                (ChangeOperation::Update, Some(i)) => {
                    let mut next = docs.clone();
                    if key.matches(&event.payload) {
                        next[i] = event.payload.clone();
                    } else {
                        next.remove(i);
                    }
                    Some(CacheValue::List(next))
                }
                (ChangeOperation::Update, None) => None,
                (ChangeOperation::Delete, Some(i)) => {
                    let mut next = docs.clone();
                    next.remove(i);
                    Some(CacheValue::List(next))
                }
                (ChangeOperation::Delete, None) => None,
            }
        }
        CacheValue::Document(_) | CacheValue::NotFound => {
            if key.document_id.as_deref() != Some(event.document_id.as_str()) {
                return None;
            }
            match event.operation {
                ChangeOperation::Create | ChangeOperation::Update => {
                    Some(CacheValue::Document(event.payload.clone()))
                }
                ChangeOperation::Delete => Some(CacheValue::NotFound),
            }
        }
    }
}

// ── Store ───────────────────────────────────────────────────────

type SharedFetch = Shared<BoxFuture<'static, SyncResult<Arc<CacheValue>>>>;

struct StoredEntry {
    value: Arc<CacheValue>,
    last_updated_at: Instant,
}

struct InFlight {
    id: u64,
    fetch: SharedFetch,
    /// Events received while the fetch is outstanding, in arrival order.
    queued: Vec<ChangeEvent>,
}

#[derive(Default)]
struct State {
    entries: HashMap<CacheKey, StoredEntry>,
    in_flight: HashMap<CacheKey, InFlight>,
    subscribers: HashMap<CacheKey, usize>,
    next_fetch_id: u64,
}

/// Process-wide query cache. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheStore {
    state: Arc<Mutex<State>>,
    stale_after: Duration,
    changes: broadcast::Sender<CacheKey>,
}

impl CacheStore {
    pub fn new(stale_after: Duration) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            stale_after,
            changes,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Receive the key of every entry whose value changed.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CacheKey> {
        self.changes.subscribe()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        let state = self.state.lock();
        state.entries.get(key).map(|entry| CacheEntry {
            key: key.clone(),
            value: Arc::clone(&entry.value),
            last_updated_at: entry.last_updated_at,
            subscriber_count: state.subscribers.get(key).copied().unwrap_or(0),
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscriber_count(&self, key: &CacheKey) -> usize {
        self.state.lock().subscribers.get(key).copied().unwrap_or(0)
    }

    /// Cached value if fresh, otherwise fetch (or join the in-flight fetch).
    ///
    /// A `NotFound` backend error on a point key is cached as
    /// [`CacheValue::NotFound`]; any other fetch error is returned and
    /// nothing is stored.
    pub async fn fetch_or_get<F, Fut>(&self, key: &CacheKey, fetcher: F) -> SyncResult<Arc<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<CacheValue>> + Send + 'static,
    {
        let fetch = {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get(key) {
                if entry.last_updated_at.elapsed() < self.stale_after {
                    tracing::trace!(%key, "Cache hit");
                    return Ok(Arc::clone(&entry.value));
                }
                tracing::debug!(%key, "Cache entry stale, refetching");
            }
            self.join_or_start(&mut state, key, fetcher)
        };
        fetch.await
    }

    /// Fetch regardless of freshness (still joins an in-flight fetch).
    pub async fn refresh<F, Fut>(&self, key: &CacheKey, fetcher: F) -> SyncResult<Arc<CacheValue>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<CacheValue>> + Send + 'static,
    {
        let fetch = {
            let mut state = self.state.lock();
            self.join_or_start(&mut state, key, fetcher)
        };
        fetch.await
    }

    fn join_or_start<F, Fut>(&self, state: &mut State, key: &CacheKey, fetcher: F) -> SharedFetch
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = BackendResult<CacheValue>> + Send + 'static,
    {
        if let Some(in_flight) = state.in_flight.get(key) {
            tracing::trace!(%key, "Joining in-flight fetch");
            return in_flight.fetch.clone();
        }

        let id = state.next_fetch_id;
        state.next_fetch_id += 1;

        let store = self.clone();
        let fetch_key = key.clone();
        let request = fetcher();
        let fetch = async move {
            let result = request.await;
            store.complete_fetch(&fetch_key, id, result)
        }
        .boxed()
        .shared();

        state.in_flight.insert(
            key.clone(),
            InFlight {
                id,
                fetch: fetch.clone(),
                queued: Vec::new(),
            },
        );
        fetch
    }

    fn complete_fetch(
        &self,
        key: &CacheKey,
        id: u64,
        result: BackendResult<CacheValue>,
    ) -> SyncResult<Arc<CacheValue>> {
        let mut state = self.state.lock();
        // A clear() or newer fetch may have superseded this one; the result
        // still goes to the waiters but is not stored.
        let queued = match state.in_flight.get(key) {
            Some(in_flight) if in_flight.id == id => state
                .in_flight
                .remove(key)
                .map(|f| f.queued)
                .unwrap_or_default(),
            _ => {
                drop(state);
                return match result {
                    Ok(value) => Ok(Arc::new(value)),
                    Err(e) if e.is_not_found() && !key.is_listing() => {
                        Ok(Arc::new(CacheValue::NotFound))
                    }
                    Err(e) => Err(SyncError::Fetch(e)),
                };
            }
        };

        let mut value = match result {
            Ok(value) => value,
            Err(e) if e.is_not_found() && !key.is_listing() => CacheValue::NotFound,
            Err(e) => {
                tracing::warn!(%key, dropped_events = queued.len(), "Fetch failed: {e}");
                return Err(SyncError::Fetch(e));
            }
        };

        for event in &queued {
            if let Some(next) = apply_event(key, &value, event) {
                value = next;
            }
        }
        if !queued.is_empty() {
            tracing::debug!(%key, replayed = queued.len(), "Replayed events queued during fetch");
        }

        let value = Arc::new(value);
        state.entries.insert(
            key.clone(),
            StoredEntry {
                value: Arc::clone(&value),
                last_updated_at: Instant::now(),
            },
        );
        drop(state);

        let _ = self.changes.send(key.clone());
        Ok(value)
    }

    /// Apply a change event to the entry at `key`.
    ///
    /// Returns whether the cached value changed. Events for keys without an
    /// entry are dropped; events for keys with a fetch in flight are also
    /// queued for replay onto the fetched value.
    pub fn patch(&self, key: &CacheKey, event: &ChangeEvent) -> bool {
        let mut state = self.state.lock();
        if let Some(in_flight) = state.in_flight.get_mut(key) {
            in_flight.queued.push(event.clone());
        }

        let applied = match state.entries.get_mut(key) {
            Some(entry) => match apply_event(key, &entry.value, event) {
                Some(next) => {
                    entry.value = Arc::new(next);
                    entry.last_updated_at = Instant::now();
                    true
                }
                None => false,
            },
            None => false,
        };
        drop(state);

        if applied {
            tracing::trace!(%key, op = %event.operation, id = %event.document_id, "Patched cache entry");
            let _ = self.changes.send(key.clone());
        }
        applied
    }

    pub fn evict(&self, key: &CacheKey) -> bool {
        self.state.lock().entries.remove(key).is_some()
    }

    /// Remove entries older than `max_age` that nobody is subscribed to.
    pub fn evict_stale(&self, max_age: Duration) -> usize {
        let mut state = self.state.lock();
        let State {
            entries,
            subscribers,
            ..
        } = &mut *state;

        let before = entries.len();
        entries.retain(|key, entry| {
            entry.last_updated_at.elapsed() <= max_age
                || subscribers.get(key).copied().unwrap_or(0) > 0
        });
        before - entries.len()
    }

    /// Drop every cached value and abandon in-flight fetches.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let dropped = state.entries.len();
        state.entries.clear();
        state.in_flight.clear();
        drop(state);
        tracing::info!(dropped, "Cache cleared");
    }

    // ── Subscriber ledger (live query registry only) ─────────

    pub(crate) fn add_subscriber(&self, key: &CacheKey) -> usize {
        let mut state = self.state.lock();
        let count = state.subscribers.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    }

    pub(crate) fn remove_subscriber(&self, key: &CacheKey) -> usize {
        let mut state = self.state.lock();
        match state.subscribers.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            Some(_) => {
                state.subscribers.remove(key);
                0
            }
            None => 0,
        }
    }
}
