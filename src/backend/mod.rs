//! Contract with the remote document service.
//!
//! The sync core only talks to the server through [`Backend`]. Two
//! implementations ship with the crate:
//!
//! - [`InMemoryBackend`]: in-process store that publishes realtime frames;
//!   used by tests and offline builds.
//! - [`AppwriteBackend`]: REST + websocket client for an Appwrite-compatible
//!   server.

pub mod appwrite;
pub mod channel;
pub mod memory;

pub use appwrite::AppwriteBackend;
pub use channel::ChannelPath;
pub use memory::InMemoryBackend;

use crate::error::BackendError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Document id that asks the server to assign a fresh id on create.
pub const UNIQUE_ID: &str = "unique()";

pub type BackendResult<T> = std::result::Result<T, BackendError>;

// ── Documents ────────────────────────────────────────────────────

/// A stored document: system attributes plus free-form data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "$id")]
    pub id: String,
    #[serde(rename = "$collectionId")]
    pub collection: String,
    #[serde(rename = "$createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "$updatedAt")]
    pub updated_at: DateTime<Utc>,
    /// User attributes (and any system attributes we do not model).
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Document {
    pub fn new(collection: impl Into<String>, id: impl Into<String>, data: Map<String, Value>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            collection: collection.into(),
            created_at: now,
            updated_at: now,
            data,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.data.get(field).and_then(Value::as_str)
    }
}

// ── Query filters ────────────────────────────────────────────────

/// A single list query clause.
///
/// Predicates (`Equal`, `NotEqual`, `LessThan`, `GreaterThan`) restrict which
/// documents belong to a listing; `OrderAsc`, `OrderDesc` and `Limit` only
/// shape the server response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum Filter {
    Equal { attribute: String, value: Value },
    NotEqual { attribute: String, value: Value },
    LessThan { attribute: String, value: Value },
    GreaterThan { attribute: String, value: Value },
    OrderAsc { attribute: String },
    OrderDesc { attribute: String },
    Limit { value: usize },
}

impl Filter {
    pub fn equal(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Equal {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    pub fn order_desc(attribute: impl Into<String>) -> Self {
        Self::OrderDesc {
            attribute: attribute.into(),
        }
    }

    pub fn limit(value: usize) -> Self {
        Self::Limit { value }
    }

    /// Canonical, order-independent text form of this clause.
    pub fn signature(&self) -> String {
        match self {
            Self::Equal { attribute, value } => format!("{attribute}=={value}"),
            Self::NotEqual { attribute, value } => format!("{attribute}!={value}"),
            Self::LessThan { attribute, value } => format!("{attribute}<{value}"),
            Self::GreaterThan { attribute, value } => format!("{attribute}>{value}"),
            Self::OrderAsc { attribute } => format!("^{attribute}"),
            Self::OrderDesc { attribute } => format!("v{attribute}"),
            Self::Limit { value } => format!("#{value}"),
        }
    }

    /// Whether `doc` satisfies this clause. Non-predicate clauses always match.
    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Self::Equal { attribute, value } => field(doc, attribute) == Some(value.clone()),
            Self::NotEqual { attribute, value } => field(doc, attribute) != Some(value.clone()),
            Self::LessThan { attribute, value } => {
                compare(field(doc, attribute).as_ref(), value) == Some(std::cmp::Ordering::Less)
            }
            Self::GreaterThan { attribute, value } => {
                compare(field(doc, attribute).as_ref(), value)
                    == Some(std::cmp::Ordering::Greater)
            }
            Self::OrderAsc { .. } | Self::OrderDesc { .. } | Self::Limit { .. } => true,
        }
    }
}

/// Resolve an attribute, including the `$id`/`$createdAt` system fields.
pub(crate) fn field(doc: &Document, attribute: &str) -> Option<Value> {
    match attribute {
        "$id" => Some(Value::String(doc.id.clone())),
        "$collectionId" => Some(Value::String(doc.collection.clone())),
        "$createdAt" => Some(Value::String(doc.created_at.to_rfc3339())),
        "$updatedAt" => Some(Value::String(doc.updated_at.to_rfc3339())),
        other => doc.data.get(other).cloned(),
    }
}

pub(crate) fn compare(left: Option<&Value>, right: &Value) -> Option<std::cmp::Ordering> {
    match (left?, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

// ── Auth ─────────────────────────────────────────────────────────

/// Email/password credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Account email
    pub email: String,
    /// Plain password; only sent to the session endpoint
    pub password: String,
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    #[serde(rename = "$id")]
    pub id: String,
    #[serde(rename = "userId")]
    pub user_id: String,
    #[serde(rename = "expire")]
    pub expires_at: DateTime<Utc>,
    /// Session secret, when the server hands one out (server-side SDK flows).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

// ── Realtime ─────────────────────────────────────────────────────

/// One frame pushed by the realtime channel, untouched.
///
/// `events` carries composite names such as
/// `databases.db.collections.messages.documents.m1.create`; conversion into a
/// typed change happens in [`crate::sync::event`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeFrame {
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<Value>,
    #[serde(default)]
    pub payload: Value,
}

/// Callback invoked for every frame delivered on a channel.
pub type FrameCallback = Arc<dyn Fn(RealtimeFrame) + Send + Sync>;

/// Callback invoked once when a channel's transport ends on its own.
pub type ClosedCallback = Arc<dyn Fn(BackendError) + Send + Sync>;

/// What a channel subscription reports into.
#[derive(Clone)]
pub struct ChannelHandler {
    /// Every frame delivered on the channel, in arrival order.
    pub on_frame: FrameCallback,
    /// The socket errored or was closed by the server. Not called after
    /// [`ChannelSubscription::unsubscribe`].
    pub on_closed: ClosedCallback,
}

impl ChannelHandler {
    pub fn new(on_frame: FrameCallback, on_closed: ClosedCallback) -> Self {
        Self { on_frame, on_closed }
    }

    /// Handler that ignores transport loss.
    pub fn frames_only(on_frame: FrameCallback) -> Self {
        Self::new(on_frame, Arc::new(|_: BackendError| {}))
    }
}

/// An open channel subscription. Dropping it without calling
/// [`unsubscribe`](ChannelSubscription::unsubscribe) is allowed but may leave
/// server-side resources open until the connection closes.
pub trait ChannelSubscription: Send {
    /// Channel this subscription listens on.
    fn channel(&self) -> &ChannelPath;

    /// Tear down the subscription.
    fn unsubscribe(self: Box<Self>) -> BackendResult<()>;
}

// ── Backend trait ────────────────────────────────────────────────

/// The remote document database + realtime event bus.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    async fn authenticate(&self, credentials: &Credentials) -> BackendResult<Session>;

    /// Lightweight liveness ping.
    async fn ping(&self) -> BackendResult<()>;

    async fn get_document(&self, collection: &str, id: &str) -> BackendResult<Document>;

    async fn list_documents(&self, collection: &str, filters: &[Filter])
        -> BackendResult<Vec<Document>>;

    /// Create a document. Pass [`UNIQUE_ID`] to let the server pick the id.
    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> BackendResult<Document>;

    /// Merge `patch` into an existing document.
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> BackendResult<Document>;

    async fn delete_document(&self, collection: &str, id: &str) -> BackendResult<()>;

    /// Open a realtime subscription on `channel`.
    async fn subscribe(
        &self,
        channel: &ChannelPath,
        handler: ChannelHandler,
    ) -> BackendResult<Box<dyn ChannelSubscription>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(data: Value) -> Document {
        let Value::Object(map) = data else {
            panic!("object expected")
        };
        Document::new("messages", "m1", map)
    }

    #[test]
    fn document_deserializes_system_fields() {
        let raw = json!({
            "$id": "m1",
            "$collectionId": "messages",
            "$databaseId": "db",
            "$createdAt": "2024-05-01T10:00:00.000+00:00",
            "$updatedAt": "2024-05-01T10:00:01.000+00:00",
            "content": "hi"
        });
        let parsed: Document = serde_json::from_value(raw).unwrap();
        assert_eq!(parsed.id, "m1");
        assert_eq!(parsed.collection, "messages");
        assert_eq!(parsed.get_str("content"), Some("hi"));
        assert_eq!(parsed.get_str("$databaseId"), Some("db"));
    }

    #[test]
    fn equal_filter_matches_field() {
        let d = doc(json!({"chatId": "c1"}));
        assert!(Filter::equal("chatId", "c1").matches(&d));
        assert!(!Filter::equal("chatId", "c2").matches(&d));
        assert!(Filter::limit(10).matches(&d));
    }

    #[test]
    fn range_filters_compare_numbers() {
        let d = doc(json!({"priority": 5}));
        let gt = Filter::GreaterThan {
            attribute: "priority".into(),
            value: json!(3),
        };
        let lt = Filter::LessThan {
            attribute: "priority".into(),
            value: json!(3),
        };
        assert!(gt.matches(&d));
        assert!(!lt.matches(&d));
    }

    #[test]
    fn filter_serializes_as_query_json() {
        let json = serde_json::to_string(&Filter::equal("chatId", "c1")).unwrap();
        assert_eq!(json, r#"{"method":"equal","attribute":"chatId","value":"c1"}"#);
    }
}
