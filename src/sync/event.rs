//! Typed change events.
//!
//! Realtime frames are parsed exactly once, here, into a [`ChangeEvent`].
//! The operation comes from the trailing token of the composite event names
//! (`…documents.<id>.create`); frames whose operation cannot be classified
//! are rejected with [`UnrecognizedFrame`] and never reach the cache.

use crate::backend::{Document, RealtimeFrame};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Classify a composite event name by its trailing `.<operation>` token.
    pub fn from_event_name(name: &str) -> Option<Self> {
        let (_, suffix) = name.rsplit_once('.')?;
        match suffix {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized server push.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub collection: String,
    pub document_id: String,
    /// Full document as the server sent it (for deletes: the last state).
    pub payload: Document,
}

impl ChangeEvent {
    pub fn new(operation: ChangeOperation, payload: Document) -> Self {
        Self {
            operation,
            collection: payload.collection.clone(),
            document_id: payload.id.clone(),
            payload,
        }
    }

    /// Parse a raw realtime frame.
    pub fn from_frame(frame: &RealtimeFrame) -> Result<Self, UnrecognizedFrame> {
        let mut operations = frame
            .events
            .iter()
            .filter_map(|name| ChangeOperation::from_event_name(name));
        let operation = operations
            .next()
            .ok_or_else(|| UnrecognizedFrame::NoOperation(frame.events.clone()))?;
        if let Some(other) = operations.find(|op| *op != operation) {
            return Err(UnrecognizedFrame::ConflictingOperations(operation, other));
        }

        let payload: Document = serde_json::from_value(frame.payload.clone())
            .map_err(|e| UnrecognizedFrame::BadPayload(e.to_string()))?;

        Ok(Self::new(operation, payload))
    }
}

/// Why a realtime frame was dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnrecognizedFrame {
    #[error("no create/update/delete suffix in events {0:?}")]
    NoOperation(Vec<String>),
    #[error("frame mixes operations {0} and {1}")]
    ConflictingOperations(ChangeOperation, ChangeOperation),
    #[error("payload is not a document: {0}")]
    BadPayload(String),
}
