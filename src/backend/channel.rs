//! Realtime channel paths.
//!
//! `databases.<dbId>.collections.<collectionId>.documents[.<documentId>]`.
//! A trailing document id scopes the channel to one document, otherwise it
//! covers the whole collection.

use crate::error::SyncError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelPath {
    pub database_id: String,
    pub collection_id: String,
    pub document_id: Option<String>,
}

impl ChannelPath {
    /// Channel covering every document of a collection.
    pub fn collection(database_id: impl Into<String>, collection_id: impl Into<String>) -> Self {
        Self {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            document_id: None,
        }
    }

    /// Channel scoped to a single document.
    pub fn document(
        database_id: impl Into<String>,
        collection_id: impl Into<String>,
        document_id: impl Into<String>,
    ) -> Self {
        Self {
            database_id: database_id.into(),
            collection_id: collection_id.into(),
            document_id: Some(document_id.into()),
        }
    }

    pub fn is_document_scoped(&self) -> bool {
        self.document_id.is_some()
    }

    /// Whether a change to `collection`/`document_id` is delivered on this channel.
    pub fn covers(&self, collection: &str, document_id: &str) -> bool {
        self.collection_id == collection
            && self
                .document_id
                .as_deref()
                .is_none_or(|id| id == document_id)
    }
}

impl fmt::Display for ChannelPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "databases.{}.collections.{}.documents",
            self.database_id, self.collection_id
        )?;
        if let Some(id) = &self.document_id {
            write!(f, ".{id}")?;
        }
        Ok(())
    }
}

impl FromStr for ChannelPath {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('.').collect();
        let invalid = || SyncError::InvalidChannelPath(s.to_string());

        match parts.as_slice() {
            ["databases", db, "collections", col, "documents", rest @ ..] => {
                if db.is_empty() || col.is_empty() {
                    return Err(invalid());
                }
                let document_id = match rest {
                    [] => None,
                    [id] if !id.is_empty() => Some((*id).to_string()),
                    _ => return Err(invalid()),
                };
                Ok(Self {
                    database_id: (*db).to_string(),
                    collection_id: (*col).to_string(),
                    document_id,
                })
            }
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_channel_format() {
        let path = ChannelPath::collection("db", "messages");
        assert_eq!(path.to_string(), "databases.db.collections.messages.documents");
        assert!(!path.is_document_scoped());
    }

    #[test]
    fn document_channel_format() {
        let path = ChannelPath::document("db", "chats", "c1");
        assert_eq!(path.to_string(), "databases.db.collections.chats.documents.c1");
    }

    #[test]
    fn parse_accepts_both_scopes() {
        let col: ChannelPath = "databases.db.collections.messages.documents".parse().unwrap();
        assert_eq!(col, ChannelPath::collection("db", "messages"));

        let doc: ChannelPath = "databases.db.collections.chats.documents.c1".parse().unwrap();
        assert_eq!(doc.document_id.as_deref(), Some("c1"));
    }

    #[test]
    fn parse_rejects_malformed_paths() {
        for bad in [
            "",
            "databases.db.collections",
            "databases..collections.x.documents",
            "databases.db.collections.x.documents.a.b",
            "files.db.collections.x.documents",
        ] {
            assert!(bad.parse::<ChannelPath>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn covers_respects_document_scope() {
        let col = ChannelPath::collection("db", "messages");
        assert!(col.covers("messages", "m1"));
        assert!(!col.covers("chats", "m1"));

        let doc = ChannelPath::document("db", "messages", "m1");
        assert!(doc.covers("messages", "m1"));
        assert!(!doc.covers("messages", "m2"));
    }
}
