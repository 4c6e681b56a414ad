//! Appwrite-compatible remote backend.
//!
//! - Document CRUD over the REST API (reqwest)
//! - Realtime channel over a websocket (tokio-tungstenite), one socket per
//!   channel subscription; a socket that dies on its own is reported through
//!   [`ChannelHandler::on_closed`]
//! - Session auth via `/account/sessions/email`; the session secret, when the
//!   server returns one, is forwarded on every request and on the socket
//!
//! ## Design
//! - Project/API-key headers on every request, session header once signed in
//! - HTTP 404 → [`BackendError::NotFound`], 401/403 → `Unauthorized`, any other
//!   non-2xx → `Rejected`, reqwest failures → `Transport`/`Timeout`

use super::{
    Backend, BackendResult, ChannelHandler, ChannelPath, ChannelSubscription, Credentials,
    Document, Filter, RealtimeFrame, Session,
};
use crate::config::AppwriteConfig;
use crate::error::BackendError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Per-request HTTP timeout.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Websocket handshake timeout.
const REALTIME_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Client heartbeat period; the server drops silent sockets.
const REALTIME_HEARTBEAT: Duration = Duration::from_secs(20);

/// Response body of a list call.
#[derive(Debug, Deserialize)]
struct DocumentList {
    #[allow(dead_code)]
    total: u64,
    documents: Vec<Document>,
}

/// REST + realtime client.
pub struct AppwriteBackend {
    config: AppwriteConfig,
    database_id: String,
    http: reqwest::Client,
    session_secret: Mutex<Option<String>>,
}

impl AppwriteBackend {
    pub fn new(config: AppwriteConfig, database_id: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            config,
            database_id: database_id.into(),
            http,
            session_secret: Mutex::new(None),
        })
    }

    /// Use an existing session secret (e.g. restored from secure storage).
    pub fn with_session_secret(self, secret: impl Into<String>) -> Self {
        *self.session_secret.lock() = Some(secret.into());
        self
    }

    fn endpoint(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    /// Build the REST URL for a collection's documents.
    fn documents_url(&self, collection: &str) -> String {
        format!(
            "{}/databases/{}/collections/{}/documents",
            self.endpoint(),
            self.database_id,
            collection
        )
    }

    fn document_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.documents_url(collection), id)
    }

    /// Build the realtime websocket URL for one channel.
    fn realtime_url(&self, channel: &ChannelPath) -> String {
        let endpoint = self.endpoint();
        let ws_endpoint = if let Some(rest) = endpoint.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = endpoint.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            endpoint.to_string()
        };
        format!(
            "{}/realtime?project={}&channels%5B%5D={}",
            ws_endpoint,
            urlencoding::encode(&self.config.project_id),
            urlencoding::encode(&channel.to_string())
        )
    }

    /// Get the base headers for authenticated requests.
    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![("X-Appwrite-Project", self.config.project_id.clone())];
        if let Some(key) = &self.config.api_key {
            headers.push(("X-Appwrite-Key", key.clone()));
        }
        if let Some(secret) = self.session_secret.lock().clone() {
            headers.push(("X-Appwrite-Session", secret));
        }
        headers
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut request = self.http.request(method, url);
        for (key, value) in self.auth_headers() {
            request = request.header(key, value);
        }
        request
    }

    /// Send a request and map failure statuses onto [`BackendError`].
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        not_found: Option<(&str, &str)>,
    ) -> BackendResult<reqwest::Response> {
        let resp = request.send().await.map_err(transport_error)?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
            .unwrap_or(body);

        Err(match status.as_u16() {
            404 => match not_found {
                Some((collection, id)) => BackendError::not_found(collection, id),
                None => BackendError::Rejected {
                    status: 404,
                    message,
                },
            },
            401 | 403 => BackendError::Unauthorized(message),
            code => BackendError::Rejected {
                status: code,
                message,
            },
        })
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout(HTTP_TIMEOUT)
    } else if err.is_decode() {
        BackendError::Protocol(err.to_string())
    } else {
        BackendError::Transport(err.to_string())
    }
}

/// Convert a [`Filter`] into the server's JSON query string.
fn query_string(filter: &Filter) -> String {
    let query = match filter {
        Filter::Equal { attribute, value } => {
            json!({"method": "equal", "attribute": attribute, "values": [value]})
        }
        Filter::NotEqual { attribute, value } => {
            json!({"method": "notEqual", "attribute": attribute, "values": [value]})
        }
        Filter::LessThan { attribute, value } => {
            json!({"method": "lessThan", "attribute": attribute, "values": [value]})
        }
        Filter::GreaterThan { attribute, value } => {
            json!({"method": "greaterThan", "attribute": attribute, "values": [value]})
        }
        Filter::OrderAsc { attribute } => json!({"method": "orderAsc", "attribute": attribute}),
        Filter::OrderDesc { attribute } => json!({"method": "orderDesc", "attribute": attribute}),
        Filter::Limit { value } => json!({"method": "limit", "values": [value]}),
    };
    query.to_string()
}

/// Extract the event frame from a realtime socket message.
///
/// Returns `None` for non-event traffic (`connected`, `response`, `error`).
fn parse_realtime_message(text: &str) -> Option<RealtimeFrame> {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!("Realtime: failed to parse message: {e}");
            return None;
        }
    };
    match value.get("type").and_then(Value::as_str) {
        Some("event") => {
            let data = value.get("data").cloned().unwrap_or(Value::Null);
            match serde_json::from_value(data) {
                Ok(frame) => Some(frame),
                Err(e) => {
                    tracing::warn!("Realtime: malformed event frame: {e}");
                    None
                }
            }
        }
        Some("error") => {
            tracing::warn!(message = %value, "Realtime: server reported error");
            None
        }
        other => {
            tracing::trace!(kind = ?other, "Realtime: ignoring non-event message");
            None
        }
    }
}

/// A realtime socket owned by a background task.
struct SocketSubscription {
    channel: ChannelPath,
    task: JoinHandle<()>,
}

impl ChannelSubscription for SocketSubscription {
    fn channel(&self) -> &ChannelPath {
        &self.channel
    }

    fn unsubscribe(self: Box<Self>) -> BackendResult<()> {
        self.task.abort();
        tracing::debug!(channel = %self.channel, "Closed realtime socket");
        Ok(())
    }
}

#[async_trait]
impl Backend for AppwriteBackend {
    fn name(&self) -> &str {
        "appwrite"
    }

    async fn authenticate(&self, credentials: &Credentials) -> BackendResult<Session> {
        let url = format!("{}/account/sessions/email", self.endpoint());
        let request = self.request(reqwest::Method::POST, &url).json(&json!({
            "email": credentials.email,
            "password": credentials.password,
        }));
        let resp = self.send(request, None).await?;
        let session: Session = resp.json().await.map_err(transport_error)?;

        if let Some(secret) = session.secret.as_ref().filter(|s| !s.is_empty()) {
            *self.session_secret.lock() = Some(secret.clone());
        }
        tracing::info!(user_id = %session.user_id, "Authenticated session");
        Ok(session)
    }

    async fn ping(&self) -> BackendResult<()> {
        let url = format!("{}/health/version", self.endpoint());
        self.send(self.request(reqwest::Method::GET, &url), None)
            .await
            .map(|_| ())
    }

    async fn get_document(&self, collection: &str, id: &str) -> BackendResult<Document> {
        let request = self.request(reqwest::Method::GET, &self.document_url(collection, id));
        let resp = self.send(request, Some((collection, id))).await?;
        resp.json().await.map_err(transport_error)
    }

    async fn list_documents(
        &self,
        collection: &str,
        filters: &[Filter],
    ) -> BackendResult<Vec<Document>> {
        let queries: Vec<(&str, String)> = filters
            .iter()
            .map(|f| ("queries[]", query_string(f)))
            .collect();
        let request = self
            .request(reqwest::Method::GET, &self.documents_url(collection))
            .query(&queries);
        let resp = self.send(request, None).await?;
        let list: DocumentList = resp.json().await.map_err(transport_error)?;
        Ok(list.documents)
    }

    async fn create_document(
        &self,
        collection: &str,
        id: &str,
        data: Map<String, Value>,
    ) -> BackendResult<Document> {
        let request = self
            .request(reqwest::Method::POST, &self.documents_url(collection))
            .json(&json!({ "documentId": id, "data": data }));
        let resp = self.send(request, None).await?;
        resp.json().await.map_err(transport_error)
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> BackendResult<Document> {
        let request = self
            .request(reqwest::Method::PATCH, &self.document_url(collection, id))
            .json(&json!({ "data": patch }));
        let resp = self.send(request, Some((collection, id))).await?;
        resp.json().await.map_err(transport_error)
    }

    async fn delete_document(&self, collection: &str, id: &str) -> BackendResult<()> {
        let request = self.request(reqwest::Method::DELETE, &self.document_url(collection, id));
        self.send(request, Some((collection, id))).await.map(|_| ())
    }

    async fn subscribe(
        &self,
        channel: &ChannelPath,
        handler: ChannelHandler,
    ) -> BackendResult<Box<dyn ChannelSubscription>> {
        let url = self.realtime_url(channel);
        let (ws_stream, _response) =
            tokio::time::timeout(REALTIME_CONNECT_TIMEOUT, tokio_tungstenite::connect_async(&url))
                .await
                .map_err(|_| BackendError::Timeout(REALTIME_CONNECT_TIMEOUT))?
                .map_err(|e| BackendError::Transport(format!("Realtime connect failed: {e}")))?;

        let (mut sink, mut stream) = ws_stream.split();

        let secret = self.session_secret.lock().clone();
        if let Some(secret) = secret {
            let auth = json!({"type": "authentication", "data": {"session": secret}});
            sink.send(WsMessage::Text(auth.to_string().into()))
                .await
                .map_err(|e| BackendError::Transport(format!("Realtime auth failed: {e}")))?;
        }

        let channel_name = channel.to_string();
        let task = tokio::spawn(async move {
            let mut heartbeat = tokio::time::interval(REALTIME_HEARTBEAT);
            heartbeat.tick().await;
            let reason = loop {
                tokio::select! {
                    _ = heartbeat.tick() => {
                        let ping = json!({"type": "ping"}).to_string();
                        if let Err(e) = sink.send(WsMessage::Text(ping.into())).await {
                            break format!("heartbeat failed: {e}");
                        }
                    }
                    msg = stream.next() => match msg {
                        Some(Ok(WsMessage::Text(text))) => {
                            if let Some(frame) = parse_realtime_message(text.as_str()) {
                                (handler.on_frame)(frame);
                            }
                        }
                        Some(Ok(WsMessage::Close(frame))) => {
                            break format!("closed by server: {frame:?}");
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break format!("socket error: {e}"),
                        None => break "stream ended".to_string(),
                    }
                }
            };
            tracing::warn!(channel = %channel_name, "Realtime socket lost: {reason}");
            (handler.on_closed)(BackendError::Transport(format!("realtime {reason}")));
        });

        tracing::debug!(%channel, "Opened realtime socket");
        Ok(Box::new(SocketSubscription {
            channel: channel.clone(),
            task,
        }))
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::UNIQUE_ID;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(endpoint: &str) -> AppwriteConfig {
        AppwriteConfig {
            endpoint: endpoint.into(),
            project_id: "proj".into(),
            api_key: Some("secret-key".into()),
        }
    }

    fn doc_json(id: &str) -> Value {
        json!({
            "$id": id,
            "$collectionId": "messages",
            "$databaseId": "db",
            "$createdAt": "2024-05-01T10:00:00.000+00:00",
            "$updatedAt": "2024-05-01T10:00:00.000+00:00",
            "content": "hello"
        })
    }

    #[test]
    fn documents_url_construction() {
        let backend = AppwriteBackend::new(test_config("https://cloud.example.com/v1/"), "db").unwrap();
        assert_eq!(
            backend.document_url("messages", "m1"),
            "https://cloud.example.com/v1/databases/db/collections/messages/documents/m1"
        );
    }

    #[test]
    fn realtime_url_uses_websocket_scheme() {
        let backend = AppwriteBackend::new(test_config("https://cloud.example.com/v1"), "db").unwrap();
        let url = backend.realtime_url(&ChannelPath::collection("db", "messages"));
        assert!(url.starts_with("wss://cloud.example.com/v1/realtime?project=proj"));
        assert!(url.ends_with("databases.db.collections.messages.documents"));
    }

    #[test]
    fn auth_headers_contain_project_and_key() {
        let backend = AppwriteBackend::new(test_config("https://x/v1"), "db").unwrap();
        let headers = backend.auth_headers();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0], ("X-Appwrite-Project", "proj".to_string()));
        assert_eq!(headers[1].0, "X-Appwrite-Key");

        let backend = backend.with_session_secret("s3cret");
        assert_eq!(backend.auth_headers().len(), 3);
    }

    #[test]
    fn query_strings_match_server_format() {
        let equal: Value = serde_json::from_str(&query_string(&Filter::equal("chatId", "c1"))).unwrap();
        assert_eq!(
            equal,
            json!({"method": "equal", "attribute": "chatId", "values": ["c1"]})
        );
        let limit: Value = serde_json::from_str(&query_string(&Filter::limit(50))).unwrap();
        assert_eq!(limit, json!({"method": "limit", "values": [50]}));
    }

    #[test]
    fn realtime_event_message_parses() {
        let msg = json!({
            "type": "event",
            "data": {
                "events": ["databases.db.collections.messages.documents.m1.create"],
                "channels": ["databases.db.collections.messages.documents"],
                "timestamp": "2024-05-01 10:00:00.000",
                "payload": doc_json("m1")
            }
        });
        let frame = parse_realtime_message(&msg.to_string()).unwrap();
        assert_eq!(frame.events.len(), 1);
        assert_eq!(frame.payload["$id"], "m1");
    }

    #[test]
    fn realtime_non_event_messages_ignored() {
        assert!(parse_realtime_message(r#"{"type":"connected","data":{}}"#).is_none());
        assert!(parse_realtime_message(r#"{"type":"response","data":{"to":"ping"}}"#).is_none());
        assert!(parse_realtime_message("not json").is_none());
    }

    #[tokio::test]
    async fn get_document_maps_404_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/databases/db/collections/messages/documents/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"message": "Document not found"})),
            )
            .mount(&server)
            .await;

        let backend = AppwriteBackend::new(test_config(&format!("{}/v1", server.uri())), "db").unwrap();
        let err = backend.get_document("messages", "missing").await.unwrap_err();
        assert_eq!(err, BackendError::not_found("messages", "missing"));
    }

    #[tokio::test]
    async fn list_documents_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/databases/db/collections/messages/documents"))
            .and(header("X-Appwrite-Project", "proj"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "total": 2,
                "documents": [doc_json("m1"), doc_json("m2")]
            })))
            .mount(&server)
            .await;

        let backend = AppwriteBackend::new(test_config(&format!("{}/v1", server.uri())), "db").unwrap();
        let docs = backend
            .list_documents("messages", &[Filter::equal("chatId", "c1")])
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[1].id, "m2");
    }

    #[tokio::test]
    async fn create_document_sends_id_and_data() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/databases/db/collections/messages/documents"))
            .and(body_partial_json(json!({"documentId": "unique()"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(doc_json("server-id")))
            .mount(&server)
            .await;

        let backend = AppwriteBackend::new(test_config(&format!("{}/v1", server.uri())), "db").unwrap();
        let mut data = Map::new();
        data.insert("content".into(), json!("hello"));
        let doc = backend
            .create_document("messages", UNIQUE_ID, data)
            .await
            .unwrap();
        assert_eq!(doc.id, "server-id");
    }

    #[tokio::test]
    async fn rejected_write_carries_server_message() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/v1/databases/db/collections/messages/documents/m1"))
            .respond_with(
                ResponseTemplate::new(400).set_body_json(json!({"message": "Invalid document structure"})),
            )
            .mount(&server)
            .await;

        let backend = AppwriteBackend::new(test_config(&format!("{}/v1", server.uri())), "db").unwrap();
        let err = backend
            .update_document("messages", "m1", Map::new())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BackendError::Rejected {
                status: 400,
                message: "Invalid document structure".into()
            }
        );
    }

    #[tokio::test]
    async fn ping_hits_health_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/health/version"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": "1.5.0"})))
            .mount(&server)
            .await;

        let backend = AppwriteBackend::new(test_config(&format!("{}/v1", server.uri())), "db").unwrap();
        assert!(backend.ping().await.is_ok());
    }
}
