//! Remote blob store protocol.
//!
//! The gateway talks to a dumb object store: idempotent PUT at
//! `messages/{id}`, GET at `messages/{id}`, a per-recipient index at
//! `messages/index/{recipient}`, and idempotent DELETE for acks. Requests
//! carry a bearer credential from an opaque provider; credential storage
//! itself is someone else's problem.

use async_trait::async_trait;
use base64::Engine;
use emberlink_core::{
    Classification, CoreError, CoreResult, DeliveryState, GeoPosition, Message, MessageId,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Source of the bearer credential attached to remote requests.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Current bearer token.
    async fn bearer_token(&self) -> CoreResult<String>;
}

/// Fixed-token credential provider.
pub struct StaticCredentials {
    token: String,
}

impl StaticCredentials {
    /// Wrap a pre-issued token.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn bearer_token(&self) -> CoreResult<String> {
        Ok(self.token.clone())
    }
}

/// Remote store operations the bridge needs.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Idempotent PUT; re-uploading a stored item is harmless.
    async fn put_message(&self, message: &Message) -> CoreResult<()>;

    /// Fetch one item; `None` when it is gone (already acked elsewhere).
    async fn fetch_message(&self, id_hex: &str) -> CoreResult<Option<Message>>;

    /// Ids pending for a recipient.
    async fn list_inbox(&self, recipient: &str) -> CoreResult<Vec<String>>;

    /// Idempotent DELETE; retires an item so other gateways stop pulling it.
    async fn ack_message(&self, id_hex: &str) -> CoreResult<()>;
}

/// Wire shape of a stored message object.
#[derive(Debug, Serialize, Deserialize)]
struct RemoteObject {
    id: String,
    class: char,
    sender: String,
    recipient: String,
    payload: String,
    created_at_ms: u64,
    ttl_ms: u64,
    hop_limit: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    lat: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lon: Option<f64>,
}

impl RemoteObject {
    fn from_message(message: &Message) -> Self {
        Self {
            id: message.id.to_hex(),
            class: message.classification.wire_code(),
            sender: message.sender.clone(),
            recipient: message.recipient.clone(),
            payload: base64::engine::general_purpose::STANDARD.encode(&message.payload),
            created_at_ms: message.created_at_ms,
            ttl_ms: message.ttl_ms,
            hop_limit: message.hop_limit,
            lat: message.position.map(|p| p.lat),
            lon: message.position.map(|p| p.lon),
        }
    }

    fn into_message(self) -> CoreResult<Message> {
        let id: MessageId = self.id.parse()?;
        let classification = Classification::from_wire_code(self.class)
            .ok_or_else(|| CoreError::DecodeFailure(format!("unknown class code {}", self.class)))?;
        let payload = base64::engine::general_purpose::STANDARD
            .decode(self.payload.as_bytes())
            .map_err(|e| CoreError::DecodeFailure(format!("bad payload encoding: {e}")))?;
        let position = match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some(GeoPosition { lat, lon }),
            _ => None,
        };

        Ok(Message {
            id,
            classification,
            sender: self.sender,
            recipient: self.recipient,
            payload,
            created_at_ms: self.created_at_ms,
            ttl_ms: self.ttl_ms,
            hop_limit: self.hop_limit,
            state: DeliveryState::Received,
            attempt_count: 0,
            last_attempt_at_ms: None,
            position,
        })
    }
}

#[derive(Debug, Deserialize)]
struct InboxResponse {
    ids: Vec<String>,
}

/// HTTP implementation of the remote store protocol.
pub struct HttpRemoteStore {
    base_url: String,
    http: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpRemoteStore {
    /// Build a client against `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        request_timeout_ms: u64,
        credentials: Arc<dyn CredentialProvider>,
    ) -> CoreResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms))
            .build()
            .map_err(|e| CoreError::RemoteStore(format!("client build: {e}")))?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            credentials,
        })
    }

    fn object_url(&self, id_hex: &str) -> String {
        format!("{}/messages/{}", self.base_url, id_hex)
    }

    fn index_url(&self, recipient: &str) -> String {
        format!("{}/messages/index/{}", self.base_url, recipient)
    }

    fn map_status(status: StatusCode, label: &str) -> CoreError {
        CoreError::RemoteStore(format!("{label}: {status}"))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn put_message(&self, message: &Message) -> CoreResult<()> {
        let token = self.credentials.bearer_token().await?;
        let body = RemoteObject::from_message(message);
        let resp = self
            .http
            .put(self.object_url(&message.id.to_hex()))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::RemoteStore(format!("put: {e}")))?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Self::map_status(resp.status(), "put"))
        }
    }

    async fn fetch_message(&self, id_hex: &str) -> CoreResult<Option<Message>> {
        let token = self.credentials.bearer_token().await?;
        let resp = self
            .http
            .get(self.object_url(id_hex))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CoreError::RemoteStore(format!("get: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status(), "get"));
        }

        let object: RemoteObject = resp
            .json()
            .await
            .map_err(|e| CoreError::RemoteStore(format!("get body: {e}")))?;
        Ok(Some(object.into_message()?))
    }

    async fn list_inbox(&self, recipient: &str) -> CoreResult<Vec<String>> {
        let token = self.credentials.bearer_token().await?;
        let resp = self
            .http
            .get(self.index_url(recipient))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CoreError::RemoteStore(format!("index: {e}")))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status(), "index"));
        }

        let inbox: InboxResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::RemoteStore(format!("index body: {e}")))?;
        Ok(inbox.ids)
    }

    async fn ack_message(&self, id_hex: &str) -> CoreResult<()> {
        let token = self.credentials.bearer_token().await?;
        let resp = self
            .http
            .delete(self.object_url(id_hex))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| CoreError::RemoteStore(format!("ack: {e}")))?;

        // Deleting an already-gone item is fine, DELETE is idempotent
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::map_status(resp.status(), "ack"))
        }
    }
}

/// In-memory remote store with the same protocol semantics.
///
/// Used by the simulated-topology tests; doubles as the reference for what
/// the HTTP endpoints must do.
#[derive(Default)]
pub struct MemoryRemoteStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    objects: HashMap<String, Message>,
    index: HashMap<String, Vec<String>>,
}

impl MemoryRemoteStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).objects.len()
    }

    /// Whether the store holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn put_message(&self, message: &Message) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id_hex = message.id.to_hex();
        if inner.objects.insert(id_hex.clone(), message.clone()).is_none() {
            inner
                .index
                .entry(message.recipient.clone())
                .or_default()
                .push(id_hex);
        }
        Ok(())
    }

    async fn fetch_message(&self, id_hex: &str) -> CoreResult<Option<Message>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.objects.get(id_hex).cloned())
    }

    async fn list_inbox(&self, recipient: &str) -> CoreResult<Vec<String>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.index.get(recipient).cloned().unwrap_or_default())
    }

    async fn ack_message(&self, id_hex: &str) -> CoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.objects.remove(id_hex);
        for ids in inner.index.values_mut() {
            ids.retain(|id| id != id_hex);
        }
        Ok(())
    }
}
