//! The local chat system the bridge delivers into.
//!
//! The bridge only needs a handful of primitives: registering virtual users,
//! creating rooms with initial state, sending messages and state events as a
//! given identity, and profile updates. [`LocalChat`] is that seam;
//! [`AppServiceApi`] implements it against a Matrix-style client-server API
//! using the application-service token.

use crate::config::Config;
use crate::formatter::LocalContent;
use crate::http::{HttpClient, HttpRequest};
use async_trait::async_trait;
use dashmap::DashSet;
use log::{debug, warn};
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LocalChatError {
    #[error("request failed: {0}")]
    Http(String),
    #[error("{errcode} (status {status}): {error}")]
    Api {
        status: u16,
        errcode: String,
        error: String,
    },
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl LocalChatError {
    pub fn errcode(&self) -> Option<&str> {
        match self {
            LocalChatError::Api { errcode, .. } => Some(errcode),
            _ => None,
        }
    }
}

/// A state event to set while creating a room.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub state_key: String,
    pub content: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CreateRoom {
    /// Identity the room is created as.
    pub creator: String,
    pub name: Option<String>,
    pub topic: Option<String>,
    pub avatar_url: Option<String>,
    pub invite: Vec<String>,
    pub is_direct: bool,
    pub initial_state: Vec<StateEvent>,
}

impl CreateRoom {
    fn to_body(&self) -> Value {
        let mut initial_state = self.initial_state.clone();
        if let Some(url) = &self.avatar_url {
            initial_state.push(StateEvent {
                event_type: "m.room.avatar".to_string(),
                state_key: String::new(),
                content: json!({ "url": url }),
            });
        }
        let mut body = json!({
            "visibility": "private",
            "preset": "private_chat",
            "invite": self.invite,
            "is_direct": self.is_direct,
            "initial_state": initial_state,
        });
        if let Some(name) = &self.name {
            body["name"] = json!(name);
        }
        if let Some(topic) = &self.topic {
            body["topic"] = json!(topic);
        }
        body
    }
}

/// Outcome of bridging a local event, reported back to the local side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStatus {
    Success,
    /// Sending may work if the user tries again.
    Retriable,
    /// The event will never be bridged.
    Permanent,
}

impl MessageStatus {
    fn as_wire(self) -> &'static str {
        match self {
            MessageStatus::Success => "SUCCESS",
            MessageStatus::Retriable => "FAIL_RETRIABLE",
            MessageStatus::Permanent => "FAIL_PERMANENT",
        }
    }

    fn reason(self) -> Option<&'static str> {
        match self {
            MessageStatus::Success => None,
            MessageStatus::Retriable => Some("m.foreign_network_error"),
            MessageStatus::Permanent => Some("m.event_not_handled"),
        }
    }
}

#[async_trait]
pub trait LocalChat: Send + Sync {
    /// Registers a virtual user. Succeeds when the user already exists.
    async fn ensure_registered(&self, user_id: &str) -> Result<(), LocalChatError>;

    /// Returns the new room id.
    async fn create_room(&self, request: &CreateRoom) -> Result<String, LocalChatError>;

    async fn invite_user(
        &self,
        as_user: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), LocalChatError>;

    async fn join_room(&self, user_id: &str, room_id: &str) -> Result<(), LocalChatError>;

    /// Sends `content` as `as_user` and returns the event id. `timestamp_ms`
    /// backdates the event to when the remote side saw it.
    async fn send_message(
        &self,
        as_user: &str,
        room_id: &str,
        content: &LocalContent,
        timestamp_ms: Option<i64>,
    ) -> Result<String, LocalChatError>;

    async fn send_state_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, LocalChatError>;

    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), LocalChatError>;

    async fn set_avatar_url(&self, user_id: &str, url: &str) -> Result<(), LocalChatError>;

    async fn set_room_name(
        &self,
        as_user: &str,
        room_id: &str,
        name: &str,
    ) -> Result<(), LocalChatError> {
        self.send_state_event(as_user, room_id, "m.room.name", "", &json!({ "name": name }))
            .await
            .map(|_| ())
    }

    async fn set_room_avatar(
        &self,
        as_user: &str,
        room_id: &str,
        url: &str,
    ) -> Result<(), LocalChatError> {
        self.send_state_event(as_user, room_id, "m.room.avatar", "", &json!({ "url": url }))
            .await
            .map(|_| ())
    }

    /// Uploads a blob and returns its content URI.
    async fn upload_media(
        &self,
        as_user: &str,
        data: Vec<u8>,
        mime: &str,
        filename: &str,
    ) -> Result<String, LocalChatError>;

    async fn send_message_status(
        &self,
        room_id: &str,
        event_id: &str,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), LocalChatError>;
}

/// [`LocalChat`] over the client-server API, authenticated as the
/// application service and masquerading via `user_id`.
pub struct AppServiceApi {
    http: Arc<dyn HttpClient>,
    base_url: String,
    as_token: String,
    bot_mxid: String,
    async_media: bool,
    txn_counter: AtomicU64,
    registered: DashSet<String>,
}

impl AppServiceApi {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        as_token: impl Into<String>,
        bot_mxid: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            as_token: as_token.into(),
            bot_mxid: bot_mxid.into(),
            async_media: false,
            txn_counter: AtomicU64::new(0),
            registered: DashSet::new(),
        }
    }

    pub fn from_config(config: &Config, http: Arc<dyn HttpClient>) -> Self {
        let mut api = Self::new(
            http,
            config.homeserver.address.clone(),
            config.homeserver.as_token.clone(),
            config.bot_mxid(),
        );
        api.async_media = config.homeserver.async_media;
        api
    }

    pub fn bot_mxid(&self) -> &str {
        &self.bot_mxid
    }

    fn client_url(&self, path: &str, as_user: &str) -> String {
        format!(
            "{}/_matrix/client/v3/{}?user_id={}",
            self.base_url,
            path,
            urlencoding::encode(as_user)
        )
    }

    fn next_txn_id(&self) -> String {
        let count = self.txn_counter.fetch_add(1, Ordering::Relaxed);
        format!("wxb{}.{}", chrono::Utc::now().timestamp_millis(), count)
    }

    async fn call(&self, request: HttpRequest) -> Result<Value, LocalChatError> {
        let method = request.method.clone();
        let url = request.url.clone();
        let request = request.with_header("Authorization", format!("Bearer {}", self.as_token));
        let response = self
            .http
            .execute(request)
            .await
            .map_err(|e| LocalChatError::Http(e.to_string()))?;

        let body: Value = if response.body.is_empty() {
            json!({})
        } else if response.is_success() {
            response
                .json()
                .map_err(|e| LocalChatError::Malformed(e.to_string()))?
        } else {
            response.json().unwrap_or(Value::Null)
        };

        if !response.is_success() {
            let err = LocalChatError::Api {
                status: response.status_code,
                errcode: body["errcode"].as_str().unwrap_or("M_UNKNOWN").to_string(),
                error: body["error"].as_str().unwrap_or_default().to_string(),
            };
            debug!(target: "LocalChat", "{method} {url} failed: {err}");
            return Err(err);
        }
        Ok(body)
    }

    fn string_field(body: &Value, key: &str) -> Result<String, LocalChatError> {
        body[key]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| LocalChatError::Malformed(format!("response has no {key}")))
    }

    async fn put_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        content: &Value,
        timestamp_ms: Option<i64>,
    ) -> Result<String, LocalChatError> {
        let path = format!(
            "rooms/{}/send/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_type),
            self.next_txn_id()
        );
        let mut url = self.client_url(&path, as_user);
        if let Some(ts) = timestamp_ms {
            url.push_str(&format!("&ts={ts}"));
        }
        let body = self.call(HttpRequest::put(url).with_json(content)).await?;
        Self::string_field(&body, "event_id")
    }

    /// Reserves a content URI first and uploads into it, so the URI can be
    /// handed out before the bytes land.
    async fn upload_media_async(
        &self,
        as_user: &str,
        data: Vec<u8>,
        mime: &str,
        filename: &str,
    ) -> Result<String, LocalChatError> {
        let create_url = format!(
            "{}/_matrix/media/v1/create?user_id={}",
            self.base_url,
            urlencoding::encode(as_user)
        );
        let created = self
            .call(HttpRequest::post(create_url).with_json(&json!({})))
            .await?;
        let content_uri = Self::string_field(&created, "content_uri")?;
        let Some((server, media_id)) = content_uri
            .strip_prefix("mxc://")
            .and_then(|rest| rest.split_once('/'))
        else {
            return Err(LocalChatError::Malformed(format!(
                "bad content URI {content_uri}"
            )));
        };
        let upload_url = format!(
            "{}/_matrix/media/v3/upload/{}/{}?user_id={}&filename={}",
            self.base_url,
            urlencoding::encode(server),
            urlencoding::encode(media_id),
            urlencoding::encode(as_user),
            urlencoding::encode(filename)
        );
        let request = HttpRequest::put(upload_url)
            .with_header("Content-Type", mime)
            .with_body(data);
        self.call(request).await?;
        Ok(content_uri)
    }
}

fn localpart(user_id: &str) -> &str {
    let user_id = user_id.strip_prefix('@').unwrap_or(user_id);
    user_id.split(':').next().unwrap_or(user_id)
}

#[async_trait]
impl LocalChat for AppServiceApi {
    async fn ensure_registered(&self, user_id: &str) -> Result<(), LocalChatError> {
        if self.registered.contains(user_id) {
            return Ok(());
        }
        let url = format!("{}/_matrix/client/v3/register", self.base_url);
        let body = json!({
            "type": "m.login.application_service",
            "username": localpart(user_id),
        });
        match self.call(HttpRequest::post(url).with_json(&body)).await {
            Ok(_) => debug!(target: "LocalChat", "Registered {user_id}"),
            Err(e) if e.errcode() == Some("M_USER_IN_USE") => {}
            Err(e) => return Err(e),
        }
        self.registered.insert(user_id.to_string());
        Ok(())
    }

    async fn create_room(&self, request: &CreateRoom) -> Result<String, LocalChatError> {
        let url = self.client_url("createRoom", &request.creator);
        let body = self
            .call(HttpRequest::post(url).with_json(&request.to_body()))
            .await?;
        Self::string_field(&body, "room_id")
    }

    async fn invite_user(
        &self,
        as_user: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), LocalChatError> {
        let path = format!("rooms/{}/invite", urlencoding::encode(room_id));
        let url = self.client_url(&path, as_user);
        match self
            .call(HttpRequest::post(url).with_json(&json!({ "user_id": user_id })))
            .await
        {
            Ok(_) => Ok(()),
            Err(LocalChatError::Api { status: 403, error, .. }) if error.contains("already in the room") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn join_room(&self, user_id: &str, room_id: &str) -> Result<(), LocalChatError> {
        let path = format!("rooms/{}/join", urlencoding::encode(room_id));
        let url = self.client_url(&path, user_id);
        self.call(HttpRequest::post(url).with_json(&json!({})))
            .await
            .map(|_| ())
    }

    async fn send_message(
        &self,
        as_user: &str,
        room_id: &str,
        content: &LocalContent,
        timestamp_ms: Option<i64>,
    ) -> Result<String, LocalChatError> {
        let content = serde_json::to_value(content)
            .map_err(|e| LocalChatError::Malformed(e.to_string()))?;
        self.put_event(as_user, room_id, "m.room.message", &content, timestamp_ms)
            .await
    }

    async fn send_state_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, LocalChatError> {
        let path = format!(
            "rooms/{}/state/{}/{}",
            urlencoding::encode(room_id),
            urlencoding::encode(event_type),
            urlencoding::encode(state_key)
        );
        let url = self.client_url(&path, as_user);
        let body = self.call(HttpRequest::put(url).with_json(content)).await?;
        Self::string_field(&body, "event_id")
    }

    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), LocalChatError> {
        let path = format!("profile/{}/displayname", urlencoding::encode(user_id));
        let url = self.client_url(&path, user_id);
        self.call(HttpRequest::put(url).with_json(&json!({ "displayname": name })))
            .await
            .map(|_| ())
    }

    async fn set_avatar_url(&self, user_id: &str, url: &str) -> Result<(), LocalChatError> {
        let path = format!("profile/{}/avatar_url", urlencoding::encode(user_id));
        let request_url = self.client_url(&path, user_id);
        self.call(HttpRequest::put(request_url).with_json(&json!({ "avatar_url": url })))
            .await
            .map(|_| ())
    }

    async fn upload_media(
        &self,
        as_user: &str,
        data: Vec<u8>,
        mime: &str,
        filename: &str,
    ) -> Result<String, LocalChatError> {
        if self.async_media {
            return self.upload_media_async(as_user, data, mime, filename).await;
        }
        let url = format!(
            "{}/_matrix/media/v3/upload?user_id={}&filename={}",
            self.base_url,
            urlencoding::encode(as_user),
            urlencoding::encode(filename)
        );
        let request = HttpRequest::post(url)
            .with_header("Content-Type", mime)
            .with_body(data);
        let body = self.call(request).await?;
        Self::string_field(&body, "content_uri")
    }

    async fn send_message_status(
        &self,
        room_id: &str,
        event_id: &str,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), LocalChatError> {
        let mut content = json!({
            "network": "wechat",
            "m.relates_to": { "rel_type": "m.reference", "event_id": event_id },
            "status": status.as_wire(),
        });
        if let Some(reason) = status.reason() {
            content["reason"] = json!(reason);
        }
        if let Some(error) = error {
            content["error"] = json!(error);
        }
        if let Err(e) = self
            .put_event(
                &self.bot_mxid,
                room_id,
                "com.beeper.message_send_status",
                &content,
                None,
            )
            .await
        {
            warn!(target: "LocalChat", "Failed to send status for {event_id}: {e}");
            return Err(e);
        }
        Ok(())
    }
}
