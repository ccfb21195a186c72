//! Test doubles shared by unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use crate::bridge::{Bridge, BridgeContext};
use crate::client::Client;
use crate::config::Config;
use crate::formatter::LocalContent;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::local::{CreateRoom, LocalChat, LocalChatError, MessageStatus};
use crate::store::MemoryStore;
use crate::types::events::Event;

pub use crate::transport::mock::{MockTransport, MockTransportFactory};

type HttpHandler = Arc<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

/// Records every request and answers with a scripted response, `200 {}` by
/// default.
#[derive(Clone)]
pub struct MockHttpClient {
    handler: HttpHandler,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::with_handler(|_| HttpResponse {
            status_code: 200,
            body: b"{}".to_vec(),
        })
    }

    pub fn with_handler(
        handler: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Arc::new(handler),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for MockHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        let response = (self.handler)(&request);
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(response)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FailingMockHttpClient;

#[async_trait]
impl HttpClient for FailingMockHttpClient {
    async fn execute(&self, _request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        Err(anyhow::anyhow!("Not implemented"))
    }
}

/// Answer frame for a request frame sent by the client.
pub fn reply(request: &Value, content: Value) -> String {
    json!({
        "id": request.get("id").cloned().unwrap_or(Value::Null),
        "type": request.get("type").cloned().unwrap_or(Value::Null),
        "content": content,
    })
    .to_string()
}

/// Responder that answers every request with empty content, as a box with
/// nothing to report does.
pub fn empty_replies(request: &Value) -> Vec<String> {
    vec![reply(request, json!({}))]
}

/// One call made against [`RecordingLocalChat`].
#[derive(Debug, Clone, PartialEq)]
pub enum LocalCall {
    Register {
        user_id: String,
    },
    CreateRoom {
        room_id: String,
        request: CreateRoom,
    },
    Invite {
        as_user: String,
        room_id: String,
        user_id: String,
    },
    Join {
        user_id: String,
        room_id: String,
    },
    Message {
        as_user: String,
        room_id: String,
        event_id: String,
        content: LocalContent,
        timestamp_ms: Option<i64>,
    },
    State {
        as_user: String,
        room_id: String,
        event_type: String,
        state_key: String,
        content: Value,
    },
    DisplayName {
        user_id: String,
        name: String,
    },
    AvatarUrl {
        user_id: String,
        url: String,
    },
    Upload {
        as_user: String,
        mime: String,
        filename: String,
        size: usize,
    },
    Status {
        room_id: String,
        event_id: String,
        status: MessageStatus,
        error: Option<String>,
    },
}

/// In-memory local side that records what the bridge asked it to do.
#[derive(Default)]
pub struct RecordingLocalChat {
    calls: Mutex<Vec<LocalCall>>,
    counter: AtomicUsize,
    fail_create_room: AtomicBool,
    fail_send: AtomicBool,
}

impl RecordingLocalChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create_room(&self, fail: bool) {
        self.fail_create_room.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<LocalCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// `(as_user, room_id, content)` of every message sent.
    pub fn messages(&self) -> Vec<(String, String, LocalContent)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LocalCall::Message {
                    as_user,
                    room_id,
                    content,
                    ..
                } => Some((as_user, room_id, content)),
                _ => None,
            })
            .collect()
    }

    pub fn rooms_created(&self) -> Vec<(String, CreateRoom)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LocalCall::CreateRoom { room_id, request } => Some((room_id, request)),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<(String, MessageStatus)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                LocalCall::Status {
                    event_id, status, ..
                } => Some((event_id, status)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: LocalCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn next(&self) -> usize {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }
}

fn refused(what: &str) -> LocalChatError {
    LocalChatError::Api {
        status: 500,
        errcode: "M_UNKNOWN".to_string(),
        error: format!("{what} refused by test"),
    }
}

#[async_trait]
impl LocalChat for RecordingLocalChat {
    async fn ensure_registered(&self, user_id: &str) -> Result<(), LocalChatError> {
        self.record(LocalCall::Register {
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    async fn create_room(&self, request: &CreateRoom) -> Result<String, LocalChatError> {
        if self.fail_create_room.load(Ordering::SeqCst) {
            return Err(refused("room creation"));
        }
        let room_id = format!("!room{}:hs.local", self.next());
        self.record(LocalCall::CreateRoom {
            room_id: room_id.clone(),
            request: request.clone(),
        });
        Ok(room_id)
    }

    async fn invite_user(
        &self,
        as_user: &str,
        room_id: &str,
        user_id: &str,
    ) -> Result<(), LocalChatError> {
        self.record(LocalCall::Invite {
            as_user: as_user.to_string(),
            room_id: room_id.to_string(),
            user_id: user_id.to_string(),
        });
        Ok(())
    }

    async fn join_room(&self, user_id: &str, room_id: &str) -> Result<(), LocalChatError> {
        self.record(LocalCall::Join {
            user_id: user_id.to_string(),
            room_id: room_id.to_string(),
        });
        Ok(())
    }

    async fn send_message(
        &self,
        as_user: &str,
        room_id: &str,
        content: &LocalContent,
        timestamp_ms: Option<i64>,
    ) -> Result<String, LocalChatError> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(refused("send"));
        }
        let event_id = format!("$ev{}", self.next());
        self.record(LocalCall::Message {
            as_user: as_user.to_string(),
            room_id: room_id.to_string(),
            event_id: event_id.clone(),
            content: content.clone(),
            timestamp_ms,
        });
        Ok(event_id)
    }

    async fn send_state_event(
        &self,
        as_user: &str,
        room_id: &str,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<String, LocalChatError> {
        self.record(LocalCall::State {
            as_user: as_user.to_string(),
            room_id: room_id.to_string(),
            event_type: event_type.to_string(),
            state_key: state_key.to_string(),
            content: content.clone(),
        });
        Ok(format!("$state{}", self.next()))
    }

    async fn set_display_name(&self, user_id: &str, name: &str) -> Result<(), LocalChatError> {
        self.record(LocalCall::DisplayName {
            user_id: user_id.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    async fn set_avatar_url(&self, user_id: &str, url: &str) -> Result<(), LocalChatError> {
        self.record(LocalCall::AvatarUrl {
            user_id: user_id.to_string(),
            url: url.to_string(),
        });
        Ok(())
    }

    async fn upload_media(
        &self,
        as_user: &str,
        data: Vec<u8>,
        mime: &str,
        filename: &str,
    ) -> Result<String, LocalChatError> {
        self.record(LocalCall::Upload {
            as_user: as_user.to_string(),
            mime: mime.to_string(),
            filename: filename.to_string(),
            size: data.len(),
        });
        Ok(format!("mxc://hs.local/media{}", self.next()))
    }

    async fn send_message_status(
        &self,
        room_id: &str,
        event_id: &str,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<(), LocalChatError> {
        self.record(LocalCall::Status {
            room_id: room_id.to_string(),
            event_id: event_id.to_string(),
            status,
            error: error.map(str::to_string),
        });
        Ok(())
    }
}

pub const TEST_CONFIG: &str = r#"
[homeserver]
address = "https://hs.local"
domain = "hs.local"
as_token = "as-secret"

[appservice]
bot_username = "wechatbot"

[bridge]
message_status_events = true

[bridge.relay]
enabled = true

[bridge.permissions]
"@boss:hs.local" = "admin"
"@friend:hs.local" = "relay"

[bridge.startup_retry]
initial_delay_secs = 1
max_delay_secs = 2
max_attempts = 2

[wechat]
admin = "@boss:hs.local"
request_timeout_secs = 2
"#;

/// Configuration of a bridge on `hs.local` owned by `@boss:hs.local`.
pub fn test_config() -> Config {
    Config::from_toml_str(TEST_CONFIG, |_| None).expect("test config should parse")
}

/// A bridge wired to doubles on every side.
pub struct TestBridge {
    pub bridge: Arc<Bridge>,
    pub client: Arc<Client>,
    pub factory: Arc<MockTransportFactory>,
    pub http: Arc<MockHttpClient>,
    pub local: Arc<RecordingLocalChat>,
    pub store: Arc<MemoryStore>,
    pub events: Option<mpsc::UnboundedReceiver<Event>>,
}

impl TestBridge {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// The box answers every request with empty content unless the test
    /// installs another responder on `factory`.
    pub fn with_config(config: Config) -> Self {
        let config = Arc::new(config);
        let factory = Arc::new(MockTransportFactory::with_responder(empty_replies));
        let http = Arc::new(MockHttpClient::new());
        let local = Arc::new(RecordingLocalChat::new());
        let store = Arc::new(MemoryStore::new());
        let (client, events) = Client::new(
            config.wechat.client_config(),
            factory.clone(),
            http.clone(),
        );
        let ctx = BridgeContext::new(config, store.clone(), local.clone(), client.clone());
        Self {
            bridge: Bridge::new(ctx),
            client,
            factory,
            http,
            local,
            store,
            events: Some(events),
        }
    }

    /// Connects the client and logs `wxid` in without asking the box.
    pub async fn logged_in(self, wxid: &str) -> Self {
        self.client.connect().await.expect("mock connect should succeed");
        self.client.manual_login(wxid, "", "Owner").await;
        self
    }
}

impl Default for TestBridge {
    fn default() -> Self {
        Self::new()
    }
}
