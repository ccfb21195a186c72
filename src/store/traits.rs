use crate::store::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use wxcore::WechatId;

/// Durable state of a remote account bridged as a local virtual user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PuppetRecord {
    pub wxid: WechatId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub headimg: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub wxcode: String,
    /// Content URI of the uploaded avatar.
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub name_set: bool,
    #[serde(default)]
    pub avatar_set: bool,
    #[serde(default)]
    pub is_registered: bool,
    /// Local account bound as this puppet's double.
    #[serde(default)]
    pub custom_mxid: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub next_batch: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

impl PuppetRecord {
    pub fn new(wxid: WechatId) -> Self {
        Self {
            wxid,
            name: String::new(),
            headimg: String::new(),
            remarks: String::new(),
            wxcode: String::new(),
            avatar_url: None,
            name_set: false,
            avatar_set: false,
            is_registered: false,
            custom_mxid: None,
            access_token: None,
            next_batch: None,
            base_url: None,
        }
    }
}

/// Durable state of a remote conversation, keyed by `(wxid, receiver)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortalRecord {
    pub wxid: WechatId,
    /// Logged-in account whose view of the conversation this is.
    pub receiver: WechatId,
    /// Local room id, set once when the room is created.
    #[serde(default)]
    pub mxid: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    /// Local account that relays for users without their own box.
    #[serde(default)]
    pub relay_user_id: Option<String>,
}

impl PortalRecord {
    pub fn new(wxid: WechatId, receiver: WechatId) -> Self {
        Self {
            wxid,
            receiver,
            mxid: None,
            name: None,
            avatar_url: None,
            encrypted: false,
            relay_user_id: None,
        }
    }

    pub fn key(&self) -> (WechatId, WechatId) {
        (self.wxid.clone(), self.receiver.clone())
    }
}

/// Binding of one remote message to the local event it was delivered as.
///
/// `(sender, source, receiver, timestamp)` and `(mxid, mx_room)` are both
/// unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub mxid: String,
    pub mx_room: String,
    pub id: String,
    pub sender: WechatId,
    pub source: WechatId,
    pub receiver: WechatId,
    pub timestamp: i64,
}

impl MessageRecord {
    pub fn remote_key(&self) -> (WechatId, WechatId, WechatId, i64) {
        (
            self.sender.clone(),
            self.source.clone(),
            self.receiver.clone(),
            self.timestamp,
        )
    }
}

/// Local account that owns a box login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub mxid: String,
    #[serde(default)]
    pub wxid: Option<WechatId>,
    #[serde(default)]
    pub wxname: String,
    #[serde(default)]
    pub wxcode: String,
}

#[async_trait]
pub trait PuppetStore: Send + Sync {
    async fn get_puppet(&self, wxid: &WechatId) -> Result<Option<PuppetRecord>>;
    async fn get_puppet_by_custom_mxid(&self, mxid: &str) -> Result<Option<PuppetRecord>>;
    /// Fails with `Conflict` when the wxid is taken.
    async fn insert_puppet(&self, record: &PuppetRecord) -> Result<()>;
    /// Fails with `NotFound` when the puppet was never inserted.
    async fn save_puppet(&self, record: &PuppetRecord) -> Result<()>;
    async fn all_puppets(&self) -> Result<Vec<PuppetRecord>>;
}

#[async_trait]
pub trait PortalStore: Send + Sync {
    async fn get_portal(
        &self,
        wxid: &WechatId,
        receiver: &WechatId,
    ) -> Result<Option<PortalRecord>>;
    async fn get_portal_by_mxid(&self, room_id: &str) -> Result<Option<PortalRecord>>;
    /// Fails with `Conflict` when `(wxid, receiver)` is taken.
    async fn insert_portal(&self, record: &PortalRecord) -> Result<()>;
    async fn save_portal(&self, record: &PortalRecord) -> Result<()>;
    /// Deletes the portal together with its message records and returns how
    /// many records went with it.
    async fn delete_portal(&self, wxid: &WechatId, receiver: &WechatId) -> Result<usize>;
    async fn all_portals(&self) -> Result<Vec<PortalRecord>>;
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Fails with `Conflict` when either unique key is taken.
    async fn insert_message(&self, record: &MessageRecord) -> Result<()>;
    async fn get_message_by_remote(
        &self,
        sender: &WechatId,
        source: &WechatId,
        receiver: &WechatId,
        timestamp: i64,
    ) -> Result<Option<MessageRecord>>;
    async fn get_message_by_mxid(&self, mxid: &str, mx_room: &str)
    -> Result<Option<MessageRecord>>;
    async fn delete_messages_in_room(&self, mx_room: &str) -> Result<usize>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get_user_by_mxid(&self, mxid: &str) -> Result<Option<UserRecord>>;
    async fn get_user_by_wxid(&self, wxid: &WechatId) -> Result<Option<UserRecord>>;
    async fn insert_user(&self, record: &UserRecord) -> Result<()>;
    async fn save_user(&self, record: &UserRecord) -> Result<()>;
    async fn all_users(&self) -> Result<Vec<UserRecord>>;
}

/// Everything the bridge persists.
pub trait Backend: PuppetStore + PortalStore + MessageStore + UserStore + Send + Sync {}

impl<T> Backend for T where T: PuppetStore + PortalStore + MessageStore + UserStore + Send + Sync {}
