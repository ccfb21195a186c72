use crate::store::error::{Result, StoreError};
use crate::store::traits::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use wxcore::WechatId;

type PortalKey = (WechatId, WechatId);
type RemoteKey = (WechatId, WechatId, WechatId, i64);

/// The four tables with their unique indexes. Shared by the memory and file
/// stores; callers hold the surrounding lock.
#[derive(Default)]
pub(crate) struct Tables {
    pub(crate) puppets: HashMap<WechatId, PuppetRecord>,
    pub(crate) portals: HashMap<PortalKey, PortalRecord>,
    pub(crate) messages: HashMap<RemoteKey, MessageRecord>,
    message_by_event: HashMap<(String, String), RemoteKey>,
    pub(crate) users: HashMap<String, UserRecord>,
}

impl Tables {
    pub(crate) fn insert_puppet(&mut self, record: &PuppetRecord) -> Result<()> {
        if self.puppets.contains_key(&record.wxid) {
            return Err(StoreError::Conflict(format!("puppet {}", record.wxid)));
        }
        self.puppets.insert(record.wxid.clone(), record.clone());
        Ok(())
    }

    pub(crate) fn save_puppet(&mut self, record: &PuppetRecord) -> Result<()> {
        let slot = self
            .puppets
            .get_mut(&record.wxid)
            .ok_or_else(|| StoreError::NotFound(format!("puppet {}", record.wxid)))?;
        *slot = record.clone();
        Ok(())
    }

    pub(crate) fn insert_portal(&mut self, record: &PortalRecord) -> Result<()> {
        let key = record.key();
        if self.portals.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "portal {} for {}",
                record.wxid, record.receiver
            )));
        }
        self.portals.insert(key, record.clone());
        Ok(())
    }

    pub(crate) fn save_portal(&mut self, record: &PortalRecord) -> Result<()> {
        let slot = self.portals.get_mut(&record.key()).ok_or_else(|| {
            StoreError::NotFound(format!("portal {} for {}", record.wxid, record.receiver))
        })?;
        *slot = record.clone();
        Ok(())
    }

    pub(crate) fn delete_portal(&mut self, wxid: &WechatId, receiver: &WechatId) -> Result<usize> {
        let key = (wxid.clone(), receiver.clone());
        let portal = self
            .portals
            .remove(&key)
            .ok_or_else(|| StoreError::NotFound(format!("portal {wxid} for {receiver}")))?;

        let before = self.messages.len();
        let room = portal.mxid.as_deref();
        self.messages.retain(|_, m| {
            let belongs = (&m.source == wxid && &m.receiver == receiver)
                || room.is_some_and(|room| m.mx_room == room);
            !belongs
        });
        let messages = &self.messages;
        self.message_by_event
            .retain(|_, remote| messages.contains_key(remote));
        Ok(before - self.messages.len())
    }

    pub(crate) fn insert_message(&mut self, record: &MessageRecord) -> Result<()> {
        let remote = record.remote_key();
        let event = (record.mxid.clone(), record.mx_room.clone());
        if self.messages.contains_key(&remote) {
            return Err(StoreError::Conflict(format!(
                "message from {} in {} at {}",
                record.sender, record.source, record.timestamp
            )));
        }
        if self.message_by_event.contains_key(&event) {
            return Err(StoreError::Conflict(format!(
                "event {} in {}",
                record.mxid, record.mx_room
            )));
        }
        self.message_by_event.insert(event, remote.clone());
        self.messages.insert(remote, record.clone());
        Ok(())
    }

    pub(crate) fn delete_messages_in_room(&mut self, mx_room: &str) -> usize {
        let before = self.messages.len();
        self.messages.retain(|_, m| m.mx_room != mx_room);
        self.message_by_event.retain(|(_, room), _| room != mx_room);
        before - self.messages.len()
    }

    pub(crate) fn message_by_mxid(&self, mxid: &str, mx_room: &str) -> Option<MessageRecord> {
        self.message_by_event
            .get(&(mxid.to_string(), mx_room.to_string()))
            .and_then(|remote| self.messages.get(remote))
            .cloned()
    }

    pub(crate) fn insert_user(&mut self, record: &UserRecord) -> Result<()> {
        if self.users.contains_key(&record.mxid) {
            return Err(StoreError::Conflict(format!("user {}", record.mxid)));
        }
        self.users.insert(record.mxid.clone(), record.clone());
        Ok(())
    }

    pub(crate) fn save_user(&mut self, record: &UserRecord) -> Result<()> {
        let slot = self
            .users
            .get_mut(&record.mxid)
            .ok_or_else(|| StoreError::NotFound(format!("user {}", record.mxid)))?;
        *slot = record.clone();
        Ok(())
    }

    pub(crate) fn user_by_wxid(&self, wxid: &WechatId) -> Option<UserRecord> {
        self.users
            .values()
            .find(|u| u.wxid.as_ref() == Some(wxid))
            .cloned()
    }

    pub(crate) fn puppet_by_custom_mxid(&self, mxid: &str) -> Option<PuppetRecord> {
        self.puppets
            .values()
            .find(|p| p.custom_mxid.as_deref() == Some(mxid))
            .cloned()
    }

    pub(crate) fn portal_by_mxid(&self, room_id: &str) -> Option<PortalRecord> {
        self.portals
            .values()
            .find(|p| p.mxid.as_deref() == Some(room_id))
            .cloned()
    }
}

/// A simple in-memory backend, used in tests and as the cache of the file
/// store.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of message records held.
    pub async fn message_count(&self) -> usize {
        self.tables.read().await.messages.len()
    }

    pub async fn puppet_count(&self) -> usize {
        self.tables.read().await.puppets.len()
    }

    pub async fn portal_count(&self) -> usize {
        self.tables.read().await.portals.len()
    }
}

#[async_trait]
impl PuppetStore for MemoryStore {
    async fn get_puppet(&self, wxid: &WechatId) -> Result<Option<PuppetRecord>> {
        Ok(self.tables.read().await.puppets.get(wxid).cloned())
    }

    async fn get_puppet_by_custom_mxid(&self, mxid: &str) -> Result<Option<PuppetRecord>> {
        Ok(self.tables.read().await.puppet_by_custom_mxid(mxid))
    }

    async fn insert_puppet(&self, record: &PuppetRecord) -> Result<()> {
        self.tables.write().await.insert_puppet(record)
    }

    async fn save_puppet(&self, record: &PuppetRecord) -> Result<()> {
        self.tables.write().await.save_puppet(record)
    }

    async fn all_puppets(&self) -> Result<Vec<PuppetRecord>> {
        Ok(self.tables.read().await.puppets.values().cloned().collect())
    }
}

#[async_trait]
impl PortalStore for MemoryStore {
    async fn get_portal(
        &self,
        wxid: &WechatId,
        receiver: &WechatId,
    ) -> Result<Option<PortalRecord>> {
        let key = (wxid.clone(), receiver.clone());
        Ok(self.tables.read().await.portals.get(&key).cloned())
    }

    async fn get_portal_by_mxid(&self, room_id: &str) -> Result<Option<PortalRecord>> {
        Ok(self.tables.read().await.portal_by_mxid(room_id))
    }

    async fn insert_portal(&self, record: &PortalRecord) -> Result<()> {
        self.tables.write().await.insert_portal(record)
    }

    async fn save_portal(&self, record: &PortalRecord) -> Result<()> {
        self.tables.write().await.save_portal(record)
    }

    async fn delete_portal(&self, wxid: &WechatId, receiver: &WechatId) -> Result<usize> {
        self.tables.write().await.delete_portal(wxid, receiver)
    }

    async fn all_portals(&self) -> Result<Vec<PortalRecord>> {
        Ok(self.tables.read().await.portals.values().cloned().collect())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        self.tables.write().await.insert_message(record)
    }

    async fn get_message_by_remote(
        &self,
        sender: &WechatId,
        source: &WechatId,
        receiver: &WechatId,
        timestamp: i64,
    ) -> Result<Option<MessageRecord>> {
        let key = (sender.clone(), source.clone(), receiver.clone(), timestamp);
        Ok(self.tables.read().await.messages.get(&key).cloned())
    }

    async fn get_message_by_mxid(
        &self,
        mxid: &str,
        mx_room: &str,
    ) -> Result<Option<MessageRecord>> {
        Ok(self.tables.read().await.message_by_mxid(mxid, mx_room))
    }

    async fn delete_messages_in_room(&self, mx_room: &str) -> Result<usize> {
        Ok(self.tables.write().await.delete_messages_in_room(mx_room))
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn get_user_by_mxid(&self, mxid: &str) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().await.users.get(mxid).cloned())
    }

    async fn get_user_by_wxid(&self, wxid: &WechatId) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().await.user_by_wxid(wxid))
    }

    async fn insert_user(&self, record: &UserRecord) -> Result<()> {
        self.tables.write().await.insert_user(record)
    }

    async fn save_user(&self, record: &UserRecord) -> Result<()> {
        self.tables.write().await.save_user(record)
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.tables.read().await.users.values().cloned().collect())
    }
}
