use crate::store::error::{Result, StoreError};
use crate::store::memory::Tables;
use crate::store::traits::*;
use async_trait::async_trait;
use log::{debug, info};
use serde::{Serialize, de::DeserializeOwned};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::RwLock;
use wxcore::WechatId;

const PUPPETS: &str = "puppets.json";
const PORTALS: &str = "portals.json";
const MESSAGES: &str = "messages.json";
const USERS: &str = "users.json";

/// Store that keeps every table in memory and writes the changed table back
/// as a JSON file after each mutation.
pub struct FileStore {
    base_path: PathBuf,
    tables: RwLock<Tables>,
}

impl FileStore {
    /// Opens the store under `path`, creating the directory when missing.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;

        let mut tables = Tables::default();
        let puppets: Vec<PuppetRecord> = read_json(&base_path.join(PUPPETS))
            .await?
            .unwrap_or_default();
        for record in &puppets {
            tables.insert_puppet(record)?;
        }
        let portals: Vec<PortalRecord> = read_json(&base_path.join(PORTALS))
            .await?
            .unwrap_or_default();
        for record in &portals {
            tables.insert_portal(record)?;
        }
        let messages: Vec<MessageRecord> = read_json(&base_path.join(MESSAGES))
            .await?
            .unwrap_or_default();
        for record in &messages {
            tables.insert_message(record)?;
        }
        let users: Vec<UserRecord> = read_json(&base_path.join(USERS))
            .await?
            .unwrap_or_default();
        for record in &users {
            tables.insert_user(record)?;
        }

        info!(
            target: "Store",
            "Opened {} with {} puppets, {} portals, {} messages",
            base_path.display(),
            puppets.len(),
            portals.len(),
            messages.len()
        );
        Ok(Self {
            base_path,
            tables: RwLock::new(tables),
        })
    }

    fn path_for(&self, table: &str) -> PathBuf {
        self.base_path.join(table)
    }

    async fn write_puppets(&self, tables: &Tables) -> Result<()> {
        let rows: Vec<&PuppetRecord> = tables.puppets.values().collect();
        write_json(&self.path_for(PUPPETS), &rows).await
    }

    async fn write_portals(&self, tables: &Tables) -> Result<()> {
        let rows: Vec<&PortalRecord> = tables.portals.values().collect();
        write_json(&self.path_for(PORTALS), &rows).await
    }

    async fn write_messages(&self, tables: &Tables) -> Result<()> {
        let rows: Vec<&MessageRecord> = tables.messages.values().collect();
        write_json(&self.path_for(MESSAGES), &rows).await
    }

    async fn write_users(&self, tables: &Tables) -> Result<()> {
        let rows: Vec<&UserRecord> = tables.users.values().collect();
        write_json(&self.path_for(USERS), &rows).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path).await {
        Ok(data) => serde_json::from_slice(&data)
            .map(Some)
            .map_err(|e| StoreError::Serialization(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

/// Writes through a temporary file so a crash never leaves half a table.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    debug!(target: "Store", "Wrote {}", path.display());
    Ok(())
}

#[async_trait]
impl PuppetStore for FileStore {
    async fn get_puppet(&self, wxid: &WechatId) -> Result<Option<PuppetRecord>> {
        Ok(self.tables.read().await.puppets.get(wxid).cloned())
    }

    async fn get_puppet_by_custom_mxid(&self, mxid: &str) -> Result<Option<PuppetRecord>> {
        Ok(self.tables.read().await.puppet_by_custom_mxid(mxid))
    }

    async fn insert_puppet(&self, record: &PuppetRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.insert_puppet(record)?;
        self.write_puppets(&tables).await
    }

    async fn save_puppet(&self, record: &PuppetRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.save_puppet(record)?;
        self.write_puppets(&tables).await
    }

    async fn all_puppets(&self) -> Result<Vec<PuppetRecord>> {
        Ok(self.tables.read().await.puppets.values().cloned().collect())
    }
}

#[async_trait]
impl PortalStore for FileStore {
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
        let mut tables = self.tables.write().await;
        tables.insert_portal(record)?;
        self.write_portals(&tables).await
    }

    async fn save_portal(&self, record: &PortalRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.save_portal(record)?;
        self.write_portals(&tables).await
    }

    async fn delete_portal(&self, wxid: &WechatId, receiver: &WechatId) -> Result<usize> {
        let mut tables = self.tables.write().await;
        let removed = tables.delete_portal(wxid, receiver)?;
        self.write_portals(&tables).await?;
        if removed > 0 {
            self.write_messages(&tables).await?;
        }
        Ok(removed)
    }

    async fn all_portals(&self) -> Result<Vec<PortalRecord>> {
        Ok(self.tables.read().await.portals.values().cloned().collect())
    }
}

#[async_trait]
impl MessageStore for FileStore {
    async fn insert_message(&self, record: &MessageRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.insert_message(record)?;
        self.write_messages(&tables).await
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
        let mut tables = self.tables.write().await;
        let removed = tables.delete_messages_in_room(mx_room);
        if removed > 0 {
            self.write_messages(&tables).await?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl UserStore for FileStore {
    async fn get_user_by_mxid(&self, mxid: &str) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().await.users.get(mxid).cloned())
    }

    async fn get_user_by_wxid(&self, wxid: &WechatId) -> Result<Option<UserRecord>> {
        Ok(self.tables.read().await.user_by_wxid(wxid))
    }

    async fn insert_user(&self, record: &UserRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.insert_user(record)?;
        self.write_users(&tables).await
    }

    async fn save_user(&self, record: &UserRecord) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables.save_user(record)?;
        self.write_users(&tables).await
    }

    async fn all_users(&self) -> Result<Vec<UserRecord>> {
        Ok(self.tables.read().await.users.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tables_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FileStore::open(dir.path()).await.unwrap();
            let mut portal = PortalRecord::new("room1@chatroom".into(), "acct1".into());
            portal.mxid = Some("!room:local".to_string());
            store.insert_portal(&portal).await.unwrap();
            store
                .insert_message(&MessageRecord {
                    mxid: "$e1".to_string(),
                    mx_room: "!room:local".to_string(),
                    id: "m1".to_string(),
                    sender: "userA".into(),
                    source: "room1@chatroom".into(),
                    receiver: "acct1".into(),
                    timestamp: 1000,
                })
                .await
                .unwrap();
            store
                .insert_user(&UserRecord {
                    mxid: "@boss:local".to_string(),
                    wxid: Some("acct1".into()),
                    wxname: "Boss".to_string(),
                    wxcode: String::new(),
                })
                .await
                .unwrap();
        }

        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(
            store
                .get_message_by_remote(&"userA".into(), &"room1@chatroom".into(), &"acct1".into(), 1000)
                .await
                .unwrap()
                .is_some()
        );
        assert_eq!(
            store
                .get_portal_by_mxid("!room:local")
                .await
                .unwrap()
                .map(|p| p.wxid),
            Some(WechatId::from("room1@chatroom"))
        );
        assert!(store.get_user_by_wxid(&"acct1".into()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn cascade_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).await.unwrap();
        let portal = PortalRecord::new("wxid_b".into(), "acct1".into());
        store.insert_portal(&portal).await.unwrap();
        store
            .insert_message(&MessageRecord {
                mxid: "$e1".to_string(),
                mx_room: "!dm:local".to_string(),
                id: "m1".to_string(),
                sender: "wxid_b".into(),
                source: "wxid_b".into(),
                receiver: "acct1".into(),
                timestamp: 5,
            })
            .await
            .unwrap();
        assert_eq!(store.delete_portal(&"wxid_b".into(), &"acct1".into()).await.unwrap(), 1);
        drop(store);

        let store = FileStore::open(dir.path()).await.unwrap();
        assert!(store.all_portals().await.unwrap().is_empty());
        assert!(store.get_message_by_mxid("$e1", "!dm:local").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_table_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(PUPPETS), b"not json").unwrap();
        assert!(matches!(
            FileStore::open(dir.path()).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
