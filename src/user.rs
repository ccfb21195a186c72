//! Local accounts that own a box login.

use crate::config::{Config, Permissions};
use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::store::traits::{Backend, UserRecord};
use dashmap::DashMap;
use log::info;
use std::sync::Arc;
use tokio::sync::RwLock;
use wxcore::{WechatId, WechatUser};

pub struct User {
    mxid: String,
    permissions: Permissions,
    record: RwLock<UserRecord>,
}

impl User {
    fn new(record: UserRecord, permissions: Permissions) -> Self {
        Self {
            mxid: record.mxid.clone(),
            permissions,
            record: RwLock::new(record),
        }
    }

    pub fn mxid(&self) -> &str {
        &self.mxid
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// The box account this user is logged in as, if any.
    pub async fn wxid(&self) -> Option<WechatId> {
        self.record.read().await.wxid.clone()
    }

    pub async fn record(&self) -> UserRecord {
        self.record.read().await.clone()
    }

    /// Whether the user can send as `account` without a relay.
    pub async fn owns(&self, account: &WechatId) -> bool {
        self.record.read().await.wxid.as_ref() == Some(account)
    }
}

/// Registry of [`User`]s with the same get-or-create discipline as the
/// identity cache.
pub struct UserRegistry {
    config: Arc<Config>,
    store: Arc<dyn Backend>,
    by_mxid: DashMap<String, Arc<User>>,
    by_wxid: DashMap<WechatId, Arc<User>>,
    locks: KeyedLocks<String>,
}

impl UserRegistry {
    pub fn new(config: Arc<Config>, store: Arc<dyn Backend>) -> Self {
        Self {
            config,
            store,
            by_mxid: DashMap::new(),
            by_wxid: DashMap::new(),
            locks: KeyedLocks::new(),
        }
    }

    fn register(&self, record: UserRecord) -> Arc<User> {
        let permissions = self.config.permissions_for(&record.mxid);
        let wxid = record.wxid.clone();
        let user = Arc::new(User::new(record, permissions));
        self.by_mxid.insert(user.mxid.clone(), user.clone());
        if let Some(wxid) = wxid {
            self.by_wxid.insert(wxid, user.clone());
        }
        user
    }

    pub async fn get_by_mxid(&self, mxid: &str, create: bool) -> Result<Option<Arc<User>>> {
        if create {
            return self.get_or_create(mxid).await.map(Some);
        }
        if let Some(user) = self.by_mxid.get(mxid) {
            return Ok(Some(user.clone()));
        }
        let key = mxid.to_string();
        let _guard = self.locks.acquire(&key).await;
        if let Some(user) = self.by_mxid.get(mxid) {
            return Ok(Some(user.clone()));
        }
        Ok(self
            .store
            .get_user_by_mxid(mxid)
            .await?
            .map(|record| self.register(record)))
    }

    async fn get_or_create(&self, mxid: &str) -> Result<Arc<User>> {
        if let Some(user) = self.by_mxid.get(mxid) {
            return Ok(user.clone());
        }
        let key = mxid.to_string();
        let _guard = self.locks.acquire(&key).await;
        if let Some(user) = self.by_mxid.get(mxid) {
            return Ok(user.clone());
        }
        if let Some(record) = self.store.get_user_by_mxid(mxid).await? {
            return Ok(self.register(record));
        }
        let record = UserRecord {
            mxid: key,
            wxid: None,
            wxname: String::new(),
            wxcode: String::new(),
        };
        self.store.insert_user(&record).await?;
        Ok(self.register(record))
    }

    pub async fn get_by_wxid(&self, wxid: &WechatId) -> Result<Option<Arc<User>>> {
        if let Some(user) = self.by_wxid.get(wxid) {
            return Ok(Some(user.clone()));
        }
        match self.store.get_user_by_wxid(wxid).await? {
            Some(record) => match self.by_mxid.get(&record.mxid) {
                Some(user) => Ok(Some(user.clone())),
                None => Ok(Some(self.register(record))),
            },
            None => Ok(None),
        }
    }

    /// Binds `mxid` to the logged-in box account, creating the user when
    /// needed.
    pub async fn set_user_info(&self, mxid: &str, account: &WechatUser) -> Result<Arc<User>> {
        let user = self.get_or_create(mxid).await?;
        let mut record = user.record.write().await;
        let previous = record.wxid.replace(account.wxid.clone());
        record.wxname = account.name.clone();
        record.wxcode = account.wxcode.clone();
        self.store.save_user(&record).await?;

        if let Some(previous) = previous.filter(|p| p != &account.wxid) {
            self.by_wxid.remove(&previous);
        }
        self.by_wxid.insert(account.wxid.clone(), user.clone());
        info!(
            target: "Bridge/User",
            "{mxid} is logged in as {} ({})",
            account.wxid,
            account.name
        );
        drop(record);
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::store::traits::UserStore;
    use crate::test_utils::test_config;

    #[tokio::test]
    async fn login_binds_account() {
        let store = Arc::new(MemoryStore::new());
        let users = UserRegistry::new(Arc::new(test_config()), store.clone());
        let account = WechatUser::new("acct1", "Boss");
        let user = users.set_user_info("@boss:hs.local", &account).await.unwrap();
        assert!(user.owns(&"acct1".into()).await);
        assert!(user.permissions().admin);

        let again = users.get_by_wxid(&"acct1".into()).await.unwrap().unwrap();
        assert!(Arc::ptr_eq(&user, &again));
        let stored = store.get_user_by_mxid("@boss:hs.local").await.unwrap().unwrap();
        assert_eq!(stored.wxname, "Boss");
    }

    #[tokio::test]
    async fn unknown_users_are_not_created_on_lookup() {
        let users = UserRegistry::new(Arc::new(test_config()), Arc::new(MemoryStore::new()));
        assert!(users.get_by_mxid("@x:hs.local", false).await.unwrap().is_none());
        let created = users.get_by_mxid("@x:hs.local", true).await.unwrap().unwrap();
        assert!(!created.owns(&"acct1".into()).await);
        assert!(!created.permissions().relay);
    }
}
