//! Write-through cache of puppets and portals with single-flight
//! get-or-create.
//!
//! The store is the source of truth; the maps here hold the one live
//! instance of each entity so that every task sees the same locks and
//! dedup state.

use crate::error::Result;
use crate::locks::KeyedLocks;
use crate::portal::Portal;
use crate::puppet::{MxidTemplate, Puppet};
use crate::store::traits::{Backend, PortalRecord, PuppetRecord};
use dashmap::DashMap;
use log::{debug, info};
use std::sync::Arc;
use wxcore::WechatId;

type PortalKey = (WechatId, WechatId);

pub struct IdentityCache {
    store: Arc<dyn Backend>,
    template: MxidTemplate,
    puppets: DashMap<WechatId, Arc<Puppet>>,
    puppets_by_custom_mxid: DashMap<String, Arc<Puppet>>,
    portals: DashMap<PortalKey, Arc<Portal>>,
    portals_by_mxid: DashMap<String, Arc<Portal>>,
    puppet_locks: KeyedLocks<WechatId>,
    portal_locks: KeyedLocks<PortalKey>,
}

impl IdentityCache {
    pub fn new(store: Arc<dyn Backend>, template: MxidTemplate) -> Self {
        Self {
            store,
            template,
            puppets: DashMap::new(),
            puppets_by_custom_mxid: DashMap::new(),
            portals: DashMap::new(),
            portals_by_mxid: DashMap::new(),
            puppet_locks: KeyedLocks::new(),
            portal_locks: KeyedLocks::new(),
        }
    }

    pub fn template(&self) -> &MxidTemplate {
        &self.template
    }

    fn register_puppet(&self, record: PuppetRecord) -> Arc<Puppet> {
        let custom_mxid = record.custom_mxid.clone();
        let puppet = Arc::new(Puppet::new(record, &self.template));
        self.puppets.insert(puppet.wxid().clone(), puppet.clone());
        if let Some(custom_mxid) = custom_mxid {
            self.puppets_by_custom_mxid
                .insert(custom_mxid, puppet.clone());
        }
        puppet
    }

    /// Looks a puppet up, creating and persisting it when `create` is set.
    /// Concurrent calls for the same id yield the same instance.
    pub async fn get_puppet(&self, wxid: &WechatId, create: bool) -> Result<Option<Arc<Puppet>>> {
        if let Some(puppet) = self.puppets.get(wxid) {
            return Ok(Some(puppet.clone()));
        }
        let _guard = self.puppet_locks.acquire(wxid).await;
        if let Some(puppet) = self.puppets.get(wxid) {
            return Ok(Some(puppet.clone()));
        }

        if let Some(record) = self.store.get_puppet(wxid).await? {
            return Ok(Some(self.register_puppet(record)));
        }
        if !create {
            return Ok(None);
        }
        let record = PuppetRecord::new(wxid.clone());
        self.store.insert_puppet(&record).await?;
        debug!(target: "Bridge/Puppet", "Created puppet for {wxid}");
        Ok(Some(self.register_puppet(record)))
    }

    /// Resolves a virtual user id back to its puppet.
    pub async fn get_puppet_by_mxid(&self, mxid: &str, create: bool) -> Result<Option<Arc<Puppet>>> {
        match self.template.parse(mxid) {
            Some(wxid) => self.get_puppet(&wxid, create).await,
            None => Ok(None),
        }
    }

    pub async fn get_puppet_by_custom_mxid(&self, mxid: &str) -> Result<Option<Arc<Puppet>>> {
        if let Some(puppet) = self.puppets_by_custom_mxid.get(mxid) {
            return Ok(Some(puppet.clone()));
        }
        let Some(record) = self.store.get_puppet_by_custom_mxid(mxid).await? else {
            return Ok(None);
        };
        // Prefer the live instance if the puppet was loaded by wxid.
        match self.get_puppet(&record.wxid, false).await? {
            Some(puppet) => {
                self.puppets_by_custom_mxid
                    .insert(mxid.to_string(), puppet.clone());
                Ok(Some(puppet))
            }
            None => Ok(None),
        }
    }

    /// Binds or unbinds the double puppet of `puppet` and keeps the lookup
    /// map in step.
    pub async fn set_custom_mxid(
        &self,
        ctx: &crate::bridge::BridgeContext,
        puppet: &Arc<Puppet>,
        custom_mxid: Option<String>,
        access_token: Option<String>,
    ) -> Result<()> {
        if let Some(previous) = puppet.custom_mxid().await {
            self.puppets_by_custom_mxid.remove(&previous);
        }
        puppet
            .set_custom_mxid(ctx, custom_mxid.clone(), access_token, None)
            .await?;
        if let Some(mxid) = custom_mxid {
            self.puppets_by_custom_mxid.insert(mxid, puppet.clone());
        }
        Ok(())
    }

    fn register_portal(&self, record: PortalRecord) -> Arc<Portal> {
        let mxid = record.mxid.clone();
        let portal = Arc::new(Portal::new(record));
        self.portals.insert(portal.key(), portal.clone());
        if let Some(mxid) = mxid {
            self.portals_by_mxid.insert(mxid, portal.clone());
        }
        portal
    }

    /// Same get-or-create discipline as [`Self::get_puppet`], keyed by
    /// `(wxid, receiver)`.
    pub async fn get_portal(
        &self,
        wxid: &WechatId,
        receiver: &WechatId,
        create: bool,
    ) -> Result<Option<Arc<Portal>>> {
        let key = (wxid.clone(), receiver.clone());
        if let Some(portal) = self.portals.get(&key) {
            return Ok(Some(portal.clone()));
        }
        let _guard = self.portal_locks.acquire(&key).await;
        if let Some(portal) = self.portals.get(&key) {
            return Ok(Some(portal.clone()));
        }

        if let Some(record) = self.store.get_portal(wxid, receiver).await? {
            return Ok(Some(self.register_portal(record)));
        }
        if !create {
            return Ok(None);
        }
        let record = PortalRecord::new(wxid.clone(), receiver.clone());
        self.store.insert_portal(&record).await?;
        debug!(target: "Bridge/Portal", "Created portal for {wxid} (receiver {receiver})");
        Ok(Some(self.register_portal(record)))
    }

    pub async fn get_portal_by_mxid(&self, room_id: &str) -> Result<Option<Arc<Portal>>> {
        if let Some(portal) = self.portals_by_mxid.get(room_id) {
            return Ok(Some(portal.clone()));
        }
        let Some(record) = self.store.get_portal_by_mxid(room_id).await? else {
            return Ok(None);
        };
        let portal = self.get_portal(&record.wxid, &record.receiver, false).await?;
        if let Some(portal) = &portal {
            self.portals_by_mxid
                .insert(room_id.to_string(), portal.clone());
        }
        Ok(portal)
    }

    /// Makes a room created after the portal was loaded resolvable without
    /// going back to the store.
    pub async fn index_room(&self, portal: &Arc<Portal>) {
        if portal.is_deleted() {
            return;
        }
        if let Some(mxid) = portal.mxid().await {
            self.portals_by_mxid
                .entry(mxid)
                .or_insert_with(|| portal.clone());
        }
    }

    /// Removes the portal from the cache and the store together with its
    /// message records. Returns how many records were deleted.
    pub async fn delete_portal(&self, wxid: &WechatId, receiver: &WechatId) -> Result<usize> {
        let key = (wxid.clone(), receiver.clone());
        let _guard = self.portal_locks.acquire(&key).await;
        if let Some((_, portal)) = self.portals.remove(&key) {
            portal.mark_deleted();
            if let Some(mxid) = portal.mxid().await {
                self.portals_by_mxid.remove(&mxid);
            }
        }
        self.portals_by_mxid
            .retain(|_, portal| portal.key() != key);
        let removed = self.store.delete_portal(wxid, receiver).await?;
        info!(
            target: "Bridge/Portal",
            "Deleted portal {wxid} (receiver {receiver}) and {removed} message records"
        );
        Ok(removed)
    }

    /// Every stored portal, as live instances.
    pub async fn all_portals(&self) -> Result<Vec<Arc<Portal>>> {
        let mut portals = Vec::new();
        for record in self.store.all_portals().await? {
            if let Some(portal) = self
                .get_portal(&record.wxid, &record.receiver, false)
                .await?
            {
                portals.push(portal);
            }
        }
        Ok(portals)
    }

    pub fn cached_puppet_count(&self) -> usize {
        self.puppets.len()
    }

    pub fn cached_portal_count(&self) -> usize {
        self.portals.len()
    }

    pub fn cached_room_count(&self) -> usize {
        self.portals_by_mxid.len()
    }
}
