//! Orchestration of one box: startup, contact sync, and routing of events
//! between the box and the local side.

use crate::client::Client;
use crate::config::Config;
use crate::error::{BridgeError, ClientError, Result};
use crate::identity::IdentityCache;
use crate::image::{DatImageDecoder, ImageDecoder};
use crate::local::LocalChat;
use crate::locks::SendLocks;
use crate::portal::{Delivery, LocalMessage, Portal};
use crate::puppet::{MxidTemplate, Puppet};
use crate::store::traits::Backend;
use crate::supervisor::Supervisor;
use crate::types::events::Event;
use crate::user::UserRegistry;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use wxcore::{Contact, RemoteMessage, WechatId, WechatUser};

/// Upper bound for each box lookup made while enriching an inbound sender.
pub const SENDER_LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborators every entity needs while bridging. Passed by reference into
/// puppet and portal operations instead of being owned by them.
pub struct BridgeContext {
    pub config: Arc<Config>,
    pub store: Arc<dyn Backend>,
    pub local: Arc<dyn LocalChat>,
    pub client: Arc<Client>,
    pub image_decoder: Arc<dyn ImageDecoder>,
    pub template: MxidTemplate,
    pub bot_mxid: String,
}

impl BridgeContext {
    pub fn new(
        config: Arc<Config>,
        store: Arc<dyn Backend>,
        local: Arc<dyn LocalChat>,
        client: Arc<Client>,
    ) -> Self {
        let template = MxidTemplate::new(
            &config.bridge.username_template,
            &config.homeserver.domain,
        );
        let bot_mxid = config.bot_mxid();
        Self {
            config,
            store,
            local,
            client,
            image_decoder: Arc::new(DatImageDecoder::new()),
            template,
            bot_mxid,
        }
    }

    pub fn with_image_decoder(mut self, decoder: Arc<dyn ImageDecoder>) -> Self {
        self.image_decoder = decoder;
        self
    }
}

type PortalKey = (WechatId, WechatId);

/// Ordered inbound queue of one portal and the worker draining it.
struct PortalQueue {
    tx: mpsc::UnboundedSender<RemoteMessage>,
    task: JoinHandle<()>,
}

pub struct Bridge {
    ctx: BridgeContext,
    identities: IdentityCache,
    users: UserRegistry,
    send_locks: SendLocks,
    queues: DashMap<PortalKey, PortalQueue>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Bridge {
    pub fn new(ctx: BridgeContext) -> Arc<Self> {
        let identities = IdentityCache::new(ctx.store.clone(), ctx.template.clone());
        let users = UserRegistry::new(ctx.config.clone(), ctx.store.clone());
        Arc::new(Self {
            ctx,
            identities,
            users,
            send_locks: SendLocks::new(),
            queues: DashMap::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &BridgeContext {
        &self.ctx
    }

    pub fn identities(&self) -> &IdentityCache {
        &self.identities
    }

    pub fn users(&self) -> &UserRegistry {
        &self.users
    }

    /// Connects to the box and starts the event loop, the supervisor and the
    /// startup bootstrap in the background.
    pub async fn start(self: &Arc<Self>, events: mpsc::UnboundedReceiver<Event>) -> Result<()> {
        let event_loop = tokio::spawn({
            let bridge = self.clone();
            async move { bridge.run_events(events).await }
        });
        self.tasks.lock().await.push(event_loop);

        self.connect().await?;

        let heartbeat = &self.ctx.config.wechat.heartbeat;
        let supervisor = Supervisor::new(
            self.ctx.client.clone(),
            heartbeat.check_interval(),
            heartbeat.timeout(),
            self.ctx.config.wechat.reconnect.to_backoff(),
        );
        let supervisor_task = tokio::spawn(async move {
            if let Err(e) = supervisor.run().await {
                error!(target: "Bridge", "Supervisor stopped: {e}");
            }
        });
        let bootstrap = tokio::spawn({
            let bridge = self.clone();
            async move {
                if let Err(e) = bridge.bootstrap().await {
                    error!(target: "Bridge", "Startup failed: {e}");
                }
            }
        });

        let mut tasks = self.tasks.lock().await;
        tasks.push(supervisor_task);
        tasks.push(bootstrap);
        info!(target: "Bridge", "Bridge started");
        Ok(())
    }

    /// Stops every background task and closes the connection.
    pub async fn stop(&self) {
        for task in std::mem::take(&mut *self.tasks.lock().await) {
            task.abort();
        }
        let keys: Vec<PortalKey> = self.queues.iter().map(|q| q.key().clone()).collect();
        for key in keys {
            if let Some((_, queue)) = self.queues.remove(&key) {
                queue.task.abort();
            }
        }
        self.ctx.client.disconnect().await;
        info!(target: "Bridge", "Bridge stopped");
    }

    /// The first connection is retried with the reconnect backoff; later
    /// losses are the supervisor's business.
    async fn connect(&self) -> Result<()> {
        let backoff = self.ctx.config.wechat.reconnect.to_backoff();
        let mut attempt = 0u32;
        loop {
            match self.ctx.client.connect().await {
                Ok(()) | Err(ClientError::AlreadyConnected) => return Ok(()),
                Err(e) => {
                    let Some(delay) = backoff.delay_for(attempt) else {
                        return Err(e.into());
                    };
                    warn!(
                        target: "Bridge",
                        "Failed to connect to the box: {e}, retrying in {delay:?}"
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Waits for a logged-in account, binds it to the admin user and syncs
    /// the contact list.
    pub async fn bootstrap(&self) -> Result<WechatUser> {
        let account = self.fetch_personal_info().await?;
        self.users
            .set_user_info(&self.ctx.config.wechat.admin, &account)
            .await?;
        self.sync_contacts().await?;
        if self.ctx.config.bridge.resend_bridge_info {
            self.resend_bridge_info().await?;
        }
        Ok(account)
    }

    async fn fetch_personal_info(&self) -> Result<WechatUser> {
        let client = &self.ctx.client;
        if let Some(manual) = &self.ctx.config.wechat.manual_login {
            return Ok(client
                .manual_login(&manual.wxid, &manual.wxcode, &manual.wxname)
                .await);
        }

        let backoff = self.ctx.config.bridge.startup_retry.to_backoff();
        let mut attempt = 0u32;
        loop {
            match client.get_personal_info().await {
                Ok(Some(account)) => return Ok(account),
                Ok(None) => debug!(target: "Bridge", "No account logged in on the box yet"),
                Err(e) => warn!(target: "Bridge", "Failed to fetch personal info: {e}"),
            }
            let Some(delay) = backoff.delay_for(attempt) else {
                error!(
                    target: "Bridge",
                    "No logged-in account after {} attempts, giving up",
                    attempt + 1
                );
                return Err(BridgeError::StartupFailed {
                    attempts: attempt + 1,
                });
            };
            info!(target: "Bridge", "Fetching personal info again in {delay:?}");
            sleep(delay).await;
            attempt += 1;
        }
    }

    /// Turns chatrooms into portals and accounts into puppets. Returns how
    /// many contacts were synced; one failing contact does not stop the rest.
    pub async fn sync_contacts(&self) -> Result<usize> {
        let receiver = self
            .ctx
            .client
            .own_wxid()
            .await
            .ok_or(BridgeError::NotLoggedIn)?;
        let contacts = self.ctx.client.get_contact_list().await?;
        let relay_user = self
            .ctx
            .config
            .bridge
            .relay
            .enabled
            .then(|| self.ctx.config.wechat.admin.clone());

        let mut synced = 0;
        for contact in contacts.iter().filter(|c| !c.wxid.is_null()) {
            let result = if contact.is_chatroom() {
                self.sync_chatroom(contact, &receiver, relay_user.as_deref())
                    .await
            } else {
                self.sync_account(contact).await
            };
            match result {
                Ok(()) => synced += 1,
                Err(e) => warn!(target: "Bridge", "Failed to sync contact {}: {e}", contact.wxid),
            }
        }
        info!(
            target: "Bridge",
            "Synced {synced} of {} contacts for {receiver}",
            contacts.len()
        );
        Ok(synced)
    }

    async fn sync_chatroom(
        &self,
        contact: &Contact,
        receiver: &WechatId,
        relay_user: Option<&str>,
    ) -> Result<()> {
        let portal = self.portal(&contact.wxid, receiver).await?;
        portal
            .update_info(&self.ctx, Some(&contact.name), relay_user)
            .await?;
        Ok(())
    }

    async fn sync_account(&self, contact: &Contact) -> Result<()> {
        let puppet = self.puppet(&contact.wxid).await?;
        puppet.update_info(&self.ctx, contact, None).await?;
        Ok(())
    }

    async fn puppet(&self, wxid: &WechatId) -> Result<Arc<Puppet>> {
        self.identities
            .get_puppet(wxid, true)
            .await?
            .ok_or_else(|| BridgeError::ignored(format!("no puppet for {wxid}")))
    }

    async fn portal(&self, wxid: &WechatId, receiver: &WechatId) -> Result<Arc<Portal>> {
        self.identities
            .get_portal(wxid, receiver, true)
            .await?
            .ok_or_else(|| BridgeError::ignored(format!("no portal for {wxid}")))
    }

    async fn run_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<Event>) {
        while let Some(event) = events.recv().await {
            match event {
                Event::Message(msg) => self.route_message(msg),
                Event::LoggedIn(account) => info!(
                    target: "Bridge",
                    "Box reports {} ({}) as logged in",
                    account.name, account.wxid
                ),
                Event::Connected => debug!(target: "Bridge", "Box connected"),
                Event::Disconnected => warn!(target: "Bridge", "Box disconnected"),
            }
        }
        debug!(target: "Bridge", "Event channel closed");
    }

    /// Queues `msg` behind earlier messages of the same conversation.
    pub fn route_message(self: &Arc<Self>, msg: RemoteMessage) {
        let key = (msg.source.clone(), msg.receiver.clone());
        let mut queue = self
            .queues
            .entry(key.clone())
            .or_insert_with(|| self.spawn_queue(key.clone()));
        if let Err(mpsc::error::SendError(msg)) = queue.tx.send(msg) {
            warn!(target: "Bridge", "Queue worker of {} died, restarting it", key.0);
            *queue = self.spawn_queue(key);
            if queue.tx.send(msg).is_err() {
                error!(target: "Bridge", "Dropping message: queue worker is gone");
            }
        }
    }

    fn spawn_queue(self: &Arc<Self>, key: PortalKey) -> PortalQueue {
        let (tx, mut rx) = mpsc::unbounded_channel::<RemoteMessage>();
        let bridge = self.clone();
        let task = tokio::spawn(async move {
            debug!(target: "Bridge", "Queue worker for {} (receiver {}) started", key.0, key.1);
            while let Some(msg) = rx.recv().await {
                if let Err(e) = bridge.handle_remote_message(&msg).await {
                    warn!(
                        target: "Bridge",
                        "Failed to handle message {} from {} in {}: {e}",
                        msg.id, msg.sender, msg.source
                    );
                }
            }
        });
        PortalQueue { tx, task }
    }

    /// Runs one inbound message through sender enrichment and the portal's
    /// delivery pipeline.
    pub async fn handle_remote_message(&self, msg: &RemoteMessage) -> Result<Delivery> {
        if msg.receiver.is_null() {
            return Err(BridgeError::ignored(format!(
                "message {} has no receiver",
                msg.id
            )));
        }
        let puppet = self.puppet(&msg.sender).await?;
        self.refresh_sender(&puppet, msg).await;
        let portal = self.portal(&msg.source, &msg.receiver).await?;
        let result = portal.handle_remote_message(&self.ctx, &puppet, msg).await;
        self.identities.index_room(&portal).await;
        result
    }

    /// Best effort: failures only cost the sender a stale name or avatar.
    /// Each box lookup is bounded by [`SENDER_LOOKUP_TIMEOUT`] so a slow box
    /// cannot hold up the conversation queue for long.
    async fn refresh_sender(&self, puppet: &Puppet, msg: &RemoteMessage) {
        let client = &self.ctx.client;
        let mut contact = match client.contact(&msg.sender) {
            Some(contact) => contact,
            None => bounded_lookup("look up", &msg.sender, client.get_user(&msg.sender))
                .await
                .unwrap_or_else(|| Contact::new(msg.sender.clone(), "")),
        };
        if contact.name.is_empty() && msg.source.is_chatroom() {
            let nick = bounded_lookup(
                "fetch the nick of",
                &msg.sender,
                client.get_chatroom_member_nick(&msg.source, &msg.sender),
            )
            .await
            .flatten();
            if let Some(nick) = nick {
                contact.name = nick.nick;
            }
        }

        let avatar_set = puppet.record().await.avatar_set;
        let detail = if !avatar_set && !contact.headimg.is_empty() {
            bounded_lookup(
                "fetch the detail of",
                &msg.sender,
                client.get_personal_detail(&msg.sender),
            )
            .await
            .flatten()
        } else {
            None
        };

        if let Err(e) = puppet.update_info(&self.ctx, &contact, detail.as_ref()).await {
            warn!(target: "Bridge/Puppet", "Failed to update {}: {e}", msg.sender);
        }
    }

    /// Entry point for events coming from the local side.
    pub async fn handle_local_message(&self, message: LocalMessage) -> Result<()> {
        if message.sender == self.ctx.bot_mxid
            || self.ctx.template.parse(&message.sender).is_some()
        {
            debug!(target: "Bridge", "Ignoring echo of {} from {}", message.event_id, message.sender);
            return Ok(());
        }
        let Some(portal) = self.identities.get_portal_by_mxid(&message.room_id).await? else {
            return Err(BridgeError::ignored(format!(
                "{} is not a bridged room",
                message.room_id
            )));
        };
        let user = self
            .users
            .get_by_mxid(&message.sender, true)
            .await?
            .ok_or_else(|| BridgeError::ignored(format!("unknown user {}", message.sender)))?;
        portal
            .handle_local_message(&self.ctx, &self.send_locks, &user, &message)
            .await
    }

    /// Tears down the portal bridged to `room_id`. Returns how many message
    /// records went with it; zero when the room is not bridged.
    pub async fn delete_portal_by_room(&self, room_id: &str) -> Result<usize> {
        let Some(portal) = self.identities.get_portal_by_mxid(room_id).await? else {
            debug!(target: "Bridge", "{room_id} is not bridged, nothing to delete");
            return Ok(0);
        };
        // Dropping the sender lets the worker drain and exit on its own.
        self.queues.remove(&portal.key());
        self.identities
            .delete_portal(portal.wxid(), portal.receiver())
            .await
    }

    /// Publishes the bridge-info state of every portal with a room again.
    pub async fn resend_bridge_info(&self) -> Result<usize> {
        let mut updated = 0;
        for portal in self.identities.all_portals().await? {
            if portal.mxid().await.is_none() {
                continue;
            }
            match portal.update_bridge_info(&self.ctx).await {
                Ok(()) => updated += 1,
                Err(e) => warn!(
                    target: "Bridge",
                    "Failed to resend bridge info of {}: {e}",
                    portal.wxid()
                ),
            }
        }
        info!(target: "Bridge", "Resent bridge info to {updated} rooms");
        Ok(updated)
    }
}

async fn bounded_lookup<T>(
    what: &str,
    wxid: &WechatId,
    lookup: impl Future<Output = std::result::Result<T, ClientError>>,
) -> Option<T> {
    match timeout(SENDER_LOOKUP_TIMEOUT, lookup).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            warn!(target: "Bridge/Puppet", "Failed to {what} {wxid}: {e}");
            None
        }
        Err(_) => {
            warn!(target: "Bridge/Puppet", "Timed out trying to {what} {wxid}");
            None
        }
    }
}
