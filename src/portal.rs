//! Remote conversations bridged to local rooms, and the delivery pipelines
//! in both directions.

use crate::bridge::BridgeContext;
use crate::containers::DedupRing;
use crate::error::{BridgeError, Result};
use crate::formatter::{
    LocalContent, MediaInfo, PortalContext, QUOTE_CACHE_SIZE, QuoteCache, quote_key,
    to_local_content, to_remote_text,
};
use crate::local::{CreateRoom, MessageStatus, StateEvent};
use crate::locks::SendLocks;
use crate::puppet::Puppet;
use crate::store::StoreError;
use crate::store::traits::{MessageRecord, PortalRecord};
use crate::user::User;
use log::{debug, error, info, trace, warn};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use wxcore::{MessageKind, RemoteMessage, WechatId};

/// Recently handled remote messages remembered per portal.
pub const DEDUP_RING_SIZE: usize = 100;

/// `(id, source, sender, timestamp)` of a handled remote message.
type DedupKey = (String, WechatId, WechatId, i64);

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Delivered { event_id: String },
    /// Seen recently in this process.
    DuplicateRecent,
    /// Already recorded in the store.
    DuplicateStored,
}

/// A local event that should go to the remote side.
#[derive(Debug, Clone)]
pub struct LocalMessage {
    pub room_id: String,
    pub event_id: String,
    pub sender: String,
    /// Display name of the sender in the room, shown when relaying.
    pub sender_name: Option<String>,
    pub content: LocalContent,
}

/// State only touched while delivering, guarded by one lock so that
/// dedup-check and dedup-insert of two copies of a message cannot interleave.
struct DeliveryState {
    dedup: DedupRing<DedupKey>,
    quotes: QuoteCache,
    joined: HashSet<String>,
}

pub struct Portal {
    wxid: WechatId,
    receiver: WechatId,
    record: RwLock<PortalRecord>,
    delivery: Mutex<DeliveryState>,
    create_lock: Mutex<()>,
    deleted: AtomicBool,
}

impl Portal {
    pub fn new(record: PortalRecord) -> Self {
        Self {
            wxid: record.wxid.clone(),
            receiver: record.receiver.clone(),
            record: RwLock::new(record),
            delivery: Mutex::new(DeliveryState {
                dedup: DedupRing::new(DEDUP_RING_SIZE),
                quotes: QuoteCache::new(QUOTE_CACHE_SIZE),
                joined: HashSet::new(),
            }),
            create_lock: Mutex::new(()),
            deleted: AtomicBool::new(false),
        }
    }

    pub fn wxid(&self) -> &WechatId {
        &self.wxid
    }

    pub fn receiver(&self) -> &WechatId {
        &self.receiver
    }

    pub fn key(&self) -> (WechatId, WechatId) {
        (self.wxid.clone(), self.receiver.clone())
    }

    pub fn is_direct(&self) -> bool {
        !self.wxid.is_chatroom()
    }

    pub async fn mxid(&self) -> Option<String> {
        self.record.read().await.mxid.clone()
    }

    pub async fn record(&self) -> PortalRecord {
        self.record.read().await.clone()
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Identity that owns the room: the counterpart in a private chat, the
    /// bridge bot in a group.
    pub fn main_intent(&self, ctx: &BridgeContext) -> String {
        if self.is_direct() {
            ctx.template.format(&self.wxid)
        } else {
            ctx.bot_mxid.clone()
        }
    }

    /// Marks a message as recently handled without delivering anything.
    pub async fn push_recent(&self, id: &str, source: &WechatId, sender: &WechatId, timestamp: i64) {
        self.delivery
            .lock()
            .await
            .dedup
            .push((id.to_string(), source.clone(), sender.clone(), timestamp));
    }

    /// Delivers one inbound message, at most once.
    ///
    /// Runs under the portal's delivery lock: recent-message check, stored
    /// record check, room creation, translation, sending, recording and
    /// quote caching happen in that order without another delivery for this
    /// portal in between.
    pub async fn handle_remote_message(
        &self,
        ctx: &BridgeContext,
        sender: &Puppet,
        msg: &RemoteMessage,
    ) -> Result<Delivery> {
        let mut state = self.delivery.lock().await;
        if self.is_deleted() {
            return Err(BridgeError::PortalDeleted);
        }

        let key = (
            msg.id.clone(),
            msg.source.clone(),
            msg.sender.clone(),
            msg.timestamp,
        );
        if !state.dedup.check_and_push(key) {
            debug!(
                target: "Bridge/Portal",
                "Ignoring message {} by {} in {} at {} as it was already handled",
                msg.id, msg.sender, msg.source, msg.timestamp
            );
            return Ok(Delivery::DuplicateRecent);
        }

        if ctx
            .store
            .get_message_by_remote(&msg.sender, &msg.source, &self.receiver, msg.timestamp)
            .await?
            .is_some()
        {
            debug!(
                target: "Bridge/Portal",
                "Ignoring message {} by {} in {} at {} as it is already bridged",
                msg.id, msg.sender, msg.source, msg.timestamp
            );
            return Ok(Delivery::DuplicateStored);
        }

        debug!(
            target: "Bridge/Portal",
            "Start handling {} message {} by {} in {} at {}",
            msg.kind_name(), msg.id, msg.sender, msg.source, msg.timestamp
        );
        trace!(target: "Bridge/Portal", "Message content: {:?}", msg.kind);

        let room_id = match self.ensure_room(ctx).await {
            Ok(room_id) => room_id,
            Err(e) => {
                error!(
                    target: "Bridge/Portal",
                    "Dropping message {} in {}: {e}",
                    msg.id, self.wxid
                );
                return Err(e);
            }
        };
        if !state.joined.contains(sender.mxid()) {
            self.ensure_joined(ctx, &room_id, sender.mxid()).await?;
            state.joined.insert(sender.mxid().to_string());
        }

        let content = match &msg.kind {
            MessageKind::Picture { detail, thumb, .. } => {
                self.picture_content(ctx, sender.mxid(), detail.as_deref(), thumb.as_deref())
                    .await
            }
            _ => to_local_content(
                msg,
                PortalContext {
                    is_direct: self.is_direct(),
                },
                &state.quotes,
            ),
        };

        let event_id = ctx
            .local
            .send_message(sender.mxid(), &room_id, &content, Some(msg.timestamp * 1000))
            .await?;

        let record = MessageRecord {
            mxid: event_id.clone(),
            mx_room: room_id,
            id: msg.id.clone(),
            sender: msg.sender.clone(),
            source: msg.source.clone(),
            receiver: self.receiver.clone(),
            timestamp: msg.timestamp,
        };
        match ctx.store.insert_message(&record).await {
            Ok(()) => {}
            Err(StoreError::Conflict(reason)) => {
                warn!(target: "Bridge/Portal", "Message {} recorded twice: {reason}", msg.id);
            }
            Err(e) => return Err(e.into()),
        }

        if let Some(text) = msg.quotable_text() {
            state
                .quotes
                .insert(quote_key(&msg.sender, &msg.source, text), event_id.clone());
        }
        debug!(target: "Bridge/Portal", "Delivered {} as {event_id}", msg.id);
        Ok(Delivery::Delivered { event_id })
    }

    async fn ensure_joined(&self, ctx: &BridgeContext, room_id: &str, user_id: &str) -> Result<()> {
        ctx.local.ensure_registered(user_id).await?;
        if user_id == self.main_intent(ctx) {
            return Ok(());
        }
        ctx.local
            .invite_user(&self.main_intent(ctx), room_id, user_id)
            .await?;
        ctx.local.join_room(user_id, room_id).await?;
        Ok(())
    }

    async fn picture_content(
        &self,
        ctx: &BridgeContext,
        as_user: &str,
        detail: Option<&str>,
        thumb: Option<&str>,
    ) -> LocalContent {
        let mut result = self.upload_picture(ctx, as_user, detail.or(thumb)).await;
        let detail_missing =
            detail.is_some() && matches!(&result, Err(e) if e.is_missing_file());
        if let Some(thumb) = thumb.filter(|_| detail_missing) {
            debug!(
                target: "Bridge/Portal",
                "Full picture in {} is not on disk, using thumbnail {thumb}",
                self.wxid
            );
            result = self.upload_picture(ctx, as_user, Some(thumb)).await;
        }
        match result {
            Ok(content) => content,
            Err(e) => {
                warn!(target: "Bridge/Portal", "Failed to bridge picture in {}: {e}", self.wxid);
                LocalContent::notice(format!("Failed to bridge picture: {e}"))
            }
        }
    }

    async fn upload_picture(
        &self,
        ctx: &BridgeContext,
        as_user: &str,
        relative: Option<&str>,
    ) -> Result<LocalContent> {
        let files_dir = ctx
            .config
            .bridge
            .files_dir
            .as_ref()
            .ok_or_else(|| BridgeError::Media("no files directory configured".to_string()))?;
        let relative =
            relative.ok_or_else(|| BridgeError::Media("message has no file".to_string()))?;
        let path = files_dir.join(relative.replace('\\', "/"));

        let decoder = ctx.image_decoder.clone();
        let decode_path = path.clone();
        let image = tokio::task::spawn_blocking(move || decoder.decode(&decode_path))
            .await
            .map_err(|e| BridgeError::Media(e.to_string()))??;

        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("image");
        let filename = format!("{stem}.{}", image.extension);
        let info = MediaInfo {
            mimetype: Some(image.mime.to_string()),
            size: Some(image.size()),
        };
        let url = ctx
            .local
            .upload_media(as_user, image.data, image.mime, &filename)
            .await?;
        Ok(LocalContent::image(filename, url, info))
    }

    /// Returns the room id, creating the room first when this portal has
    /// none. Concurrent callers wait for one creation.
    pub async fn ensure_room(&self, ctx: &BridgeContext) -> Result<String> {
        if let Some(room_id) = self.mxid().await {
            return Ok(room_id);
        }
        let _guard = self.create_lock.lock().await;
        if let Some(room_id) = self.mxid().await {
            return Ok(room_id);
        }

        let creator = self.main_intent(ctx);
        let owner = match ctx.store.get_user_by_wxid(&self.receiver).await? {
            Some(user) => user.mxid,
            None => ctx.config.wechat.admin.clone(),
        };
        let (name, avatar_url) = {
            let record = self.record.read().await;
            (record.name.clone(), record.avatar_url.clone())
        };

        let mut invite = vec![owner];
        if self.is_direct() {
            invite.push(ctx.bot_mxid.clone());
        }
        let request = CreateRoom {
            creator: creator.clone(),
            name: if self.is_direct() { None } else { name },
            topic: None,
            avatar_url: if self.is_direct() { None } else { avatar_url },
            invite,
            is_direct: self.is_direct(),
            initial_state: self.bridge_info_events(ctx).await,
        };

        ctx.local
            .ensure_registered(&creator)
            .await
            .map_err(|e| BridgeError::RoomCreation(e.to_string()))?;
        let room_id = ctx
            .local
            .create_room(&request)
            .await
            .map_err(|e| BridgeError::RoomCreation(e.to_string()))?;

        let mut record = self.record.write().await;
        record.mxid = Some(room_id.clone());
        ctx.store.save_portal(&record).await?;
        info!(
            target: "Bridge/Portal",
            "Created room {room_id} for {} (receiver {})",
            self.wxid, self.receiver
        );
        Ok(room_id)
    }

    pub fn bridge_info_state_key(&self) -> String {
        format!("net.maunium.wechat://wechat/{}", self.wxid)
    }

    pub async fn bridge_info(&self, ctx: &BridgeContext) -> Value {
        let name = self.record.read().await.name.clone();
        json!({
            "bridgebot": ctx.bot_mxid,
            "creator": self.main_intent(ctx),
            "protocol": {
                "id": "wechat",
                "displayname": "WeChat",
            },
            "channel": {
                "id": self.wxid.as_str(),
                "displayname": name,
            },
        })
    }

    async fn bridge_info_events(&self, ctx: &BridgeContext) -> Vec<StateEvent> {
        let content = self.bridge_info(ctx).await;
        let state_key = self.bridge_info_state_key();
        ["m.bridge", "uk.half-shot.bridge"]
            .into_iter()
            .map(|event_type| StateEvent {
                event_type: event_type.to_string(),
                state_key: state_key.clone(),
                content: content.clone(),
            })
            .collect()
    }

    /// Publishes the bridge-info state events again. No-op without a room.
    pub async fn update_bridge_info(&self, ctx: &BridgeContext) -> Result<()> {
        let Some(room_id) = self.mxid().await else {
            debug!(target: "Bridge/Portal", "Not updating bridge info of {}: no room", self.wxid);
            return Ok(());
        };
        let as_user = self.main_intent(ctx);
        for event in self.bridge_info_events(ctx).await {
            ctx.local
                .send_state_event(
                    &as_user,
                    &room_id,
                    &event.event_type,
                    &event.state_key,
                    &event.content,
                )
                .await?;
        }
        Ok(())
    }

    /// Applies a refreshed name and relay setting. Returns whether anything
    /// changed; the room name is pushed when the room exists.
    pub async fn update_info(
        &self,
        ctx: &BridgeContext,
        name: Option<&str>,
        relay_user_id: Option<&str>,
    ) -> Result<bool> {
        let mut record = self.record.write().await;
        let mut changed = false;
        let name = name.filter(|n| !n.is_empty()).map(str::to_string);
        let name_changed = name.is_some() && record.name != name;
        if name_changed {
            record.name = name;
            changed = true;
        }
        let relay = relay_user_id.map(str::to_string);
        if relay.is_some() && record.relay_user_id != relay {
            record.relay_user_id = relay;
            changed = true;
        }
        if !changed {
            return Ok(false);
        }
        ctx.store.save_portal(&record).await?;

        let push_name = if name_changed && !self.is_direct() {
            record.mxid.clone().zip(record.name.clone())
        } else {
            None
        };
        drop(record);
        if let Some((room_id, name)) = push_name {
            ctx.local
                .set_room_name(&self.main_intent(ctx), &room_id, &name)
                .await?;
        }
        Ok(true)
    }

    /// Sends a local event to the remote conversation and reports the
    /// outcome back to the local side.
    pub async fn handle_local_message(
        &self,
        ctx: &BridgeContext,
        locks: &SendLocks,
        sender: &User,
        message: &LocalMessage,
    ) -> Result<()> {
        let result = self.send_local_message(ctx, locks, sender, message).await;
        match &result {
            Ok(()) => {
                if ctx.config.bridge.message_status_events {
                    self.report_status(ctx, message, MessageStatus::Success, None)
                        .await;
                }
            }
            Err(e) => {
                warn!(
                    target: "Bridge/Portal",
                    "Failed to bridge {} from {} to {}: {e}",
                    message.event_id, message.sender, self.wxid
                );
                if ctx.config.bridge.delivery_error_reports {
                    let notice = LocalContent::notice(format!(
                        "\u{26a0} Your message was not bridged: {e}"
                    ));
                    if let Err(send_err) = ctx
                        .local
                        .send_message(&ctx.bot_mxid, &message.room_id, &notice, None)
                        .await
                    {
                        warn!(target: "Bridge/Portal", "Failed to send error notice: {send_err}");
                    }
                }
                let status = if e.is_permanent() {
                    MessageStatus::Permanent
                } else {
                    MessageStatus::Retriable
                };
                self.report_status(ctx, message, status, Some(&e.to_string()))
                    .await;
            }
        }
        result
    }

    async fn report_status(
        &self,
        ctx: &BridgeContext,
        message: &LocalMessage,
        status: MessageStatus,
        error: Option<&str>,
    ) {
        if let Err(e) = ctx
            .local
            .send_message_status(&message.room_id, &message.event_id, status, error)
            .await
        {
            warn!(target: "Bridge/Portal", "Failed to report status of {}: {e}", message.event_id);
        }
    }

    async fn send_local_message(
        &self,
        ctx: &BridgeContext,
        locks: &SendLocks,
        sender: &User,
        message: &LocalMessage,
    ) -> Result<()> {
        let content = &message.content;
        if !content.msgtype.is_text_like() {
            return Err(BridgeError::ignored(format!(
                "unsupported message type {:?}",
                content.msgtype
            )));
        }
        if content.body.trim().is_empty() {
            return Err(BridgeError::ignored("message has an empty body"));
        }
        if self.is_deleted() {
            return Err(BridgeError::PortalDeleted);
        }

        // The box only ever sends as the account it is logged in as.
        let _guard = locks.acquire(&self.receiver).await;

        let sender_name = if sender.owns(&self.receiver).await {
            None
        } else {
            let relay_user = self.record.read().await.relay_user_id.clone();
            let relay_allowed = ctx.config.bridge.relay.enabled
                && relay_user.is_some()
                && sender.permissions().relay;
            if !relay_allowed {
                return Err(BridgeError::ignored("relaying not supported"));
            }
            if ctx.config.bridge.relay.show_sender {
                Some(
                    message
                        .sender_name
                        .clone()
                        .unwrap_or_else(|| localpart(&message.sender).to_string()),
                )
            } else {
                None
            }
        };

        let remote = to_remote_text(content, sender_name.as_deref());
        if let Some(hint) = &remote.reply_hint {
            debug!(target: "Bridge/Portal", "{} replies to {hint}", message.event_id);
        }
        trace!(target: "Bridge/Portal", "Sending to {}: {}", self.wxid, remote.text);
        ctx.client.send_text(&self.wxid, &remote.text).await?;

        self.delivery.lock().await.quotes.insert(
            quote_key(&self.receiver, &self.wxid, &remote.text),
            message.event_id.clone(),
        );
        debug!(
            target: "Bridge/Portal",
            "Sent {} from {} to {}",
            message.event_id, message.sender, self.wxid
        );
        Ok(())
    }
}

fn localpart(mxid: &str) -> &str {
    let mxid = mxid.strip_prefix('@').unwrap_or(mxid);
    mxid.split(':').next().unwrap_or(mxid)
}
