use super::traits::FrameHandler;
use crate::client::Client;
use async_trait::async_trait;
use log::{debug, trace};
use std::sync::Arc;
use wxcore::{Frame, FrameType};

/// Handler for heartbeat frames.
///
/// Runs inline so liveness is recorded in socket order.
#[derive(Default)]
pub struct HeartbeatHandler;

impl HeartbeatHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FrameHandler for HeartbeatHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::HeartBeat
    }

    fn inline(&self) -> bool {
        true
    }

    async fn handle(&self, client: Arc<Client>, frame: &Frame) -> anyhow::Result<()> {
        client.mark_heartbeat();
        trace!(target: "Client/Recv", "Received heart beat at {:?}", frame.time());
        Ok(())
    }
}

/// Handler for personal info frames nobody asked for.
#[derive(Default)]
pub struct PersonalInfoHandler;

impl PersonalInfoHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FrameHandler for PersonalInfoHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::PersonalInfo
    }

    async fn handle(&self, client: Arc<Client>, frame: &Frame) -> anyhow::Result<()> {
        client.apply_personal_info(frame).await;
        Ok(())
    }
}

/// Handler for pushed contact lists.
#[derive(Default)]
pub struct UserListHandler;

impl UserListHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FrameHandler for UserListHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::UserList
    }

    async fn handle(&self, client: Arc<Client>, frame: &Frame) -> anyhow::Result<()> {
        let count = client.apply_contact_list(frame);
        debug!(target: "Client/Recv", "Contact cache refreshed with {count} entries");
        Ok(())
    }
}

/// Handler for pushed chatroom member lists.
#[derive(Default)]
pub struct ChatroomMemberHandler;

impl ChatroomMemberHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FrameHandler for ChatroomMemberHandler {
    fn frame_type(&self) -> FrameType {
        FrameType::ChatroomMember
    }

    async fn handle(&self, client: Arc<Client>, frame: &Frame) -> anyhow::Result<()> {
        client.apply_chatroom_members(frame, None);
        Ok(())
    }
}
