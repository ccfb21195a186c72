use super::traits::FrameHandler;
use crate::client::Client;
use crate::types::events::Event;
use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, trace, warn};
use std::sync::Arc;
use wxcore::{Frame, FrameType, parse_message};

/// Handler for inbound message frames (text, picture and quote).
///
/// Runs inline: every message is parsed and queued as an [`Event::Message`]
/// before the next frame is read, so events keep socket order.
pub struct MessageHandler {
    frame_type: FrameType,
}

impl MessageHandler {
    pub fn new(frame_type: FrameType) -> Self {
        Self { frame_type }
    }
}

#[async_trait]
impl FrameHandler for MessageHandler {
    fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    fn inline(&self) -> bool {
        true
    }

    async fn handle(&self, client: Arc<Client>, frame: &Frame) -> anyhow::Result<()> {
        let Some(receiver) = client.own_wxid().await else {
            warn!(
                target: "Client/Recv",
                "Dropping message {:?}: no account logged in on the box",
                frame.id
            );
            return Ok(());
        };

        let message = parse_message(frame, &receiver).ok_or_else(|| {
            anyhow!(
                "malformed message frame {:?} (type {})",
                frame.id,
                frame.frame_type.code()
            )
        })?;
        debug!(
            target: "Client/Recv",
            "Received {} message {} from {} in {}",
            message.kind_name(),
            message.id,
            message.sender,
            message.source
        );
        trace!(target: "Client/Recv", "{:?}", message.kind);
        client.emit(Event::Message(message));
        Ok(())
    }
}
