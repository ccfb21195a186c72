use super::traits::FrameHandler;
use crate::client::Client;
use async_trait::async_trait;
use log::{debug, trace};
use std::sync::Arc;
use wxcore::{Frame, FrameType};

/// Handler for frame types the bridge knows about but does not act on yet,
/// such as mention notifications and debug switches.
///
/// These are logged and otherwise dropped.
pub struct UnimplementedHandler {
    frame_type: FrameType,
}

impl UnimplementedHandler {
    pub fn new(frame_type: FrameType) -> Self {
        Self { frame_type }
    }
}

#[async_trait]
impl FrameHandler for UnimplementedHandler {
    fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    async fn handle(&self, _client: Arc<Client>, frame: &Frame) -> anyhow::Result<()> {
        debug!(
            target: "Client/Recv",
            "Ignoring frame {:?} of type {}",
            frame.id,
            frame.frame_type.code()
        );
        trace!(target: "Client/Recv", "{}", frame.content);
        Ok(())
    }
}
