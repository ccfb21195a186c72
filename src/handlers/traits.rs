use crate::client::Client;
use async_trait::async_trait;
use std::sync::Arc;
use wxcore::{Frame, FrameType};

/// Trait for handling one type of frame pushed by the box.
///
/// Each handler is responsible for a single [`FrameType`]. Frames that answer
/// a pending request never reach a handler.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Returns the frame type this handler is responsible for.
    fn frame_type(&self) -> FrameType;

    /// Inline handlers finish before the read loop takes the next frame, so
    /// their effects keep socket order. Others run as independent tasks.
    fn inline(&self) -> bool {
        false
    }

    /// Asynchronously handle the incoming frame.
    ///
    /// Errors are logged by the router and never reach the read loop.
    async fn handle(&self, client: Arc<Client>, frame: &Frame) -> anyhow::Result<()>;
}
