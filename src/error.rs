use crate::image::ImageDecodeError;
use crate::local::LocalChatError;
use crate::request::RequestError;
use crate::store::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("client is not connected")]
    NotConnected,
    #[error("client is already connected")]
    AlreadyConnected,
    #[error("connection error: {0}")]
    Connection(#[source] anyhow::Error),
    #[error("HTTP action failed: {0}")]
    Http(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// Errors surfaced by the bridging pipelines.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Terminal: the message can never be bridged and must not be retried.
    #[error("{0}")]
    IgnoredMessage(String),
    #[error("room creation failed: {0}")]
    RoomCreation(String),
    #[error("startup failed after {attempts} attempts")]
    StartupFailed { attempts: u32 },
    #[error("no logged-in account on the box")]
    NotLoggedIn,
    #[error("portal was deleted")]
    PortalDeleted,
    #[error("media unavailable: {0}")]
    Media(String),
    #[error(transparent)]
    Image(#[from] ImageDecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    LocalChat(#[from] LocalChatError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Request(#[from] RequestError),
}

impl BridgeError {
    pub fn ignored(reason: impl Into<String>) -> Self {
        BridgeError::IgnoredMessage(reason.into())
    }

    /// Whether the local side should give up on the event for good.
    pub fn is_permanent(&self) -> bool {
        matches!(self, BridgeError::IgnoredMessage(_))
    }

    /// Whether a media file the box referenced is not on disk.
    pub fn is_missing_file(&self) -> bool {
        matches!(
            self,
            BridgeError::Image(ImageDecodeError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
