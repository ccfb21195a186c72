use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid JSON frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no usable `type` field")]
    MissingType,
}

#[derive(Debug, Error)]
pub enum AppMsgError {
    #[error("malformed appmsg XML: {0}")]
    Xml(String),
    #[error("appmsg has no title")]
    MissingTitle,
}
