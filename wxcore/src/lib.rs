//! Protocol core for talking to a WeChat box.
//!
//! Everything in this crate is free of I/O: frame decoding, request
//! builders, the remote identity and message types, and the small XML
//! helpers needed to read quote/reply payloads.

pub mod appmsg;
pub mod error;
pub mod frame;
pub mod message;
pub mod query;
pub mod time;
pub mod types;

pub use appmsg::{AppMsg, ReferMsg};
pub use error::{AppMsgError, FrameError};
pub use frame::{Frame, FrameType};
pub use message::parse_message;
pub use query::Envelope;
pub use types::{
    ChatRoomNick, Contact, MessageKind, QuotedMessage, RemoteMessage, UserDetail, WechatId,
    WechatUser,
};
