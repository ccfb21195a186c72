use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Suffix the box uses for group conversation identifiers.
pub const CHATROOM_SUFFIX: &str = "chatroom";

/// Opaque identifier of a remote account or conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct WechatId(String);

impl WechatId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Conversations are told apart from accounts by their suffix.
    pub fn is_chatroom(&self) -> bool {
        self.0.ends_with(CHATROOM_SUFFIX)
    }

    /// The box fills unused fields with the literal string `null`.
    pub fn is_null(&self) -> bool {
        self.0.is_empty() || self.0 == "null"
    }
}

impl fmt::Display for WechatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WechatId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for WechatId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for WechatId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for WechatId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A contact-list entry as reported by the box.
///
/// This is a transient view refreshed on every contact fetch; the durable
/// copy of an account lives in the bridge's puppet table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Contact {
    pub wxid: WechatId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub headimg: String,
    #[serde(default)]
    pub remarks: String,
    #[serde(default)]
    pub wxcode: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_room_members: Option<Vec<WechatId>>,
}

impl Contact {
    pub fn new(wxid: impl Into<WechatId>, name: impl Into<String>) -> Self {
        Self {
            wxid: wxid.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn is_chatroom(&self) -> bool {
        self.wxid.is_chatroom()
    }
}

/// Profile details returned by a personal-detail query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UserDetail {
    pub big_headimg: String,
    pub little_headimg: String,
    pub cover: String,
    pub signature: String,
}

impl UserDetail {
    /// The box answers unknown ids with an all-empty detail.
    pub fn is_empty(&self) -> bool {
        self.big_headimg.is_empty()
            && self.little_headimg.is_empty()
            && self.cover.is_empty()
            && self.signature.is_empty()
    }
}

/// Nickname of an account, optionally scoped to a chatroom.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatRoomNick {
    pub nick: String,
    pub roomid: String,
    pub wxid: String,
}

impl ChatRoomNick {
    pub fn is_empty(&self) -> bool {
        self.nick.is_empty() && self.roomid.is_empty() && self.wxid.is_empty()
    }
}

/// Account details as the box reports them in contact lists and personal
/// info answers.
pub type WechatUser = Contact;

/// A message quoted by a reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QuotedMessage {
    /// Account that wrote the quoted message.
    pub sender: WechatId,
    /// Conversation the quoted message was posted in.
    pub source: WechatId,
    pub display_name: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Text {
        content: String,
    },
    /// A picture stored by the box as an obfuscated `.dat` file. `detail` and
    /// `thumb` are paths relative to the box's files directory; `xml` carries
    /// the picture metadata.
    Picture {
        detail: Option<String>,
        thumb: Option<String>,
        xml: String,
    },
    /// A text reply that cites an earlier message.
    Quote {
        text: String,
        quoted: Option<QuotedMessage>,
    },
}

/// An inbound message event, normalised from the box's frame shapes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    pub id: String,
    /// Conversation the message was posted in.
    pub source: WechatId,
    /// Account that wrote the message.
    pub sender: WechatId,
    /// Logged-in account of the box that received it.
    pub receiver: WechatId,
    /// Unix seconds.
    pub timestamp: i64,
    pub kind: MessageKind,
}

impl RemoteMessage {
    pub fn text(
        id: impl Into<String>,
        source: impl Into<WechatId>,
        sender: impl Into<WechatId>,
        receiver: impl Into<WechatId>,
        timestamp: i64,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            sender: sender.into(),
            receiver: receiver.into(),
            timestamp,
            kind: MessageKind::Text {
                content: content.into(),
            },
        }
    }

    /// Text that later replies may quote, if any.
    pub fn quotable_text(&self) -> Option<&str> {
        match &self.kind {
            MessageKind::Text { content } if !content.is_empty() => Some(content),
            MessageKind::Quote { text, .. } if !text.is_empty() => Some(text),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            MessageKind::Text { .. } => "text",
            MessageKind::Picture { .. } => "picture",
            MessageKind::Quote { .. } => "quote",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chatroom_suffix_is_detected() {
        assert!(WechatId::from("12345@chatroom").is_chatroom());
        assert!(!WechatId::from("wxid_abc").is_chatroom());
    }

    #[test]
    fn null_ids() {
        assert!(WechatId::from("null").is_null());
        assert!(WechatId::default().is_null());
        assert!(!WechatId::from("wxid_a").is_null());
    }

    #[test]
    fn empty_detail_is_reported() {
        assert!(UserDetail::default().is_empty());
        let detail = UserDetail {
            signature: "hello".into(),
            ..Default::default()
        };
        assert!(!detail.is_empty());
    }

    #[test]
    fn quotable_text_skips_pictures() {
        let msg = RemoteMessage {
            kind: MessageKind::Picture {
                detail: Some("FileStorage\\Image\\a.dat".into()),
                thumb: None,
                xml: String::new(),
            },
            ..RemoteMessage::text("m1", "room@chatroom", "a", "me", 1, "")
        };
        assert_eq!(msg.quotable_text(), None);
        let msg = RemoteMessage::text("m1", "room@chatroom", "a", "me", 1, "hi");
        assert_eq!(msg.quotable_text(), Some("hi"));
    }
}
