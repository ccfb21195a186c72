//! Translation between remote messages and local message content.

use crate::containers::SizedMap;
use serde::{Deserialize, Serialize};
use wxcore::{MessageKind, RemoteMessage, WechatId};

/// Remembered remote messages that later replies may quote.
pub const QUOTE_CACHE_SIZE: usize = 100;

/// `(sender, source, text)` of a delivered message.
pub type QuoteKey = (WechatId, WechatId, String);

/// Maps recently delivered texts to the local event they became.
pub type QuoteCache = SizedMap<QuoteKey, String>;

pub fn quote_key(sender: &WechatId, source: &WechatId, text: &str) -> QuoteKey {
    (sender.clone(), source.clone(), text.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "m.text")]
    Text,
    #[serde(rename = "m.notice")]
    Notice,
    #[serde(rename = "m.emote")]
    Emote,
    #[serde(rename = "m.image")]
    Image,
    #[serde(rename = "m.file")]
    File,
    #[serde(other)]
    Unknown,
}

impl MessageType {
    /// Types the remote side can receive as text.
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            MessageType::Text | MessageType::Notice | MessageType::Emote
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mimetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InReplyTo {
    pub event_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatesTo {
    #[serde(
        rename = "m.in_reply_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub in_reply_to: Option<InReplyTo>,
}

/// Body of a local `m.room.message` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalContent {
    pub msgtype: MessageType,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<MediaInfo>,
    #[serde(
        rename = "m.relates_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub relates_to: Option<RelatesTo>,
}

impl LocalContent {
    fn new(msgtype: MessageType, body: impl Into<String>) -> Self {
        Self {
            msgtype,
            body: body.into(),
            format: None,
            formatted_body: None,
            url: None,
            info: None,
            relates_to: None,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        Self::new(MessageType::Text, body)
    }

    pub fn notice(body: impl Into<String>) -> Self {
        Self::new(MessageType::Notice, body)
    }

    pub fn emote(body: impl Into<String>) -> Self {
        Self::new(MessageType::Emote, body)
    }

    pub fn image(body: impl Into<String>, url: impl Into<String>, info: MediaInfo) -> Self {
        let mut content = Self::new(MessageType::Image, body);
        content.url = Some(url.into());
        content.info = Some(info);
        content
    }

    pub fn with_reply_to(mut self, event_id: impl Into<String>) -> Self {
        self.relates_to = Some(RelatesTo {
            in_reply_to: Some(InReplyTo {
                event_id: event_id.into(),
            }),
        });
        self
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.relates_to
            .as_ref()
            .and_then(|r| r.in_reply_to.as_ref())
            .map(|r| r.event_id.as_str())
    }
}

/// What the formatter needs to know about the conversation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PortalContext {
    pub is_direct: bool,
}

/// Renders an inbound message for the local side. Pictures need file access
/// and are uploaded by the portal; this only yields their placeholder.
pub fn to_local_content(
    msg: &RemoteMessage,
    ctx: PortalContext,
    quotes: &QuoteCache,
) -> LocalContent {
    match &msg.kind {
        MessageKind::Text { content } => LocalContent::text(content.clone()),
        MessageKind::Picture { .. } => LocalContent::notice("[Picture]"),
        MessageKind::Quote { text, quoted } => {
            let Some(quoted) = quoted else {
                return LocalContent::text(text.clone());
            };
            let key = quote_key(&quoted.sender, &quoted.source, &quoted.content);
            match quotes.get(&key) {
                Some(event_id) => LocalContent::text(text.clone()).with_reply_to(event_id.clone()),
                None => {
                    let who = if ctx.is_direct || quoted.display_name.is_empty() {
                        String::new()
                    } else {
                        format!("{}: ", quoted.display_name)
                    };
                    let cited = quoted.content.replace('\n', "\n> ");
                    LocalContent::text(format!("> {who}{cited}\n\n{text}"))
                }
            }
        }
    }
}

/// Text to send to the remote side, plus who the local event replied to
/// when its reply fallback named them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteText {
    pub text: String,
    pub reply_hint: Option<String>,
}

/// Renders local content for the remote side. `sender_name` is set when a
/// relay sends on someone's behalf and their name should be shown.
pub fn to_remote_text(content: &LocalContent, sender_name: Option<&str>) -> RemoteText {
    let (body, reply_hint) = if content.reply_to().is_some() {
        strip_reply_fallback(&content.body)
    } else {
        (content.body.as_str(), None)
    };

    let text = match (content.msgtype, sender_name) {
        (MessageType::Emote, Some(name)) => format!("* {name} {body}"),
        (MessageType::Emote, None) => format!("* {body}"),
        (_, Some(name)) => format!("{name}: {body}"),
        (_, None) => body.to_string(),
    };
    RemoteText { text, reply_hint }
}

/// Splits the `> <@user:server> quoted` lines a reply body starts with off
/// the actual reply.
fn strip_reply_fallback(body: &str) -> (&str, Option<String>) {
    if !body.starts_with('>') {
        return (body, None);
    }
    let hint = body
        .lines()
        .next()
        .and_then(|first| first.strip_prefix("> <"))
        .and_then(|rest| rest.split_once('>'))
        .map(|(user, _)| user.to_string());

    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        if !line.starts_with('>') {
            break;
        }
        offset += line.len();
    }
    let rest = &body[offset..];
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    (rest, hint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wxcore::QuotedMessage;

    fn quote_msg(quoted: QuotedMessage) -> RemoteMessage {
        RemoteMessage {
            kind: MessageKind::Quote {
                text: "agreed".to_string(),
                quoted: Some(quoted),
            },
            ..RemoteMessage::text("m2", "room1@chatroom", "userB", "acct1", 1001, "")
        }
    }

    fn quoted() -> QuotedMessage {
        QuotedMessage {
            sender: "userA".into(),
            source: "room1@chatroom".into(),
            display_name: "Alice".to_string(),
            content: "lunch?".to_string(),
        }
    }

    #[test]
    fn text_becomes_plain_text() {
        let msg = RemoteMessage::text("m1", "room1@chatroom", "userA", "acct1", 1000, "hi");
        let content = to_local_content(&msg, PortalContext::default(), &QuoteCache::new(10));
        assert_eq!(content, LocalContent::text("hi"));
    }

    #[test]
    fn known_quote_becomes_reply() {
        let mut cache = QuoteCache::new(10);
        cache.insert(
            quote_key(&"userA".into(), &"room1@chatroom".into(), "lunch?"),
            "$ev1".to_string(),
        );
        let content = to_local_content(&quote_msg(quoted()), PortalContext::default(), &cache);
        assert_eq!(content.body, "agreed");
        assert_eq!(content.reply_to(), Some("$ev1"));
    }

    #[test]
    fn unknown_quote_is_inlined() {
        let cache = QuoteCache::new(10);
        let content = to_local_content(&quote_msg(quoted()), PortalContext::default(), &cache);
        assert_eq!(content.body, "> Alice: lunch?\n\nagreed");
        assert_eq!(content.reply_to(), None);

        let direct = to_local_content(
            &quote_msg(quoted()),
            PortalContext { is_direct: true },
            &cache,
        );
        assert_eq!(direct.body, "> lunch?\n\nagreed");
    }

    #[test]
    fn relay_prefixes_sender() {
        let plain = to_remote_text(&LocalContent::text("hello"), Some("Bob"));
        assert_eq!(plain.text, "Bob: hello");
        let emote = to_remote_text(&LocalContent::emote("waves"), Some("Bob"));
        assert_eq!(emote.text, "* Bob waves");
        assert_eq!(to_remote_text(&LocalContent::notice("hey"), None).text, "hey");
    }

    #[test]
    fn reply_fallback_is_stripped() {
        let content =
            LocalContent::text("> <@alice:hs.local> lunch?\n> second line\n\nsure").with_reply_to("$ev1");
        let remote = to_remote_text(&content, None);
        assert_eq!(remote.text, "sure");
        assert_eq!(remote.reply_hint.as_deref(), Some("@alice:hs.local"));

        // Without a reply relation quoted lines are the user's own text.
        let plain = to_remote_text(&LocalContent::text("> not a reply"), None);
        assert_eq!(plain.text, "> not a reply");
    }

    #[test]
    fn serializes_in_wire_shape() {
        let content = LocalContent::text("hi").with_reply_to("$ev1");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value["msgtype"], "m.text");
        assert_eq!(value["m.relates_to"]["m.in_reply_to"]["event_id"], "$ev1");
        assert!(value.get("url").is_none());

        let parsed: LocalContent =
            serde_json::from_str(r#"{"msgtype":"m.location","body":"here"}"#).unwrap();
        assert_eq!(parsed.msgtype, MessageType::Unknown);
    }
}
