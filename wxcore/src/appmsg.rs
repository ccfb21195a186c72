//! Extraction of the few fields the bridge needs from the box's `<msg>` XML
//! payloads (quote replies and picture metadata).

use crate::error::AppMsgError;
use crate::types::{QuotedMessage, WechatId};
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;

/// The parts of an `<appmsg>` payload the bridge renders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppMsg {
    pub title: String,
    pub msg_type: Option<i64>,
    pub refer: Option<ReferMsg>,
}

/// `<refermsg>` block of a quote reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferMsg {
    pub svrid: String,
    pub fromusr: String,
    pub chatusr: String,
    pub displayname: String,
    pub content: String,
}

impl ReferMsg {
    /// `chatusr` names the author inside a chatroom; in a private chat only
    /// `fromusr` is filled and it is both author and conversation.
    pub fn to_quoted(&self) -> QuotedMessage {
        let source = WechatId::new(self.fromusr.clone());
        let sender = if self.chatusr.is_empty() {
            source.clone()
        } else {
            WechatId::new(self.chatusr.clone())
        };
        QuotedMessage {
            sender,
            source,
            display_name: self.displayname.clone(),
            content: self.content.clone(),
        }
    }
}

impl AppMsg {
    pub fn quoted(&self) -> Option<QuotedMessage> {
        self.refer.as_ref().map(ReferMsg::to_quoted)
    }
}

/// Walks the document keeping the element path, so that `<title>` inside
/// `<refermsg>` is not confused with the reply's own title.
pub fn parse_appmsg(xml: &str) -> Result<AppMsg, AppMsgError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut msg = AppMsg::default();
    let mut refer: Option<ReferMsg> = None;
    let mut title: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = element_name(&e);
                if name == "refermsg" {
                    refer.get_or_insert_with(ReferMsg::default);
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| AppMsgError::Xml(e.to_string()))?
                    .into_owned();
                apply_text(&path, text, &mut title, &mut msg, &mut refer);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c.into_inner()).into_owned();
                apply_text(&path, text, &mut title, &mut msg, &mut refer);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(AppMsgError::Xml(e.to_string())),
        }
    }

    msg.title = title.ok_or(AppMsgError::MissingTitle)?;
    msg.refer = refer;
    Ok(msg)
}

fn apply_text(
    path: &[String],
    text: String,
    title: &mut Option<String>,
    msg: &mut AppMsg,
    refer: &mut Option<ReferMsg>,
) {
    let Some(leaf) = path.last() else {
        return;
    };
    let in_refer = path.iter().any(|p| p == "refermsg");
    if in_refer {
        let Some(refer) = refer.as_mut() else {
            return;
        };
        match leaf.as_str() {
            "svrid" => refer.svrid = text,
            "fromusr" => refer.fromusr = text,
            "chatusr" => refer.chatusr = text,
            "displayname" => refer.displayname = text,
            "content" => refer.content = text,
            _ => {}
        }
        return;
    }
    let parent = path.len().checked_sub(2).and_then(|i| path.get(i));
    if parent.map(String::as_str) != Some("appmsg") {
        return;
    }
    match leaf.as_str() {
        "title" if title.is_none() => *title = Some(text),
        "type" => msg.msg_type = text.trim().parse().ok(),
        _ => {}
    }
}

/// The `aeskey` attribute of the `<img>` element in a picture payload.
pub fn image_aeskey(xml: &str) -> Result<Option<String>, AppMsgError> {
    let mut reader = Reader::from_str(xml);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if element_name(&e) == "img" => {
                for attr in e.attributes() {
                    let attr = attr.map_err(|e| AppMsgError::Xml(e.to_string()))?;
                    if attr.key.as_ref() == b"aeskey" {
                        let value = attr
                            .unescape_value()
                            .map_err(|e| AppMsgError::Xml(e.to_string()))?;
                        return Ok(Some(value.into_owned()));
                    }
                }
                return Ok(None);
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(AppMsgError::Xml(e.to_string())),
        }
    }
}

fn element_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP_QUOTE: &str = r#"<?xml version="1.0"?>
<msg>
  <appmsg appid="" sdkver="0">
    <title>sounds good</title>
    <type>57</type>
    <refermsg>
      <type>1</type>
      <svrid>4242</svrid>
      <fromusr>room1@chatroom</fromusr>
      <chatusr>wxid_alice</chatusr>
      <displayname>Alice</displayname>
      <content>lunch at noon?</content>
    </refermsg>
  </appmsg>
</msg>"#;

    #[test]
    fn parses_group_quote() {
        let msg = parse_appmsg(GROUP_QUOTE).unwrap();
        assert_eq!(msg.title, "sounds good");
        assert_eq!(msg.msg_type, Some(57));
        let quoted = msg.quoted().unwrap();
        assert_eq!(quoted.sender.as_str(), "wxid_alice");
        assert_eq!(quoted.source.as_str(), "room1@chatroom");
        assert_eq!(quoted.display_name, "Alice");
        assert_eq!(quoted.content, "lunch at noon?");
    }

    #[test]
    fn private_quote_uses_fromusr_as_sender() {
        let xml = "<msg><appmsg><title>ok</title><refermsg><fromusr>wxid_bob</fromusr>\
                   <content>hi</content></refermsg></appmsg></msg>";
        let quoted = parse_appmsg(xml).unwrap().quoted().unwrap();
        assert_eq!(quoted.sender.as_str(), "wxid_bob");
        assert_eq!(quoted.source.as_str(), "wxid_bob");
    }

    #[test]
    fn escaped_and_cdata_text() {
        let xml = "<msg><appmsg><title><![CDATA[a < b]]></title></appmsg></msg>";
        assert_eq!(parse_appmsg(xml).unwrap().title, "a < b");
        let xml = "<msg><appmsg><title>fish &amp; chips</title></appmsg></msg>";
        assert_eq!(parse_appmsg(xml).unwrap().title, "fish & chips");
    }

    #[test]
    fn missing_title_is_an_error() {
        let xml = "<msg><appmsg><type>5</type></appmsg></msg>";
        assert!(matches!(parse_appmsg(xml), Err(AppMsgError::MissingTitle)));
    }

    #[test]
    fn finds_image_aeskey() {
        let xml = r#"<msg><img aeskey="abc123" length="100" /></msg>"#;
        assert_eq!(image_aeskey(xml).unwrap().as_deref(), Some("abc123"));
        assert_eq!(image_aeskey("<msg><img/></msg>").unwrap(), None);
    }
}
