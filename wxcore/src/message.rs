//! Normalisation of the three inbound message frame shapes into
//! [`RemoteMessage`].

use crate::appmsg::parse_appmsg;
use crate::frame::{Frame, FrameType};
use crate::time::box_time_or_now;
use crate::types::{MessageKind, RemoteMessage, WechatId};
use log::debug;

/// Converts an inbound message frame. Returns `None` for frames that are not
/// messages or that lack the fields needed to place them in a conversation.
///
/// `receiver` is the logged-in account of the box that produced the frame.
pub fn parse_message(frame: &Frame, receiver: &WechatId) -> Option<RemoteMessage> {
    match frame.frame_type {
        FrameType::RecvTxtMsg => parse_text(frame, receiver),
        FrameType::RecvPicMsg => parse_picture(frame, receiver),
        FrameType::RecvTxtCiteMsg => parse_cite(frame, receiver),
        _ => None,
    }
}

/// Plain text: the conversation is `wxid`, the author is `id1` inside a
/// chatroom and `wxid` otherwise.
fn parse_text(frame: &Frame, receiver: &WechatId) -> Option<RemoteMessage> {
    let source = frame.str_field("wxid")?;
    let sender = frame.str_field("id1").unwrap_or(source);
    let content = frame.content_str().unwrap_or_default().to_string();
    Some(RemoteMessage {
        id: frame.id.clone().unwrap_or_default(),
        source: WechatId::from(source),
        sender: WechatId::from(sender),
        receiver: receiver.clone(),
        timestamp: box_time_or_now(frame.time()),
        kind: MessageKind::Text { content },
    })
}

/// Pictures and quotes carry an object `content` with `id1` as the
/// conversation and `id2` as the author.
fn object_coordinates(frame: &Frame) -> Option<(WechatId, WechatId)> {
    let source = frame.content_field("id1")?;
    let sender = frame.content_field("id2").unwrap_or(source);
    Some((WechatId::from(source), WechatId::from(sender)))
}

fn parse_picture(frame: &Frame, receiver: &WechatId) -> Option<RemoteMessage> {
    let (source, sender) = object_coordinates(frame)?;
    Some(RemoteMessage {
        id: frame.id.clone().unwrap_or_default(),
        source,
        sender,
        receiver: receiver.clone(),
        timestamp: box_time_or_now(frame.time()),
        kind: MessageKind::Picture {
            detail: frame.content_field("detail").map(str::to_string),
            thumb: frame.content_field("thumb").map(str::to_string),
            xml: frame
                .content_field("content")
                .unwrap_or_default()
                .to_string(),
        },
    })
}

fn parse_cite(frame: &Frame, receiver: &WechatId) -> Option<RemoteMessage> {
    let (source, sender) = object_coordinates(frame)?;
    let xml = frame.content_field("content").unwrap_or_default();
    let kind = match parse_appmsg(xml) {
        Ok(appmsg) => MessageKind::Quote {
            quoted: appmsg.quoted(),
            text: appmsg.title,
        },
        Err(e) => {
            debug!(target: "Frame", "Cite message without usable appmsg: {e}");
            MessageKind::Quote {
                text: xml.to_string(),
                quoted: None,
            }
        }
    };
    Some(RemoteMessage {
        id: frame.id.clone().unwrap_or_default(),
        source,
        sender,
        receiver: receiver.clone(),
        timestamp: box_time_or_now(frame.time()),
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn me() -> WechatId {
        WechatId::from("wxid_me")
    }

    fn frame(value: serde_json::Value) -> Frame {
        Frame::from_value(value).unwrap()
    }

    #[test]
    fn group_text_uses_id1_as_sender() {
        let f = frame(json!({
            "id": "m1", "type": 1, "wxid": "room1@chatroom", "id1": "wxid_a",
            "content": "hi", "time": "1970-01-01 00:16:40"
        }));
        let msg = parse_message(&f, &me()).unwrap();
        assert_eq!(msg.source.as_str(), "room1@chatroom");
        assert_eq!(msg.sender.as_str(), "wxid_a");
        assert_eq!(msg.receiver, me());
        assert_eq!(msg.timestamp, 1000);
        assert_eq!(msg.kind, MessageKind::Text { content: "hi".into() });
    }

    #[test]
    fn private_text_falls_back_to_wxid() {
        let f = frame(json!({
            "id": "m2", "type": 1, "wxid": "wxid_b", "id1": "null", "content": "yo"
        }));
        let msg = parse_message(&f, &me()).unwrap();
        assert_eq!(msg.sender.as_str(), "wxid_b");
        assert_eq!(msg.source.as_str(), "wxid_b");
    }

    #[test]
    fn picture_keeps_relative_paths() {
        let f = frame(json!({
            "id": "p1", "type": 3, "time": "1970-01-01 00:00:10",
            "content": {
                "id1": "room1@chatroom", "id2": "wxid_a",
                "detail": "wxid_me\\FileStorage\\Image\\x.dat",
                "thumb": "wxid_me\\FileStorage\\Image\\Thumb\\x.dat",
                "content": "<msg><img aeskey=\"k\"/></msg>"
            }
        }));
        let msg = parse_message(&f, &me()).unwrap();
        assert_eq!(msg.sender.as_str(), "wxid_a");
        match msg.kind {
            MessageKind::Picture { detail, thumb, xml } => {
                assert!(detail.unwrap().ends_with("x.dat"));
                assert!(thumb.is_some());
                assert!(xml.contains("aeskey"));
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn cite_reads_title_and_reference() {
        let xml = "<msg><appmsg><title>agreed</title><refermsg><fromusr>room1@chatroom</fromusr>\
                   <chatusr>wxid_c</chatusr><content>plan?</content></refermsg></appmsg></msg>";
        let f = frame(json!({
            "id": "c1", "type": 49,
            "content": { "id1": "room1@chatroom", "id2": "wxid_a", "content": xml }
        }));
        let msg = parse_message(&f, &me()).unwrap();
        match msg.kind {
            MessageKind::Quote { text, quoted } => {
                assert_eq!(text, "agreed");
                let quoted = quoted.unwrap();
                assert_eq!(quoted.sender.as_str(), "wxid_c");
                assert_eq!(quoted.content, "plan?");
            }
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn frames_without_coordinates_are_skipped() {
        let f = frame(json!({"id": "x", "type": 49, "content": "not an object"}));
        assert!(parse_message(&f, &me()).is_none());
        let f = frame(json!({"id": "x", "type": 5005, "content": "heart beat"}));
        assert!(parse_message(&f, &me()).is_none());
    }
}
