//! Builders for the request envelopes understood by the box.
//!
//! The same envelope shape is used on the socket and, wrapped as
//! `{"para": envelope}`, on the HTTP action endpoints.

use crate::frame::FrameType;
use serde::Serialize;
use serde_json::{Value, json};

/// Placeholder the box expects in every unused envelope field.
pub const NULL: &str = "null";

pub const SEND_TXT_MSG_URI: &str = "api/sendtxtmsg";
pub const SEND_PIC_URI: &str = "api/sendpic";
pub const SEND_AT_MSG_URI: &str = "api/sendatmsg";
pub const SEND_ATTACH_URI: &str = "api/sendattatch";
pub const GET_CONTACT_LIST_URI: &str = "api/getcontactlist";
pub const GET_MEMBER_NICK_URI: &str = "api/getmembernick";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Envelope {
    pub id: String,
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    pub roomid: String,
    pub wxid: String,
    pub content: String,
    pub nickname: String,
    pub ext: String,
}

impl Envelope {
    pub fn new(id: impl Into<String>, frame_type: FrameType) -> Self {
        Self {
            id: id.into(),
            frame_type,
            roomid: NULL.to_string(),
            wxid: NULL.to_string(),
            content: NULL.to_string(),
            nickname: NULL.to_string(),
            ext: NULL.to_string(),
        }
    }

    pub fn with_roomid(mut self, roomid: impl Into<String>) -> Self {
        self.roomid = or_null(roomid.into());
        self
    }

    pub fn with_wxid(mut self, wxid: impl Into<String>) -> Self {
        self.wxid = or_null(wxid.into());
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = or_null(content.into());
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = or_null(nickname.into());
        self
    }

    pub fn with_ext(mut self, ext: impl Into<String>) -> Self {
        self.ext = or_null(ext.into());
        self
    }

    /// Socket representation.
    pub fn to_json(&self) -> String {
        // Serialising a struct of strings cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// HTTP action body.
    pub fn to_http_body(&self) -> Value {
        json!({ "para": self })
    }
}

fn or_null(value: String) -> String {
    if value.is_empty() {
        NULL.to_string()
    } else {
        value
    }
}

pub fn get_personal_info(id: impl Into<String>) -> Envelope {
    Envelope::new(id, FrameType::PersonalInfo).with_content("op:personal info")
}

pub fn get_personal_detail(id: impl Into<String>, wxid: &str) -> Envelope {
    Envelope::new(id, FrameType::PersonalDetail)
        .with_wxid(wxid)
        .with_content("op:personal detail")
}

pub fn get_contact_list(id: impl Into<String>) -> Envelope {
    Envelope::new(id, FrameType::UserList).with_content("user list")
}

/// Member list of one chatroom, or of every chatroom when `roomid` is `null`.
pub fn get_chatroom_member(id: impl Into<String>, roomid: &str) -> Envelope {
    Envelope::new(id, FrameType::ChatroomMember)
        .with_roomid(roomid)
        .with_content("op:list member")
}

pub fn get_chatroom_member_nick(id: impl Into<String>, roomid: &str, wxid: &str) -> Envelope {
    Envelope::new(id, FrameType::ChatroomMemberNick)
        .with_roomid(roomid)
        .with_wxid(wxid)
}

pub fn get_user_nick(id: impl Into<String>, wxid: &str) -> Envelope {
    get_chatroom_member_nick(id, NULL, wxid)
}

pub fn send_text(id: impl Into<String>, to: &str, text: &str) -> Envelope {
    Envelope::new(id, FrameType::TxtMsg)
        .with_wxid(to)
        .with_content(text)
}

pub fn send_at_text(
    id: impl Into<String>,
    roomid: &str,
    wxid: &str,
    nickname: &str,
    text: &str,
) -> Envelope {
    Envelope::new(id, FrameType::AtMsg)
        .with_roomid(roomid)
        .with_wxid(wxid)
        .with_nickname(nickname)
        .with_content(text)
}

pub fn send_picture(id: impl Into<String>, to: &str, path: &str) -> Envelope {
    Envelope::new(id, FrameType::PicMsg)
        .with_wxid(to)
        .with_content(path)
}

pub fn send_attachment(id: impl Into<String>, to: &str, path: &str) -> Envelope {
    Envelope::new(id, FrameType::AttachFile)
        .with_wxid(to)
        .with_content(path)
}
