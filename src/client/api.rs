//! Typed calls against the box, and the contact cache they maintain.

use super::Client;
use crate::error::ClientError;
use crate::http::HttpRequest;
use crate::types::events::Event;
use log::{debug, info, warn};
use serde_json::Value;
use wxcore::frame::decode_content;
use wxcore::query::{self, Envelope};
use wxcore::{ChatRoomNick, Frame, UserDetail, WechatId, WechatUser};

/// Account currently logged in on the box.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelfInfo {
    pub wx_id: Option<WechatId>,
    pub wx_code: String,
    pub wx_name: String,
    pub logged_in: bool,
}

impl SelfInfo {
    pub fn as_user(&self) -> Option<WechatUser> {
        let wxid = self.wx_id.clone()?;
        Some(WechatUser {
            wxid,
            name: self.wx_name.clone(),
            wxcode: self.wx_code.clone(),
            ..Default::default()
        })
    }
}

impl Client {
    /// Asks the box which account is logged in. `None` when nobody is, or
    /// when the account still waits for approval.
    pub async fn get_personal_info(&self) -> Result<Option<WechatUser>, ClientError> {
        let frame = self
            .request(query::get_personal_info(self.generate_request_id()))
            .await?;
        Ok(self.apply_personal_info(&frame).await)
    }

    pub(crate) async fn apply_personal_info(&self, frame: &Frame) -> Option<WechatUser> {
        let wx_id = frame.content_field("wx_id").map(WechatId::from);
        let wx_code = frame.content_field("wx_code").unwrap_or_default().to_string();
        let wx_name = frame.content_field("wx_name").unwrap_or_default().to_string();

        let vnc = format!("https://{}:8081/vnc.html", self.config.host);
        match (&wx_id, wx_name.is_empty()) {
            (Some(id), _) => info!(target: "Client", "User {wx_name} ({id}) logged in."),
            (None, false) => info!(
                target: "Client",
                "User {wx_name} needs approval to log in again, please go to {vnc}"
            ),
            (None, true) => info!(
                target: "Client",
                "No account logged in, please go to {vnc} to log in."
            ),
        }

        let mut info = self.self_info.write().await;
        let was_logged_in = info.logged_in;
        *info = SelfInfo {
            logged_in: wx_id.is_some(),
            wx_id,
            wx_code,
            wx_name,
        };
        let user = info.as_user().filter(|user| !user.name.is_empty());
        drop(info);

        if let Some(user) = &user {
            if !was_logged_in {
                self.emit(Event::LoggedIn(user.clone()));
            }
        }
        user
    }

    /// Marks an account as logged in without asking the box.
    pub async fn manual_login(&self, wxid: &str, wxcode: &str, wxname: &str) -> WechatUser {
        let mut info = self.self_info.write().await;
        *info = SelfInfo {
            wx_id: Some(WechatId::from(wxid)),
            wx_code: wxcode.to_string(),
            wx_name: wxname.to_string(),
            logged_in: true,
        };
        let user = WechatUser {
            wxid: WechatId::from(wxid),
            name: wxname.to_string(),
            wxcode: wxcode.to_string(),
            ..Default::default()
        };
        drop(info);
        info!(target: "Client", "Manually logged in as {wxname} ({wxid})");
        self.emit(Event::LoggedIn(user.clone()));
        user
    }

    pub async fn self_info(&self) -> SelfInfo {
        self.self_info.read().await.clone()
    }

    pub async fn own_wxid(&self) -> Option<WechatId> {
        self.self_info.read().await.wx_id.clone()
    }

    pub async fn is_logged_in(&self) -> bool {
        self.self_info.read().await.logged_in
    }

    /// Profile details of `wxid`; `None` when the box knows nothing about it.
    pub async fn get_personal_detail(
        &self,
        wxid: &WechatId,
    ) -> Result<Option<UserDetail>, ClientError> {
        let frame = self
            .request(query::get_personal_detail(
                self.generate_request_id(),
                wxid.as_str(),
            ))
            .await?;
        let detail: UserDetail = parse_content(&frame)?;
        Ok((!detail.is_empty()).then_some(detail))
    }

    /// Fetches the contact list and refreshes the cache with it.
    pub async fn get_contact_list(&self) -> Result<Vec<WechatUser>, ClientError> {
        let frame = self
            .request(query::get_contact_list(self.generate_request_id()))
            .await?;
        self.apply_contact_list(&frame);
        Ok(self.contacts())
    }

    pub(crate) fn apply_contact_list(&self, frame: &Frame) -> usize {
        let Some(entries) = frame.content.as_array() else {
            warn!(target: "Client", "Contact list frame without a list: {}", frame.content);
            return 0;
        };

        let mut count = 0;
        for entry in entries {
            let Some(wxid) = entry
                .get("wxid")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
            else {
                continue;
            };
            let field = |key: &str| {
                entry
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let wxid = WechatId::from(wxid);
            // Member lists come from a separate query; keep what we have.
            let members = self
                .contacts
                .get(&wxid)
                .and_then(|existing| existing.chat_room_members.clone());
            let contact = WechatUser {
                wxid: wxid.clone(),
                name: field("name"),
                headimg: field("headimg"),
                remarks: field("remarks"),
                wxcode: field("wxcode"),
                chat_room_members: members,
            };
            self.contacts.insert(wxid, contact);
            count += 1;
        }
        debug!(target: "Client", "Received {count} contacts");
        count
    }

    /// Members of one chatroom.
    pub async fn get_chatroom_member(
        &self,
        room: &WechatId,
    ) -> Result<Option<Vec<WechatId>>, ClientError> {
        let frame = self
            .request(query::get_chatroom_member(
                self.generate_request_id(),
                room.as_str(),
            ))
            .await?;
        Ok(self.apply_chatroom_members(&frame, Some(room)))
    }

    /// Fetches the members of every chatroom into the contact cache.
    pub async fn fetch_chatroom_members(&self) -> Result<(), ClientError> {
        let frame = self
            .request(query::get_chatroom_member(
                self.generate_request_id(),
                query::NULL,
            ))
            .await?;
        self.apply_chatroom_members(&frame, None);
        Ok(())
    }

    /// Stores member lists of cached chatrooms; returns the list of `wanted`
    /// when the frame carries it.
    pub(crate) fn apply_chatroom_members(
        &self,
        frame: &Frame,
        wanted: Option<&WechatId>,
    ) -> Option<Vec<WechatId>> {
        let rooms = frame.content.as_array()?;
        let mut found = None;
        for room in rooms {
            let Some(room_id) = room.get("room_id").and_then(Value::as_str) else {
                continue;
            };
            let members: Vec<WechatId> = room
                .get("member")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(WechatId::from)
                        .collect()
                })
                .unwrap_or_default();
            if let Some(mut contact) = self.contacts.get_mut(room_id) {
                contact.chat_room_members = Some(members.clone());
            }
            if wanted.is_some_and(|w| w.as_str() == room_id) {
                found = Some(members);
            }
        }
        found
    }

    pub async fn get_chatroom_member_nick(
        &self,
        room: &WechatId,
        wxid: &WechatId,
    ) -> Result<Option<ChatRoomNick>, ClientError> {
        let frame = self
            .request(query::get_chatroom_member_nick(
                self.generate_request_id(),
                room.as_str(),
                wxid.as_str(),
            ))
            .await?;
        let nick: ChatRoomNick = parse_content(&frame)?;
        Ok((!nick.is_empty()).then_some(nick))
    }

    pub async fn get_user_nick(&self, wxid: &WechatId) -> Result<Option<ChatRoomNick>, ClientError> {
        let frame = self
            .request(query::get_user_nick(
                self.generate_request_id(),
                wxid.as_str(),
            ))
            .await?;
        let nick: ChatRoomNick = parse_content(&frame)?;
        Ok((!nick.is_empty()).then_some(nick))
    }

    /// Cached contact, or a bare user named by a nick lookup.
    pub async fn get_user(&self, wxid: &WechatId) -> Result<WechatUser, ClientError> {
        if let Some(contact) = self.contact(wxid) {
            return Ok(contact);
        }
        let nick = self.get_user_nick(wxid).await?;
        Ok(WechatUser::new(
            wxid.clone(),
            nick.map(|n| n.nick).unwrap_or_default(),
        ))
    }

    pub fn contact(&self, wxid: &WechatId) -> Option<WechatUser> {
        self.contacts.get(wxid).map(|c| c.clone())
    }

    pub fn contacts(&self) -> Vec<WechatUser> {
        self.contacts.iter().map(|c| c.value().clone()).collect()
    }

    pub async fn send_text(&self, to: &WechatId, text: &str) -> Result<Value, ClientError> {
        let envelope = query::send_text(self.generate_request_id(), to.as_str(), text);
        self.send_http(query::SEND_TXT_MSG_URI, &envelope).await
    }

    /// Text in a chatroom that mentions `wxid`.
    pub async fn send_at_text(
        &self,
        room: &WechatId,
        wxid: &WechatId,
        nickname: &str,
        text: &str,
    ) -> Result<Value, ClientError> {
        let envelope = query::send_at_text(
            self.generate_request_id(),
            room.as_str(),
            wxid.as_str(),
            nickname,
            text,
        );
        self.send_http(query::SEND_AT_MSG_URI, &envelope).await
    }

    /// `path` is a file path as seen by the box.
    pub async fn send_picture(&self, to: &WechatId, path: &str) -> Result<Value, ClientError> {
        let envelope = query::send_picture(self.generate_request_id(), to.as_str(), path);
        self.send_http(query::SEND_PIC_URI, &envelope).await
    }

    pub async fn send_attachment(&self, to: &WechatId, path: &str) -> Result<Value, ClientError> {
        let envelope = query::send_attachment(self.generate_request_id(), to.as_str(), path);
        self.send_http(query::SEND_ATTACH_URI, &envelope).await
    }

    /// Posts `envelope` to an action endpoint and returns the decoded answer.
    pub async fn send_http(&self, uri: &str, envelope: &Envelope) -> Result<Value, ClientError> {
        let url = format!(
            "{}/{}",
            self.config.http_base(),
            uri.trim_start_matches('/')
        );
        let request = HttpRequest::post(url).with_json(&envelope.to_http_body());

        let response = tokio::time::timeout(
            self.config.http_timeout,
            self.http_client.execute(request),
        )
        .await
        .map_err(|_| ClientError::Http(format!("{uri} timed out")))?
        .map_err(|e| ClientError::Http(e.to_string()))?;

        if !response.is_success() {
            return Err(ClientError::Http(format!(
                "{uri} answered with status {}",
                response.status_code
            )));
        }
        let mut value: Value = response
            .json()
            .map_err(|e| ClientError::Protocol(format!("bad answer from {uri}: {e}")))?;
        if let Some(content) = value.get_mut("content") {
            *content = decode_content(content.take());
        }
        Ok(value)
    }
}

fn parse_content<T: serde::de::DeserializeOwned + Default>(frame: &Frame) -> Result<T, ClientError> {
    match &frame.content {
        Value::Null => Ok(T::default()),
        content => serde_json::from_value(content.clone())
            .map_err(|e| ClientError::Protocol(format!("unexpected content: {e}"))),
    }
}
