use crate::error::FrameError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Numeric frame type codes spoken by the box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum FrameType {
    HeartBeat,
    RecvTxtMsg,
    RecvPicMsg,
    RecvTxtCiteMsg,
    UserList,
    GetUserListSuccess,
    GetUserListFail,
    TxtMsg,
    PicMsg,
    AtMsg,
    AttachFile,
    ChatroomMember,
    ChatroomMemberNick,
    PersonalInfo,
    DebugSwitch,
    PersonalDetail,
    DestroyAll,
    Other(i64),
}

impl FrameType {
    pub fn code(self) -> i64 {
        match self {
            FrameType::HeartBeat => 5005,
            FrameType::RecvTxtMsg => 1,
            FrameType::RecvPicMsg => 3,
            FrameType::RecvTxtCiteMsg => 49,
            FrameType::UserList => 5000,
            FrameType::GetUserListSuccess => 5001,
            FrameType::GetUserListFail => 5002,
            FrameType::TxtMsg => 555,
            FrameType::PicMsg => 500,
            FrameType::AtMsg => 550,
            FrameType::AttachFile => 5003,
            FrameType::ChatroomMember => 5010,
            FrameType::ChatroomMemberNick => 5020,
            FrameType::PersonalInfo => 6500,
            FrameType::DebugSwitch => 6000,
            FrameType::PersonalDetail => 6550,
            FrameType::DestroyAll => 9999,
            FrameType::Other(code) => code,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            5005 => FrameType::HeartBeat,
            1 => FrameType::RecvTxtMsg,
            3 => FrameType::RecvPicMsg,
            49 => FrameType::RecvTxtCiteMsg,
            5000 => FrameType::UserList,
            5001 => FrameType::GetUserListSuccess,
            5002 => FrameType::GetUserListFail,
            555 => FrameType::TxtMsg,
            500 => FrameType::PicMsg,
            550 => FrameType::AtMsg,
            5003 => FrameType::AttachFile,
            5010 => FrameType::ChatroomMember,
            5020 => FrameType::ChatroomMemberNick,
            6500 => FrameType::PersonalInfo,
            6000 => FrameType::DebugSwitch,
            6550 => FrameType::PersonalDetail,
            9999 => FrameType::DestroyAll,
            other => FrameType::Other(other),
        }
    }
}

impl From<i64> for FrameType {
    fn from(code: i64) -> Self {
        FrameType::from_code(code)
    }
}

impl From<FrameType> for i64 {
    fn from(frame_type: FrameType) -> Self {
        frame_type.code()
    }
}

/// A decoded frame received from the box.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub id: Option<String>,
    pub frame_type: FrameType,
    /// The `content` field, already run through the second decode pass.
    pub content: Value,
    /// The whole frame object, for the shape-specific fields (`wxid`,
    /// `id1`, `time`, ...).
    pub raw: Map<String, Value>,
}

impl Frame {
    /// Decodes a text frame.
    ///
    /// `content` is frequently a JSON document encoded as a string; when the
    /// string parses as an object or array it is replaced by the parsed value.
    /// Plain strings (including numeric-looking ones) are left alone.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, FrameError> {
        let Value::Object(mut raw) = value else {
            return Err(FrameError::NotAnObject);
        };

        let frame_type = raw
            .get("type")
            .and_then(value_as_i64)
            .map(FrameType::from_code)
            .ok_or(FrameError::MissingType)?;

        let id = raw.get("id").and_then(value_as_string);

        let content = match raw.remove("content") {
            Some(value) => decode_content(value),
            None => Value::Null,
        };
        raw.insert("content".to_string(), content.clone());

        Ok(Self {
            id,
            frame_type,
            content,
            raw,
        })
    }

    /// A string field of the frame; `"null"` and empty strings count as absent.
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.raw.get(key).and_then(non_null_str)
    }

    /// A string field inside an object `content`.
    pub fn content_field(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(non_null_str)
    }

    pub fn content_str(&self) -> Option<&str> {
        self.content.as_str()
    }

    pub fn time(&self) -> Option<&str> {
        self.str_field("time")
    }
}

/// Applies the second decode pass to a `content` value.
pub fn decode_content(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let trimmed = s.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                match serde_json::from_str::<Value>(&s) {
                    Ok(parsed @ (Value::Object(_) | Value::Array(_))) => parsed,
                    _ => Value::String(s),
                }
            } else {
                Value::String(s)
            }
        }
        other => other,
    }
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn non_null_str(value: &Value) -> Option<&str> {
    value.as_str().filter(|s| !s.is_empty() && *s != "null")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_heartbeat() {
        let frame = Frame::decode(
            r#"{"id":"20220617","type":5005,"content":"heart beat","time":"2022-06-17 10:00:00"}"#,
        )
        .unwrap();
        assert_eq!(frame.frame_type, FrameType::HeartBeat);
        assert_eq!(frame.id.as_deref(), Some("20220617"));
        assert_eq!(frame.content_str(), Some("heart beat"));
        assert_eq!(frame.time(), Some("2022-06-17 10:00:00"));
    }

    #[test]
    fn nested_json_content_is_decoded_once_more() {
        let frame = Frame::decode(
            r#"{"id":"x","type":6500,"content":"{\"wx_id\":\"wxid_me\",\"wx_name\":\"Me\"}"}"#,
        )
        .unwrap();
        assert_eq!(frame.frame_type, FrameType::PersonalInfo);
        assert_eq!(frame.content_field("wx_id"), Some("wxid_me"));
        assert_eq!(frame.raw["content"]["wx_name"], json!("Me"));
    }

    #[test]
    fn numeric_text_content_stays_a_string() {
        let frame = Frame::decode(r#"{"id":"1","type":1,"content":"123","wxid":"a"}"#).unwrap();
        assert_eq!(frame.content_str(), Some("123"));
    }

    #[test]
    fn string_type_code_is_accepted() {
        let frame = Frame::decode(r#"{"type":"49","content":{}}"#).unwrap();
        assert_eq!(frame.frame_type, FrameType::RecvTxtCiteMsg);
        assert_eq!(frame.id, None);
    }

    #[test]
    fn unknown_codes_are_preserved() {
        assert_eq!(FrameType::from_code(37), FrameType::Other(37));
        assert_eq!(FrameType::Other(37).code(), 37);
        assert_eq!(serde_json::to_value(FrameType::TxtMsg).unwrap(), json!(555));
    }

    #[test]
    fn rejects_non_objects_and_missing_type() {
        assert!(matches!(Frame::decode("[1,2]"), Err(FrameError::NotAnObject)));
        assert!(matches!(
            Frame::decode(r#"{"id":"1"}"#),
            Err(FrameError::MissingType)
        ));
        assert!(matches!(Frame::decode("{oops"), Err(FrameError::Json(_))));
    }

    #[test]
    fn null_fields_are_absent() {
        let frame = Frame::decode(r#"{"type":1,"id1":"null","wxid":"room@chatroom"}"#).unwrap();
        assert_eq!(frame.str_field("id1"), None);
        assert_eq!(frame.str_field("wxid"), Some("room@chatroom"));
    }
}
