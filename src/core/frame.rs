//! Wire frame codec
//!
//! Every WebSocket message is a concatenation of five length-prefixed fields:
//!
//! ```text
//! 00002 12 | 00036 <sender-user> | 00036 <sender-connection> | 00012 exchange/0:X | 00005 hello
//! action     sender user           sender connection          topic                 payload
//! ```
//!
//! Each prefix is exactly [`LENGTH_WIDTH`] ASCII digits holding the byte length
//! of the field that follows it. The prefix is always the actual length of the
//! field, never a constant. The payload is opaque to the codec.

use super::error::FrameError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Width of every length prefix
pub const LENGTH_WIDTH: usize = 5;

/// Largest field a 5-digit prefix can describe
pub const MAX_FIELD_LEN: usize = 99_999;

/// Actions understood by clients and the server
///
/// Codes 0..=22 are shared with the browser client; 23.. are server extensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u16)]
pub enum SocketAction {
    PingChannel = 0,
    StartStream = 1,
    StopStream = 2,
    StreamInquiry = 3,
    UnsubscribeTopic = 4,
    SubscribeTopic = 5,
    LoadMessages = 6,
    HasMoreMessages = 7,
    Subscribe = 8,
    Unsubscribe = 9,
    LoadSubscribers = 10,
    SubscribersPresent = 11,
    Text = 12,
    Rtc = 13,
    SetPosition = 14,
    SetPage = 15,
    SetScale = 16,
    SetStroke = 17,
    DrawLines = 18,
    ShareFile = 19,
    ChangeSetting = 20,
    SubscribeInit = 21,
    SetSelectedText = 22,
    Pong = 23,
    RoleCall = 24,
    Error = 25,
}

impl SocketAction {
    /// Keepalive probe sent by both sides
    pub const PING: SocketAction = SocketAction::PingChannel;

    const ALL: [SocketAction; 26] = [
        SocketAction::PingChannel,
        SocketAction::StartStream,
        SocketAction::StopStream,
        SocketAction::StreamInquiry,
        SocketAction::UnsubscribeTopic,
        SocketAction::SubscribeTopic,
        SocketAction::LoadMessages,
        SocketAction::HasMoreMessages,
        SocketAction::Subscribe,
        SocketAction::Unsubscribe,
        SocketAction::LoadSubscribers,
        SocketAction::SubscribersPresent,
        SocketAction::Text,
        SocketAction::Rtc,
        SocketAction::SetPosition,
        SocketAction::SetPage,
        SocketAction::SetScale,
        SocketAction::SetStroke,
        SocketAction::DrawLines,
        SocketAction::ShareFile,
        SocketAction::ChangeSetting,
        SocketAction::SubscribeInit,
        SocketAction::SetSelectedText,
        SocketAction::Pong,
        SocketAction::RoleCall,
        SocketAction::Error,
    ];

    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    /// Actions whose frames are appended to the topic log before fan-out
    pub fn is_store_class(self) -> bool {
        matches!(
            self,
            SocketAction::Text
                | SocketAction::SetPosition
                | SocketAction::SetPage
                | SocketAction::SetScale
                | SocketAction::SetStroke
                | SocketAction::DrawLines
                | SocketAction::ShareFile
                | SocketAction::ChangeSetting
                | SocketAction::SetSelectedText
        )
    }

    /// Actions only the server may emit
    pub fn is_server_only(self) -> bool {
        matches!(
            self,
            SocketAction::HasMoreMessages
                | SocketAction::UnsubscribeTopic
                | SocketAction::RoleCall
                | SocketAction::Error
        )
    }
}

impl fmt::Display for SocketAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

/// An owned, structured frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketMessage {
    pub action: SocketAction,
    pub sender_user: String,
    pub sender_connection: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

impl SocketMessage {
    /// A server-originated frame with empty sender fields
    pub fn new(action: SocketAction, topic: impl Into<String>) -> Self {
        Self {
            action,
            sender_user: String::new(),
            sender_connection: String::new(),
            topic: topic.into(),
            payload: Vec::new(),
        }
    }

    pub fn with_sender(mut self, user: impl Into<String>, connection: impl Into<String>) -> Self {
        self.sender_user = user.into();
        self.sender_connection = connection.into();
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Serialize `value` as the JSON payload
    pub fn with_json<T: Serialize>(self, value: &T) -> serde_json::Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(self.with_payload(payload))
    }

    pub fn payload_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        self.as_ref().encode()
    }

    pub fn decode(buf: &[u8]) -> Result<Self, FrameError> {
        FrameRef::decode(buf).map(FrameRef::into_owned)
    }

    pub fn as_ref(&self) -> FrameRef<'_> {
        FrameRef {
            action: self.action,
            sender_user: &self.sender_user,
            sender_connection: &self.sender_connection,
            topic: &self.topic,
            payload: &self.payload,
        }
    }
}

/// A frame borrowed from the buffer it was decoded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    pub action: SocketAction,
    pub sender_user: &'a str,
    pub sender_connection: &'a str,
    pub topic: &'a str,
    pub payload: &'a [u8],
}

impl<'a> FrameRef<'a> {
    /// Decode a complete frame; no copies are made
    pub fn decode(buf: &'a [u8]) -> Result<Self, FrameError> {
        let mut cursor = 0;

        let action_raw = read_str_field(buf, &mut cursor, "action")?;
        let action = action_raw
            .parse::<u16>()
            .ok()
            .and_then(SocketAction::from_code)
            .ok_or_else(|| FrameError::UnknownAction(action_raw.to_string()))?;

        let sender_user = read_str_field(buf, &mut cursor, "sender_user")?;
        let sender_connection = read_str_field(buf, &mut cursor, "sender_connection")?;
        let topic = read_str_field(buf, &mut cursor, "topic")?;
        let payload = read_field(buf, &mut cursor)?;

        if cursor != buf.len() {
            return Err(FrameError::TrailingBytes(buf.len() - cursor));
        }

        Ok(Self {
            action,
            sender_user,
            sender_connection,
            topic,
            payload,
        })
    }

    pub fn encoded_len(&self) -> usize {
        let action_len = digits(self.action.code() as usize);
        5 * LENGTH_WIDTH
            + action_len
            + self.sender_user.len()
            + self.sender_connection.len()
            + self.topic.len()
            + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut out)?;
        Ok(out)
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) -> Result<(), FrameError> {
        let action = self.action.code().to_string();
        write_field(out, "action", action.as_bytes())?;
        write_field(out, "sender_user", self.sender_user.as_bytes())?;
        write_field(out, "sender_connection", self.sender_connection.as_bytes())?;
        write_field(out, "topic", self.topic.as_bytes())?;
        write_field(out, "payload", self.payload)?;
        Ok(())
    }

    pub fn into_owned(self) -> SocketMessage {
        SocketMessage {
            action: self.action,
            sender_user: self.sender_user.to_string(),
            sender_connection: self.sender_connection.to_string(),
            topic: self.topic.to_string(),
            payload: self.payload.to_vec(),
        }
    }
}

/// Reject frames above `limit` before spending any work on them
pub fn check_frame_len(buf: &[u8], limit: usize) -> Result<(), FrameError> {
    if buf.len() > limit {
        return Err(FrameError::Oversized {
            len: buf.len(),
            limit,
        });
    }
    Ok(())
}

fn digits(mut n: usize) -> usize {
    let mut count = 1;
    while n >= 10 {
        n /= 10;
        count += 1;
    }
    count
}

fn write_field(out: &mut Vec<u8>, field: &'static str, value: &[u8]) -> Result<(), FrameError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(FrameError::FieldTooLong {
            field,
            len: value.len(),
        });
    }
    out.extend_from_slice(format!("{:0width$}", value.len(), width = LENGTH_WIDTH).as_bytes());
    out.extend_from_slice(value);
    Ok(())
}

fn read_field<'a>(buf: &'a [u8], cursor: &mut usize) -> Result<&'a [u8], FrameError> {
    let start = *cursor;
    let prefix_end = start + LENGTH_WIDTH;
    if prefix_end > buf.len() {
        return Err(FrameError::Truncated {
            offset: start,
            needed: LENGTH_WIDTH,
            available: buf.len().saturating_sub(start),
        });
    }

    let prefix = &buf[start..prefix_end];
    if !prefix.iter().all(u8::is_ascii_digit) {
        return Err(FrameError::InvalidLength { offset: start });
    }
    let len = prefix
        .iter()
        .fold(0usize, |acc, b| acc * 10 + (b - b'0') as usize);

    let value_end = prefix_end + len;
    if value_end > buf.len() {
        return Err(FrameError::Truncated {
            offset: prefix_end,
            needed: len,
            available: buf.len() - prefix_end,
        });
    }

    *cursor = value_end;
    Ok(&buf[prefix_end..value_end])
}

fn read_str_field<'a>(
    buf: &'a [u8],
    cursor: &mut usize,
    field: &'static str,
) -> Result<&'a str, FrameError> {
    let raw = read_field(buf, cursor)?;
    std::str::from_utf8(raw).map_err(|_| FrameError::InvalidUtf8 { field })
}
