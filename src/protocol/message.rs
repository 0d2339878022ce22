//! Message types exchanged between peers and the relay.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Message type tag. Serialized as a small integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MessageType {
    Request = 0,
    Response = 1,
    Error = 2,
    Notification = 3,
    Ping = 4,
    Pong = 5,
}

impl MessageType {
    /// True for messages that answer an earlier message with the same id.
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::Response | MessageType::Error | MessageType::Pong)
    }
}

impl MessageType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::Request),
            1 => Some(MessageType::Response),
            2 => Some(MessageType::Error),
            3 => Some(MessageType::Notification),
            4 => Some(MessageType::Ping),
            5 => Some(MessageType::Pong),
            _ => None,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(tag: u8) -> Result<Self, String> {
        MessageType::from_tag(tag).ok_or_else(|| format!("unknown message type {}", tag))
    }
}

impl From<MessageType> for u8 {
    fn from(kind: MessageType) -> u8 {
        kind as u8
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Error => "error",
            MessageType::Notification => "notification",
            MessageType::Ping => "ping",
            MessageType::Pong => "pong",
        };
        f.write_str(name)
    }
}

/// Immutable wire unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    id: String,
    from: String,
    to: String,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default)]
    payload: Vec<u8>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageType,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            kind,
            payload,
        }
    }

    /// Build a response to `request`, reusing its id and swapping the peers.
    pub fn response_to(request: &Message, from: impl Into<String>, payload: Vec<u8>) -> Self {
        Self::new(
            request.id.clone(),
            from,
            request.from.clone(),
            MessageType::Response,
            payload,
        )
    }

    /// Build an error reply to `request`.
    pub fn error_to(request: &Message, from: impl Into<String>, error: &ErrorBody) -> Self {
        // ErrorBody only holds strings; serialization cannot fail.
        let payload = serde_json::to_vec(error).unwrap_or_default();
        Self::new(
            request.id.clone(),
            from,
            request.from.clone(),
            MessageType::Error,
            payload,
        )
    }

    /// Build the pong answering a ping.
    pub fn pong_to(ping: &Message, from: impl Into<String>) -> Self {
        Self::new(
            ping.id.clone(),
            from,
            ping.from.clone(),
            MessageType::Pong,
            Vec::new(),
        )
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn from(&self) -> &str {
        &self.from
    }

    pub fn to(&self) -> &str {
        &self.to
    }

    pub fn kind(&self) -> MessageType {
        self.kind
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Payload of a request or notification addressed to a service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRequest {
    /// Full service URI, optionally with a `?k=v` query suffix.
    pub uri: String,

    /// Opaque request body.
    #[serde(default)]
    pub body: Vec<u8>,

    /// Path parameters captured by the relay (set when forwarding).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub params: HashMap<String, String>,

    /// Query parameters parsed by the relay (set when forwarding).
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub query: HashMap<String, String>,
}

impl ServiceRequest {
    pub fn new(uri: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            uri: uri.into(),
            body,
            ..Default::default()
        }
    }
}

/// Machine-readable error category carried in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    TooManyRequests,
    NotFound,
    QuotaExceeded,
    Unavailable,
    Timeout,
    Cancelled,
    Internal,
}

/// Payload of a `MessageType::Error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_reuses_request_id() {
        let req = Message::new("m-1", "alice", "relay", MessageType::Request, vec![1, 2]);
        let resp = Message::response_to(&req, "relay", vec![3]);

        assert_eq!(resp.id(), "m-1");
        assert_eq!(resp.to(), "alice");
        assert_eq!(resp.from(), "relay");
        assert_eq!(resp.kind(), MessageType::Response);
    }

    #[test]
    fn error_reply_carries_body() {
        let req = Message::new("m-2", "bob", "relay", MessageType::Request, vec![]);
        let err = Message::error_to(&req, "relay", &ErrorBody::new(ErrorCode::NotFound, "no route"));

        assert_eq!(err.kind(), MessageType::Error);
        let body: ErrorBody = serde_json::from_slice(err.payload()).unwrap();
        assert_eq!(body.code, ErrorCode::NotFound);
    }

    #[test]
    fn type_tag_is_numeric() {
        let msg = Message::new("x", "a", "b", MessageType::Pong, vec![]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], 5);

        assert!(MessageType::try_from(42).is_err());
    }
}
