//! JSON codec for messages and their payloads.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::message::Message;

/// Encoding or decoding failure.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode(message: &Message) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(CodecError::Encode)
}

pub fn decode(frame: &[u8]) -> Result<Message, CodecError> {
    serde_json::from_slice(frame).map_err(CodecError::Decode)
}

pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(payload).map_err(CodecError::Decode)
}

#[derive(Deserialize)]
struct IdOnly {
    id: String,
}

/// Best-effort extraction of the id from a frame that failed to decode.
pub fn peek_id(frame: &[u8]) -> Option<String> {
    serde_json::from_slice::<IdOnly>(frame).ok().map(|m| m.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageType;

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode(b"null").is_err());
        assert!(decode(b"{\"id\":\"a\"}").is_err());
    }

    #[test]
    fn peek_id_on_partial_message() {
        assert_eq!(peek_id(br#"{"id":"abc","type":99}"#), Some("abc".to_string()));
        assert_eq!(peek_id(b"not json"), None);
    }

    #[test]
    fn encode_decode_preserves_fields() {
        let msg = Message::new("7", "a", "b", MessageType::Notification, b"hi".to_vec());
        let back = decode(&encode(&msg).unwrap()).unwrap();
        assert_eq!(back, msg);
    }
}
