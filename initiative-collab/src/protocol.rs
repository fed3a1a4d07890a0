//! Binary framing for the document collaboration socket.
//!
//! Wire format:
//! ```text
//! ┌──────────┬──────────────────────┐
//! │ msg_type │ payload              │
//! │ 1 byte   │ 0..N bytes           │
//! └──────────┴──────────────────────┘
//! ```
//!
//! | type | meaning        | payload                                  |
//! |------|----------------|------------------------------------------|
//! | 0    | sync request   | empty                                    |
//! | 1    | sync response  | full document state, empty if none yet   |
//! | 2    | update         | incremental document change              |
//! | 3    | presence       | UTF-8 JSON object                        |
//!
//! Framing is pure: no state, no allocation beyond the output buffer.

use serde::Serialize;
use thiserror::Error;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    /// Handshake step 1: ask the peer for its full state
    SyncRequest = 0,
    /// Handshake step 2: full document state
    SyncResponse = 1,
    /// Incremental document update
    Update = 2,
    /// Presence / awareness (JSON)
    Presence = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        match byte {
            0 => Ok(Self::SyncRequest),
            1 => Ok(Self::SyncResponse),
            2 => Ok(Self::Update),
            3 => Ok(Self::Presence),
            other => Err(ProtocolError::UnknownMessageType(other)),
        }
    }
}

/// Prepend the type byte to `payload`.
pub fn encode(msg_type: MessageType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    frame.push(msg_type as u8);
    frame.extend_from_slice(payload);
    frame
}

/// Split a frame into its type and a borrowed payload.
pub fn decode(frame: &[u8]) -> Result<(MessageType, &[u8]), ProtocolError> {
    let (&type_byte, payload) = frame.split_first().ok_or(ProtocolError::MalformedFrame)?;
    Ok((MessageType::try_from(type_byte)?, payload))
}

/// An owned protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self { msg_type, payload }
    }

    /// Handshake step 1. Always carries an empty payload.
    pub fn sync_request() -> Self {
        Self::new(MessageType::SyncRequest, Vec::new())
    }

    /// Handshake step 2 carrying a full state snapshot.
    pub fn sync_response(state: Vec<u8>) -> Self {
        Self::new(MessageType::SyncResponse, state)
    }

    /// Incremental document update.
    pub fn update(update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, update)
    }

    /// Presence frame with a JSON-encoded body.
    pub fn presence<T: Serialize + ?Sized>(body: &T) -> Result<Self, ProtocolError> {
        Ok(Self::new(MessageType::Presence, serde_json::to_vec(body)?))
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        encode(self.msg_type, &self.payload)
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg_type, payload) = decode(bytes)?;
        Ok(Self::new(msg_type, payload.to_vec()))
    }
}

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: empty")]
    MalformedFrame,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("presence payload: {0}")]
    Presence(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_TYPES: [MessageType; 4] = [
        MessageType::SyncRequest,
        MessageType::SyncResponse,
        MessageType::Update,
        MessageType::Presence,
    ];

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncRequest as u8, 0);
        assert_eq!(MessageType::SyncResponse as u8, 1);
        assert_eq!(MessageType::Update as u8, 2);
        assert_eq!(MessageType::Presence as u8, 3);
    }

    #[test]
    fn test_roundtrip_every_type() {
        let payloads: [&[u8]; 3] = [&[], &[7], &[0xFF; 300]];
        for msg_type in ALL_TYPES {
            for payload in payloads {
                let frame = encode(msg_type, payload);
                assert_eq!(frame.len(), payload.len() + 1);
                assert_eq!(decode(&frame).unwrap(), (msg_type, payload));
            }
        }
    }

    #[test]
    fn test_decode_empty_is_malformed() {
        assert!(matches!(decode(&[]), Err(ProtocolError::MalformedFrame)));
        assert!(matches!(Frame::decode(&[]), Err(ProtocolError::MalformedFrame)));
    }

    #[test]
    fn test_decode_unknown_type() {
        assert!(matches!(
            decode(&[9, 1, 2]),
            Err(ProtocolError::UnknownMessageType(9))
        ));
    }

    #[test]
    fn test_sync_request_is_single_byte() {
        assert_eq!(Frame::sync_request().encode(), vec![0]);
    }

    #[test]
    fn test_type_only_frame_has_empty_payload() {
        let frame = Frame::decode(&[1]).unwrap();
        assert_eq!(frame.msg_type, MessageType::SyncResponse);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_presence_frame_is_json() {
        let body = serde_json::json!({ "name": "Ada", "cursor": null });
        let frame = Frame::presence(&body).unwrap();
        let bytes = frame.encode();

        assert_eq!(bytes[0], 3);
        let parsed: serde_json::Value = serde_json::from_slice(&bytes[1..]).unwrap();
        assert_eq!(parsed, body);
    }

    #[test]
    fn test_large_update() {
        let update = vec![42u8; 65536];
        let decoded = Frame::decode(&Frame::update(update.clone()).encode()).unwrap();
        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.payload, update);
    }
}
