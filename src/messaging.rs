//! Frame definition and helpers to turn protocol messages into frames
//! and back.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::NetworkError;
use crate::protocol::{Message, msg_types};
use crate::types::EntityId;

/// Size of the frame header: message type, sender id and payload size,
/// each a big-endian `u32`.
pub const HEADER_SIZE: usize = 12;

/// One unit of the wire protocol, as written by `FrameCodec` and read
/// back by `FrameReader`.
///
/// - `msg_type` selects the action. The first frame of a connection is
///   always a `HANDSHAKE`, which shares type 0 with identity messages.
/// - `sender` is the entity that wrote the frame on this link, which is
///   not necessarily the originator of the message it carries.
/// - `payload` holds the postcard encoding of a `Message` or, for
///   handshakes, of a bare id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub msg_type: u32,
    pub sender: EntityId,
    pub payload: Bytes,
}

impl Frame {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, NetworkError> {
        postcard::from_bytes(&self.payload).map_err(NetworkError::Serialization)
    }
}

fn encode_payload<T: Serialize>(
    msg_type: u32,
    sender: EntityId,
    value: &T,
    max_message_size: u32,
) -> Result<Frame, NetworkError> {
    let payload = postcard::to_allocvec(value)?;

    if payload.len() as u64 > u64::from(max_message_size) {
        return Err(NetworkError::MessageTooLarge(
            u32::try_from(payload.len()).unwrap_or(u32::MAX),
        ));
    }

    Ok(Frame {
        msg_type,
        sender,
        payload: Bytes::from(payload),
    })
}

/// Serialize a protocol message into a frame of the given type.
pub fn encode_message(
    msg_type: u32,
    sender: EntityId,
    msg: &Message,
    max_message_size: u32,
) -> Result<Frame, NetworkError> {
    encode_payload(msg_type, sender, msg, max_message_size)
}

pub fn decode_message(frame: &Frame) -> Result<Message, NetworkError> {
    frame.decode()
}

/// Build the first frame of a connection, carrying a single id.
pub fn encode_handshake(sender: EntityId, id: EntityId) -> Result<Frame, NetworkError> {
    encode_payload(msg_types::HANDSHAKE, sender, &id, u32::MAX)
}

pub fn decode_handshake(frame: &Frame) -> Result<EntityId, NetworkError> {
    if frame.msg_type != msg_types::HANDSHAKE {
        return Err(NetworkError::HandshakeFailed(format!(
            "expected handshake, got message type {}",
            frame.msg_type
        )));
    }
    frame.decode()
}
