use std::fmt;
use std::io;

use crate::types::EntityId;

#[derive(Debug)]
pub enum NetworkError {
    InvalidArgument(String),
    Io(io::Error),
    Bind { addr: String, source: io::Error },
    ConnectionFailed(String),
    ConnectionClosed,
    UnknownDestination(EntityId),
    SendToSelf,
    SendQueueFull,
    MessageTooLarge(u32),
    Serialization(postcard::Error),
    UnknownMessageType(u32),
    ContentMismatch {
        msg_type: u32,
        expected: &'static str,
        got: &'static str,
    },
    FrameNotReady,
    HandshakeFailed(String),
    HandshakeTimeout,
    Internal(String),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Self::Io(err) => write!(f, "IO error: {err}"),
            Self::Bind { addr, source } => write!(f, "cannot bind {addr}: {source}"),
            Self::ConnectionFailed(msg) => write!(f, "connection failed: {msg}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::UnknownDestination(id) => write!(f, "no route to entity {id}"),
            Self::SendToSelf => write!(f, "sending to myself is not supported"),
            Self::SendQueueFull => write!(f, "send queue full"),
            Self::MessageTooLarge(size) => write!(f, "message too large: {size} bytes"),
            Self::Serialization(err) => write!(f, "serialization error: {err}"),
            Self::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
            Self::ContentMismatch {
                msg_type,
                expected,
                got,
            } => write!(
                f,
                "content mismatch for message type {msg_type}: expected {expected}, got {got}"
            ),
            Self::FrameNotReady => write!(f, "no complete frame available"),
            Self::HandshakeFailed(msg) => write!(f, "handshake failed: {msg}"),
            Self::HandshakeTimeout => write!(f, "handshake timeout"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Bind { source, .. } => Some(source),
            Self::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for NetworkError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<postcard::Error> for NetworkError {
    fn from(err: postcard::Error) -> Self {
        Self::Serialization(err)
    }
}
