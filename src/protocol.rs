use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::EntityId;

/// The algorithms run by servers, in the order that fixes their message
/// type ranges.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ServerAlgorithm {
    Topology = 0,
    Election = 1,
    Mutex = 2,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ClientAlgorithm {
    Chat = 0,
}

pub const OFFSET_SERVER_ALGORITHMS: u32 = 0;
pub const OFFSET_CLIENT_ALGORITHMS: u32 = 1000;
pub const NB_MAX_ACTIONS_PER_ALGORITHM: u32 = 20;

pub const fn action_number(offset: u32, algorithm: u32, action: u32) -> u32 {
    offset + algorithm * NB_MAX_ACTIONS_PER_ALGORITHM + action
}

pub mod msg_types {
    use super::{
        ClientAlgorithm, OFFSET_CLIENT_ALGORITHMS, OFFSET_SERVER_ALGORITHMS, ServerAlgorithm,
        action_number,
    };

    /// First frame on every connection: the peer's server id on server
    /// links, the minted client id on client links.
    pub const HANDSHAKE: u32 = 0;

    pub const IDENTITY: u32 =
        action_number(OFFSET_SERVER_ALGORITHMS, ServerAlgorithm::Topology as u32, 0);
    pub const ELECTION_TOKEN: u32 =
        action_number(OFFSET_SERVER_ALGORITHMS, ServerAlgorithm::Election as u32, 0);
    pub const ELECTION_LEADER: u32 =
        action_number(OFFSET_SERVER_ALGORITHMS, ServerAlgorithm::Election as u32, 1);
    pub const MUTEX_REQUEST: u32 =
        action_number(OFFSET_SERVER_ALGORITHMS, ServerAlgorithm::Mutex as u32, 0);
    pub const MUTEX_SEND_TOKEN: u32 =
        action_number(OFFSET_SERVER_ALGORITHMS, ServerAlgorithm::Mutex as u32, 1);
    pub const CHAT: u32 = action_number(OFFSET_CLIENT_ALGORITHMS, ClientAlgorithm::Chat as u32, 0);

    pub const fn is_client_type(msg_type: u32) -> bool {
        msg_type >= OFFSET_CLIENT_ALGORITHMS
    }
}

/// Token of the mutual exclusion algorithm: for every server, the request
/// number of its last satisfied request.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MutexToken {
    entries: BTreeMap<EntityId, u64>,
}

impl MutexToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, id: EntityId) -> u64 {
        self.entries.get(&id).copied().unwrap_or(0)
    }

    pub fn set_entry(&mut self, id: EntityId, value: u64) {
        self.entries.insert(id, value);
    }

    pub fn entries(&self) -> &BTreeMap<EntityId, u64> {
        &self.entries
    }
}

impl<const N: usize> From<[(u32, u64); N]> for MutexToken {
    fn from(entries: [(u32, u64); N]) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(id, v)| (EntityId::new(id), v))
                .collect(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Content {
    Identity,
    ElectionToken { initiator: EntityId },
    ElectionLeader { initiator: EntityId },
    MutexRequest { ns: u64 },
    MutexSendToken { ns: u64, token: MutexToken },
    Chat { sequence_number: u64, text: String },
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ContentKind {
    Identity,
    ElectionToken,
    ElectionLeader,
    MutexRequest,
    MutexSendToken,
    Chat,
}

impl ContentKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Identity => "Identity",
            Self::ElectionToken => "ElectionToken",
            Self::ElectionLeader => "ElectionLeader",
            Self::MutexRequest => "MutexRequest",
            Self::MutexSendToken => "MutexSendToken",
            Self::Chat => "Chat",
        }
    }
}

impl Content {
    pub fn kind(&self) -> ContentKind {
        match self {
            Self::Identity => ContentKind::Identity,
            Self::ElectionToken { .. } => ContentKind::ElectionToken,
            Self::ElectionLeader { .. } => ContentKind::ElectionLeader,
            Self::MutexRequest { .. } => ContentKind::MutexRequest,
            Self::MutexSendToken { .. } => ContentKind::MutexSendToken,
            Self::Chat { .. } => ContentKind::Chat,
        }
    }
}

/// Decoded payload of every non-handshake frame.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Message {
    pub sender: EntityId,
    /// Servers the message went through, in order.
    pub path: Vec<EntityId>,
    /// Set on point-to-point server messages; servers other than the
    /// recipient forward without dispatching.
    pub intended_recipient: Option<EntityId>,
    pub content: Content,
}

impl Message {
    pub fn new(sender: EntityId, content: Content) -> Self {
        Self {
            sender,
            path: Vec::new(),
            intended_recipient: None,
            content,
        }
    }

    pub fn addressed_to(mut self, recipient: EntityId) -> Self {
        self.intended_recipient = Some(recipient);
        self
    }

    pub fn has_visited(&self, id: EntityId) -> bool {
        self.path.contains(&id)
    }

    /// Appends `id` unless already present. Identity announcements may carry
    /// the same id twice.
    pub fn append_to_path(&mut self, id: EntityId) {
        let limit = match self.content {
            Content::Identity => 2,
            _ => 1,
        };
        if self.path.iter().filter(|&&p| p == id).count() < limit {
            self.path.push(id);
        }
    }

    pub fn sequence_number(&self) -> Option<u64> {
        match self.content {
            Content::Chat {
                sequence_number, ..
            } => Some(sequence_number),
            _ => None,
        }
    }
}

/// A send requested by an algorithm step, carried out by the server once
/// the step returns.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outbound {
    /// To every neighbour except `except` and those already in the path.
    Flood {
        except: Option<EntityId>,
        msg_type: u32,
        msg: Message,
    },
    /// To one server, through the routing table.
    ToServer {
        dest: EntityId,
        msg_type: u32,
        msg: Message,
    },
}
