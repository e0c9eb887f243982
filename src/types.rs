use std::fmt;

use serde::{Deserialize, Serialize};

/// Identity of a server or a client. Server identities are assigned by the
/// operator; client identities are minted by the server they attach to.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct EntityId(u32);

impl EntityId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for EntityId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<EntityId> for u32 {
    fn from(id: EntityId) -> Self {
        id.0
    }
}

/// A neighbouring server to connect to at startup.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PeerEndpoint {
    pub host: String,
    pub id: EntityId,
}

impl PeerEndpoint {
    pub fn new(host: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            host: host.into(),
            id: id.into(),
        }
    }
}
