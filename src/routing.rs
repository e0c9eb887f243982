use std::collections::{BTreeMap, HashMap};

use crate::transport::{ConnId, Connection};
use crate::types::EntityId;

pub const HOPS_LOCAL_CLIENT: i32 = -1;
pub const HOPS_NEIGHBOUR: i32 = 1;

#[derive(Clone, Debug)]
pub struct RoutingEntry {
    pub destination: EntityId,
    /// -1 for a local client, 1 for a neighbouring server, more for a
    /// remote server.
    pub hop_count: i32,
    /// Neighbour through which the destination is reached. `None` for
    /// local clients.
    pub next_hop: Option<EntityId>,
    pub connection: Connection,
}

/// How a destination is reached, as reported by queries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Route {
    pub next_hop: Option<EntityId>,
    pub hop_count: i32,
}

impl RoutingEntry {
    pub fn route(&self) -> Route {
        Route {
            next_hop: self.next_hop,
            hop_count: self.hop_count,
        }
    }

    pub fn is_neighbour(&self) -> bool {
        self.hop_count == HOPS_NEIGHBOUR
    }

    pub fn is_local_client(&self) -> bool {
        self.hop_count == HOPS_LOCAL_CLIENT
    }
}

/// Everything a server knows about how to reach other entities.
pub struct RoutingTable {
    own_id: EntityId,
    entries: BTreeMap<EntityId, RoutingEntry>,
    last_forwarded_chat: HashMap<EntityId, u64>,
}

impl RoutingTable {
    pub fn new(own_id: EntityId) -> Self {
        Self {
            own_id,
            entries: BTreeMap::new(),
            last_forwarded_chat: HashMap::new(),
        }
    }

    pub fn add_neighbour(&mut self, id: EntityId, connection: Connection) {
        self.insert(RoutingEntry {
            destination: id,
            hop_count: HOPS_NEIGHBOUR,
            next_hop: Some(id),
            connection,
        });
    }

    pub fn add_local_client(&mut self, id: EntityId, connection: Connection) {
        self.insert(RoutingEntry {
            destination: id,
            hop_count: HOPS_LOCAL_CLIENT,
            next_hop: None,
            connection,
        });
    }

    fn insert(&mut self, entry: RoutingEntry) {
        if entry.destination == self.own_id {
            tracing::warn!(id = %entry.destination, "refusing a route to myself");
            return;
        }
        self.entries.insert(entry.destination, entry);
    }

    pub fn get(&self, id: EntityId) -> Option<&RoutingEntry> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.values()
    }

    pub fn neighbours(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.values().filter(|e| e.is_neighbour())
    }

    pub fn local_clients(&self) -> impl Iterator<Item = &RoutingEntry> {
        self.entries.values().filter(|e| e.is_local_client())
    }

    /// The directly connected entity at the other end of `conn`.
    pub fn entry_for_connection(&self, conn: ConnId) -> Option<&RoutingEntry> {
        self.entries
            .values()
            .find(|e| (e.is_neighbour() || e.is_local_client()) && e.connection.id() == conn)
    }

    /// Drop every entry reached through `conn`. Remote servers only known
    /// through that link become unreachable; no alternative route is
    /// searched.
    pub fn remove_connection(&mut self, conn: ConnId) -> Vec<EntityId> {
        let removed: Vec<EntityId> = self
            .entries
            .values()
            .filter(|e| e.connection.id() == conn)
            .map(|e| e.destination)
            .collect();
        for id in &removed {
            self.entries.remove(id);
        }
        removed
    }

    /// Learn routes from the path of a message that arrived on
    /// `connection`. The last element of the path is the neighbour that
    /// forwarded it; an entity `d` positions from the end is `d` hops
    /// away. Returns the destinations whose route was installed or
    /// shortened.
    pub fn learn_from_path(&mut self, path: &[EntityId], connection: &Connection) -> Vec<EntityId> {
        let Some(&next_hop) = path.last() else {
            return Vec::new();
        };
        if next_hop == self.own_id {
            return Vec::new();
        }

        let mut learned = Vec::new();
        for (i, &id) in path.iter().rev().enumerate() {
            if id == self.own_id {
                continue;
            }
            let distance = i32::try_from(i + 1).unwrap_or(i32::MAX);
            let better = match self.entries.get(&id) {
                None => true,
                Some(known) => distance < known.hop_count,
            };
            if better {
                tracing::debug!(dest = %id, hops = distance, via = %next_hop, "route learned");
                self.entries.insert(
                    id,
                    RoutingEntry {
                        destination: id,
                        hop_count: distance,
                        next_hop: Some(next_hop),
                        connection: connection.clone(),
                    },
                );
                learned.push(id);
            }
        }
        learned
    }

    /// True when chat number `seq` of `sender` has not been delivered to
    /// local clients yet.
    pub fn is_new_chat(&self, sender: EntityId, seq: u64) -> bool {
        self.last_forwarded_chat
            .get(&sender)
            .is_none_or(|&last| seq > last)
    }

    /// Remember that chat number `seq` of `sender` reached local clients.
    pub fn record_chat(&mut self, sender: EntityId, seq: u64) {
        let last = self.last_forwarded_chat.entry(sender).or_insert(seq);
        *last = (*last).max(seq);
    }
}
