use std::fmt;

use crate::protocol::{Content, Message, Outbound, msg_types};
use crate::types::EntityId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ElectionStatus {
    Dormant,
    Initiator,
    Leader,
    NonLeader,
}

impl fmt::Display for ElectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Dormant => "dormant",
            Self::Initiator => "initiator",
            Self::Leader => "leader",
            Self::NonLeader => "non-leader",
        };
        f.write_str(s)
    }
}

/// Echo-wave election with extinction: every initiator starts a wave
/// carrying its own id, servers only take part in the smallest wave seen
/// so far, and the initiator whose wave echoes back completely announces
/// itself with a leader wave.
///
/// Methods take the current number of neighbouring servers and return
/// the messages to send; they never touch the network themselves.
pub struct Election {
    own_id: EntityId,
    candidate_wave: Option<EntityId>,
    parent: Option<EntityId>,
    winner: Option<EntityId>,
    token_echo_count: usize,
    leader_echo_count: usize,
    status: ElectionStatus,
}

impl Election {
    pub fn new(own_id: EntityId) -> Self {
        Self {
            own_id,
            candidate_wave: None,
            parent: None,
            winner: None,
            token_echo_count: 0,
            leader_echo_count: 0,
            status: ElectionStatus::Dormant,
        }
    }

    pub fn status(&self) -> ElectionStatus {
        self.status
    }

    pub fn winner(&self) -> Option<EntityId> {
        self.winner
    }

    pub fn candidate_wave(&self) -> Option<EntityId> {
        self.candidate_wave
    }

    pub fn parent(&self) -> Option<EntityId> {
        self.parent
    }

    pub fn is_leader(&self) -> bool {
        self.status == ElectionStatus::Leader
    }

    fn token(&self, initiator: EntityId) -> Message {
        Message::new(self.own_id, Content::ElectionToken { initiator })
    }

    fn leader(&self, initiator: EntityId) -> Message {
        Message::new(self.own_id, Content::ElectionLeader { initiator })
    }

    /// Start a wave on behalf of this server.
    pub fn start(&mut self, neighbour_count: usize) -> Vec<Outbound> {
        if self.winner.is_some() {
            tracing::warn!(winner = ?self.winner, "election already completed, ignoring trigger");
            return Vec::new();
        }
        if let Some(wave) = self.candidate_wave {
            if wave <= self.own_id {
                tracing::warn!(%wave, "already taking part in a wave that wins over mine");
                return Vec::new();
            }
        }

        tracing::info!(id = %self.own_id, neighbours = neighbour_count, "starting election");
        self.status = ElectionStatus::Initiator;
        self.candidate_wave = Some(self.own_id);
        self.parent = None;
        self.token_echo_count = 0;

        if neighbour_count == 0 {
            self.winner = Some(self.own_id);
            self.status = ElectionStatus::Leader;
            tracing::info!(id = %self.own_id, "no neighbour, elected at once");
            return Vec::new();
        }

        vec![Outbound::Flood {
            except: None,
            msg_type: msg_types::ELECTION_TOKEN,
            msg: self.token(self.own_id),
        }]
    }

    pub fn on_token(
        &mut self,
        sender: EntityId,
        initiator: EntityId,
        neighbour_count: usize,
    ) -> Vec<Outbound> {
        let mut out = Vec::new();

        if self.candidate_wave.is_none_or(|wave| initiator < wave) {
            tracing::debug!(%initiator, parent = %sender, "joining election wave");
            self.candidate_wave = Some(initiator);
            self.token_echo_count = 0;
            self.parent = Some(sender);
            out.push(Outbound::Flood {
                except: Some(sender),
                msg_type: msg_types::ELECTION_TOKEN,
                msg: self.token(initiator),
            });
        }

        if self.candidate_wave == Some(initiator) {
            self.token_echo_count += 1;
            if self.token_echo_count == neighbour_count {
                if initiator == self.own_id {
                    tracing::info!(id = %self.own_id, "wave complete, announcing leadership");
                    out.push(Outbound::Flood {
                        except: None,
                        msg_type: msg_types::ELECTION_LEADER,
                        msg: self.leader(self.own_id),
                    });
                } else if let Some(parent) = self.parent {
                    out.push(Outbound::ToServer {
                        dest: parent,
                        msg_type: msg_types::ELECTION_TOKEN,
                        msg: self.token(initiator),
                    });
                }
            }
        }

        out
    }

    pub fn on_leader(&mut self, initiator: EntityId, neighbour_count: usize) -> Vec<Outbound> {
        let mut out = Vec::new();

        if self.leader_echo_count == 0 && initiator != self.own_id {
            out.push(Outbound::Flood {
                except: None,
                msg_type: msg_types::ELECTION_LEADER,
                msg: self.leader(initiator),
            });
        }

        self.leader_echo_count += 1;
        self.winner = Some(initiator);

        if self.leader_echo_count == neighbour_count {
            self.status = if initiator == self.own_id {
                ElectionStatus::Leader
            } else {
                ElectionStatus::NonLeader
            };
            tracing::info!(id = %self.own_id, winner = %initiator, status = %self.status, "election finished");
        }

        out
    }
}
