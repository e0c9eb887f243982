use std::collections::BTreeMap;
use std::fmt;

use crate::protocol::{Content, Message, MutexToken, Outbound, msg_types};
use crate::types::EntityId;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CsStatus {
    /// Outside the critical section.
    HorsSc,
    /// Waiting for the token.
    EnAtt,
    /// Inside the critical section.
    DansSc,
}

impl fmt::Display for CsStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HorsSc => "out",
            Self::EnAtt => "waiting",
            Self::DansSc => "in",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default)]
pub struct MutexStep {
    pub outbound: Vec<Outbound>,
    /// The server has just entered the critical section.
    pub entered: bool,
}

/// Token based mutual exclusion: requests are flooded with a per-server
/// request number, and the token records for every server the number of
/// its last satisfied request. A server holding the token outside the
/// critical section hands it to any server with a newer request.
pub struct MutualExclusion {
    own_id: EntityId,
    ns: u64,
    dem: BTreeMap<EntityId, u64>,
    jet: Option<MutexToken>,
    status: CsStatus,
    minted: bool,
}

impl MutualExclusion {
    pub fn new(own_id: EntityId) -> Self {
        Self {
            own_id,
            ns: 0,
            dem: BTreeMap::new(),
            jet: None,
            status: CsStatus::HorsSc,
            minted: false,
        }
    }

    pub fn ns(&self) -> u64 {
        self.ns
    }

    pub fn dem(&self) -> &BTreeMap<EntityId, u64> {
        &self.dem
    }

    pub fn jet(&self) -> Option<&MutexToken> {
        self.jet.as_ref()
    }

    pub fn status(&self) -> CsStatus {
        self.status
    }

    /// Create the token on the elected leader. Later calls are no-ops.
    pub fn mint_token(&mut self) -> MutexStep {
        if self.minted {
            return MutexStep::default();
        }
        self.minted = true;
        tracing::info!(id = %self.own_id, "minting mutual exclusion token");
        self.on_token(MutexToken::new())
    }

    pub fn request(&mut self) -> MutexStep {
        if self.status != CsStatus::HorsSc {
            tracing::warn!(id = %self.own_id, status = %self.status, "critical section already requested");
            return MutexStep::default();
        }

        if self.jet.is_some() {
            self.status = CsStatus::DansSc;
            tracing::info!(id = %self.own_id, "entering critical section with idle token");
            return MutexStep {
                outbound: Vec::new(),
                entered: true,
            };
        }

        self.ns += 1;
        self.status = CsStatus::EnAtt;
        tracing::info!(id = %self.own_id, ns = self.ns, "requesting critical section");
        MutexStep {
            outbound: vec![Outbound::Flood {
                except: None,
                msg_type: msg_types::MUTEX_REQUEST,
                msg: Message::new(self.own_id, Content::MutexRequest { ns: self.ns }),
            }],
            entered: false,
        }
    }

    /// Handle a request flooded by `msg.sender`. The message itself is
    /// passed on unchanged the first time this request number is seen.
    pub fn on_request(&mut self, msg: Message) -> Vec<Outbound> {
        let Content::MutexRequest { ns } = msg.content else {
            return Vec::new();
        };
        let requester = msg.sender;
        if requester == self.own_id {
            return Vec::new();
        }

        let mut out = Vec::new();
        let known = self.dem.get(&requester).copied().unwrap_or(0);
        if ns > known {
            self.dem.insert(requester, ns);
            out.push(Outbound::Flood {
                except: None,
                msg_type: msg_types::MUTEX_REQUEST,
                msg,
            });
        }

        if self.status == CsStatus::HorsSc {
            let pending = self.dem.get(&requester).copied().unwrap_or(0);
            if self
                .jet
                .as_ref()
                .is_some_and(|token| pending > token.entry(requester))
            {
                out.extend(self.hand_off(requester));
            }
        }

        out
    }

    pub fn on_token(&mut self, token: MutexToken) -> MutexStep {
        if self.jet.is_some() {
            tracing::warn!(id = %self.own_id, "received a second token, dropping it");
            return MutexStep::default();
        }
        self.jet = Some(token);

        if self.status == CsStatus::EnAtt {
            self.status = CsStatus::DansSc;
            tracing::info!(id = %self.own_id, ns = self.ns, "entering critical section");
            return MutexStep {
                outbound: Vec::new(),
                entered: true,
            };
        }

        MutexStep {
            outbound: self.pass_token_on(),
            entered: false,
        }
    }

    /// Leave the critical section and hand the token to the first pending
    /// server, by ascending id.
    pub fn release(&mut self) -> Vec<Outbound> {
        if self.status != CsStatus::DansSc {
            return Vec::new();
        }
        self.status = CsStatus::HorsSc;
        tracing::info!(id = %self.own_id, "leaving critical section");
        self.pass_token_on()
    }

    fn pass_token_on(&mut self) -> Vec<Outbound> {
        let Some(token) = self.jet.as_ref() else {
            return Vec::new();
        };
        let next = self
            .dem
            .iter()
            .find(|&(&peer, &pending)| pending > token.entry(peer))
            .map(|(&peer, _)| peer);

        match next {
            Some(peer) => self.hand_off(peer),
            None => Vec::new(),
        }
    }

    fn hand_off(&mut self, dest: EntityId) -> Vec<Outbound> {
        let Some(mut token) = self.jet.take() else {
            return Vec::new();
        };
        token.set_entry(self.own_id, self.ns);
        tracing::debug!(id = %self.own_id, %dest, "handing token over");

        vec![Outbound::ToServer {
            dest,
            msg_type: msg_types::MUTEX_SEND_TOKEN,
            msg: Message::new(self.own_id, Content::MutexSendToken { ns: self.ns, token })
                .addressed_to(dest),
        }]
    }
}
