use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::error::NetworkError;
use crate::protocol::{ContentKind, Message, OFFSET_SERVER_ALGORITHMS, ServerAlgorithm, action_number};
use crate::server::ServerCore;

pub type ActionHandler = fn(&mut ServerCore, Message) -> Result<(), NetworkError>;

#[derive(Clone, Copy, Debug)]
pub struct ActionDescriptor {
    pub name: &'static str,
    pub msg_type: u32,
    pub content: ContentKind,
    pub handler: ActionHandler,
}

struct AlgorithmActions {
    algorithm: ServerAlgorithm,
    actions: &'static [(&'static str, ContentKind, ActionHandler)],
}

const SERVER_ALGORITHMS: &[AlgorithmActions] = &[
    AlgorithmActions {
        algorithm: ServerAlgorithm::Topology,
        actions: &[(
            "IDENTITY_MESSAGE",
            ContentKind::Identity,
            ServerCore::receive_identity,
        )],
    },
    AlgorithmActions {
        algorithm: ServerAlgorithm::Election,
        actions: &[
            (
                "TOKEN_MESSAGE",
                ContentKind::ElectionToken,
                ServerCore::receive_election_token,
            ),
            (
                "LEADER_MESSAGE",
                ContentKind::ElectionLeader,
                ServerCore::receive_election_leader,
            ),
        ],
    },
    AlgorithmActions {
        algorithm: ServerAlgorithm::Mutex,
        actions: &[
            (
                "REQUEST_MESSAGE",
                ContentKind::MutexRequest,
                ServerCore::receive_mutex_request,
            ),
            (
                "SEND_TOKEN_MESSAGE",
                ContentKind::MutexSendToken,
                ServerCore::receive_mutex_send_token,
            ),
        ],
    },
];

/// Message type to handler table of the server algorithms.
pub struct ActionRegistry {
    by_type: BTreeMap<u32, ActionDescriptor>,
}

impl ActionRegistry {
    fn build(algorithms: &[AlgorithmActions]) -> Self {
        let mut by_type = BTreeMap::new();
        for algo in algorithms {
            for (index, &(name, content, handler)) in algo.actions.iter().enumerate() {
                let msg_type =
                    action_number(OFFSET_SERVER_ALGORITHMS, algo.algorithm as u32, index as u32);
                by_type.insert(
                    msg_type,
                    ActionDescriptor {
                        name,
                        msg_type,
                        content,
                        handler,
                    },
                );
            }
        }
        Self { by_type }
    }

    pub fn server() -> &'static ActionRegistry {
        static REGISTRY: OnceLock<ActionRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| Self::build(SERVER_ALGORITHMS))
    }

    pub fn get(&self, msg_type: u32) -> Option<&ActionDescriptor> {
        self.by_type.get(&msg_type)
    }

    pub fn for_content(&self, content: ContentKind) -> Option<&ActionDescriptor> {
        self.by_type.values().find(|a| a.content == content)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ActionDescriptor> {
        self.by_type.values()
    }

    /// Run the handler registered for `msg_type`, after checking that the
    /// message carries the content that handler expects.
    pub fn execute(
        &self,
        core: &mut ServerCore,
        msg_type: u32,
        msg: Message,
    ) -> Result<(), NetworkError> {
        let action = self
            .get(msg_type)
            .ok_or(NetworkError::UnknownMessageType(msg_type))?;
        let got = msg.content.kind();
        if got != action.content {
            return Err(NetworkError::ContentMismatch {
                msg_type,
                expected: action.content.name(),
                got: got.name(),
            });
        }
        tracing::trace!(action = action.name, sender = %msg.sender, "executing action");
        (action.handler)(core, msg)
    }
}
