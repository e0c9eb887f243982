use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::messaging::{decode_handshake, decode_message, encode_message};
use crate::protocol::{Content, Message, msg_types};
use crate::transport::{Connection, Inbound, PendingConnection};
use crate::types::EntityId;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChatLine {
    pub sender: EntityId,
    pub sequence_number: u64,
    pub text: String,
}

/// A chat participant attached to one server.
pub struct Client {
    identity: EntityId,
    server: EntityId,
    connection: Connection,
    next_sequence: u64,
    received: Arc<Mutex<Vec<ChatLine>>>,
    shutdown_token: CancellationToken,
    max_message_size: u32,
}

impl Client {
    /// Connect to the client port of `server` and wait for the identity it
    /// assigns.
    pub async fn connect(
        host: &str,
        server: impl Into<EntityId>,
        config: NetworkConfig,
    ) -> Result<Self, NetworkError> {
        config.validate()?;
        let server = server.into();
        let addr = format!("{host}:{}", config.client_port(server)?);

        let mut pending = PendingConnection::connect(&addr, config.max_message_size).await?;
        let frame = tokio::time::timeout(
            Duration::from_millis(config.handshake_timeout_ms),
            pending.next_frame(),
        )
        .await
        .map_err(|_| NetworkError::HandshakeTimeout)??;
        let identity = decode_handshake(&frame)?;

        let shutdown_token = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.send_queue_capacity);
        let connection = pending.start(inbound_tx, config.send_queue_capacity, &shutdown_token);
        let received = Arc::new(Mutex::new(Vec::new()));
        spawn_receiver(identity, inbound_rx, Arc::clone(&received), shutdown_token.clone());

        tracing::info!(client = %identity, %server, %addr, "client connected");

        Ok(Self {
            identity,
            server,
            connection,
            next_sequence: 0,
            received,
            shutdown_token,
            max_message_size: config.max_message_size,
        })
    }

    pub fn identity(&self) -> EntityId {
        self.identity
    }

    pub fn server(&self) -> EntityId {
        self.server
    }

    /// Send one chat line. Returns its sequence number.
    pub fn send_chat(&mut self, text: impl Into<String>) -> Result<u64, NetworkError> {
        let sequence_number = self.next_sequence;
        let msg = Message::new(
            self.identity,
            Content::Chat {
                sequence_number,
                text: text.into(),
            },
        );
        let frame = encode_message(msg_types::CHAT, self.identity, &msg, self.max_message_size)?;
        self.connection.send(frame)?;
        self.next_sequence += 1;
        Ok(sequence_number)
    }

    pub fn sent_count(&self) -> u64 {
        self.next_sequence
    }

    /// Chat lines received from other participants.
    pub fn received_count(&self) -> usize {
        self.received.lock().len()
    }

    pub fn received(&self) -> Vec<ChatLine> {
        self.received.lock().clone()
    }

    pub fn close(&self) {
        self.shutdown_token.cancel();
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
    }
}

fn spawn_receiver(
    identity: EntityId,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    received: Arc<Mutex<Vec<ChatLine>>>,
    shutdown_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                inbound = inbound_rx.recv() => {
                    match inbound {
                        Some(Inbound::Frame { frame, .. }) => {
                            let msg = match decode_message(&frame) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::warn!(client = %identity, error = %e, "failed to decode message");
                                    continue;
                                }
                            };
                            if msg.sender == identity {
                                continue;
                            }
                            if let Content::Chat { sequence_number, text } = msg.content {
                                tracing::info!(client = %identity, from = %msg.sender, seq = sequence_number, %text, "chat received");
                                received.lock().push(ChatLine {
                                    sender: msg.sender,
                                    sequence_number,
                                    text,
                                });
                            }
                        }
                        Some(Inbound::Closed { .. }) | None => {
                            tracing::info!(client = %identity, "disconnected from server");
                            break;
                        }
                    }
                }
            }
        }
    });
}
