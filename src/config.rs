use crate::error::NetworkError;
use crate::types::{EntityId, PeerEndpoint};

pub const MAX_MESSAGE_SIZE: u32 = 1024 * 1024;
pub const HANDSHAKE_TIMEOUT_MS: u64 = 5000;
pub const BASE_PORT: u16 = 2050;
pub const SERVER_PORT_OFFSET: u16 = 100;
pub const CLIENT_OFFSET: u32 = 100;
pub const INTERCEPT_POLL_INTERVAL_MS: u64 = 100;

#[derive(Clone, Copy, Debug)]
pub struct NetworkConfig {
    /// Clients of server `n` connect to `base_port + n`, servers to
    /// `base_port + n + SERVER_PORT_OFFSET`.
    pub base_port: u16,
    pub handshake_timeout_ms: u64,
    pub send_queue_capacity: usize,
    pub intercept_poll_interval_ms: u64,
    /// How long a server stays in the critical section before leaving it on
    /// its own. 0 keeps it inside until released explicitly.
    pub critical_section_ms: u64,
    pub max_message_size: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_port: BASE_PORT,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_MS,
            send_queue_capacity: 1024,
            intercept_poll_interval_ms: INTERCEPT_POLL_INTERVAL_MS,
            critical_section_ms: 100,
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), NetworkError> {
        let err = |msg: &str| Err(NetworkError::InvalidArgument(msg.into()));

        if self.base_port == 0 {
            return err("base_port must be > 0");
        }
        if self.handshake_timeout_ms == 0 {
            return err("handshake_timeout_ms must be > 0");
        }
        if self.send_queue_capacity == 0 {
            return err("send_queue_capacity must be > 0");
        }
        if self.intercept_poll_interval_ms == 0 {
            return err("intercept_poll_interval_ms must be > 0");
        }
        if self.max_message_size == 0 {
            return err("max_message_size must be > 0");
        }

        Ok(())
    }

    pub fn client_port(&self, server: EntityId) -> Result<u16, NetworkError> {
        u16::try_from(server.get())
            .ok()
            .and_then(|id| self.base_port.checked_add(id))
            .ok_or_else(|| {
                NetworkError::InvalidArgument(format!("no port for server {server}"))
            })
    }

    pub fn server_port(&self, server: EntityId) -> Result<u16, NetworkError> {
        self.client_port(server)?
            .checked_add(SERVER_PORT_OFFSET)
            .ok_or_else(|| {
                NetworkError::InvalidArgument(format!("no port for server {server}"))
            })
    }
}

/// Startup parameters of one server: its identity and the servers it
/// connects to.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub identity: EntityId,
    pub peers: Vec<PeerEndpoint>,
    pub network: NetworkConfig,
}

impl ServerConfig {
    pub fn new(identity: impl Into<EntityId>) -> Self {
        Self {
            identity: identity.into(),
            peers: Vec::new(),
            network: NetworkConfig::default(),
        }
    }

    pub fn with_peer(mut self, host: impl Into<String>, id: impl Into<EntityId>) -> Self {
        self.peers.push(PeerEndpoint::new(host, id));
        self
    }

    pub fn with_network(mut self, network: NetworkConfig) -> Self {
        self.network = network;
        self
    }

    /// Parses `<id> [<host> <peerId>]...`.
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, NetworkError> {
        let usage = || {
            NetworkError::InvalidArgument(
                "usage: <server number> [<hostname> <server number>]...".into(),
            )
        };

        let (first, rest) = args.split_first().ok_or_else(usage)?;
        if rest.len() % 2 != 0 {
            return Err(usage());
        }

        let identity = parse_server_id(first.as_ref())?;
        let mut config = Self::new(identity);
        for pair in rest.chunks(2) {
            let id = parse_server_id(pair[1].as_ref())?;
            config.peers.push(PeerEndpoint::new(pair[0].as_ref(), id));
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.identity.get() == 0 {
            return Err(NetworkError::InvalidArgument(
                "the identity of a server must be > 0".into(),
            ));
        }
        if self.peers.iter().any(|p| p.id == self.identity) {
            return Err(NetworkError::InvalidArgument(
                "a server cannot connect to itself".into(),
            ));
        }
        self.network.validate()?;
        self.network.server_port(self.identity)?;
        Ok(())
    }
}

fn parse_server_id(raw: &str) -> Result<EntityId, NetworkError> {
    raw.parse::<u32>()
        .map(EntityId::new)
        .map_err(|e| NetworkError::InvalidArgument(format!("invalid server number {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = NetworkConfig::default();

        config.base_port = 0;
        assert!(config.validate().is_err());
        config.base_port = BASE_PORT;

        config.handshake_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.handshake_timeout_ms = HANDSHAKE_TIMEOUT_MS;

        config.send_queue_capacity = 0;
        assert!(config.validate().is_err());
        config.send_queue_capacity = 16;

        config.intercept_poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.intercept_poll_interval_ms = 100;

        config.max_message_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_convention() {
        let config = NetworkConfig::default();
        assert_eq!(config.client_port(EntityId::new(1)).unwrap(), 2051);
        assert_eq!(config.server_port(EntityId::new(1)).unwrap(), 2151);

        let config = NetworkConfig {
            base_port: u16::MAX - 10,
            ..NetworkConfig::default()
        };
        assert!(config.client_port(EntityId::new(20)).is_err());
        assert!(config.server_port(EntityId::new(5)).is_err());
    }

    #[test]
    fn test_from_args() {
        let config = ServerConfig::from_args(&["5", "localhost", "2", "otherhost", "4"]).unwrap();
        assert_eq!(config.identity, EntityId::new(5));
        assert_eq!(
            config.peers,
            vec![
                PeerEndpoint::new("localhost", 2),
                PeerEndpoint::new("otherhost", 4)
            ]
        );

        let config = ServerConfig::from_args(&["1"]).unwrap();
        assert!(config.peers.is_empty());
    }

    #[test]
    fn test_from_args_rejects_bad_input() {
        let empty: [&str; 0] = [];
        assert!(ServerConfig::from_args(&empty).is_err());
        assert!(ServerConfig::from_args(&["2", "localhost"]).is_err());
        assert!(ServerConfig::from_args(&["0"]).is_err());
        assert!(ServerConfig::from_args(&["x"]).is_err());
        assert!(ServerConfig::from_args(&["3", "localhost", "3"]).is_err());
    }
}
