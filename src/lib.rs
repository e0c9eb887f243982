mod action;
mod client;
mod config;
mod election;
mod error;
mod interceptor;
mod messaging;
mod mutex;
mod protocol;
mod routing;
mod server;
mod transport;
mod types;

pub use crate::action::{ActionDescriptor, ActionHandler, ActionRegistry};
pub use crate::client::{ChatLine, Client};
pub use crate::config::{
    BASE_PORT, CLIENT_OFFSET, HANDSHAKE_TIMEOUT_MS, INTERCEPT_POLL_INTERVAL_MS, MAX_MESSAGE_SIZE,
    NetworkConfig, SERVER_PORT_OFFSET, ServerConfig,
};
pub use crate::election::{Election, ElectionStatus};
pub use crate::error::NetworkError;
pub use crate::interceptor::{InterceptionContext, Interceptor};
pub use crate::messaging::{
    Frame, HEADER_SIZE, decode_handshake, decode_message, encode_handshake, encode_message,
};
pub use crate::mutex::{CsStatus, MutexStep, MutualExclusion};
pub use crate::protocol::{
    ClientAlgorithm, Content, ContentKind, Message, MutexToken, NB_MAX_ACTIONS_PER_ALGORITHM,
    OFFSET_CLIENT_ALGORITHMS, OFFSET_SERVER_ALGORITHMS, Outbound, ServerAlgorithm, action_number,
    msg_types,
};
pub use crate::routing::{Route, RoutingEntry, RoutingTable};
pub use crate::server::{Entity, Server, ServerCore};
pub use crate::transport::{
    ConnId, Connection, FrameCodec, FrameReader, Inbound, PendingConnection, ReadStatus,
    bind_listener,
};
pub use crate::types::{EntityId, PeerEndpoint};

/// Install a `tracing` subscriber printing INFO and above, overridable
/// through `RUST_LOG`. Only the first call has an effect.
#[cfg(feature = "logging")]
pub fn init_logging() {
    use std::sync::Once;

    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive(tracing::Level::INFO.into()),
            )
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;
    use std::time::Duration;

    const SIX_SERVERS: &[(u32, &[u32])] = &[
        (1, &[]),
        (2, &[1]),
        (3, &[1, 2]),
        (4, &[3]),
        (5, &[2, 4]),
        (6, &[5]),
    ];

    const LINE_OF_FIVE: &[(u32, &[u32])] = &[(1, &[]), (2, &[1]), (3, &[2]), (4, &[3]), (5, &[4])];

    fn id(n: u32) -> EntityId {
        EntityId::new(n)
    }

    fn network(base_port: u16) -> NetworkConfig {
        NetworkConfig {
            base_port,
            critical_section_ms: 0,
            intercept_poll_interval_ms: 20,
            ..NetworkConfig::default()
        }
    }

    async fn wait_until(f: impl Fn() -> bool, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    fn degrees(topology: &[(u32, &[u32])]) -> BTreeMap<u32, usize> {
        let mut degrees: BTreeMap<u32, usize> = topology.iter().map(|&(n, _)| (n, 0)).collect();
        for &(n, peers) in topology {
            for &p in peers {
                *degrees.entry(n).or_default() += 1;
                *degrees.entry(p).or_default() += 1;
            }
        }
        degrees
    }

    fn hop_distances(topology: &[(u32, &[u32])], from: u32) -> BTreeMap<u32, i32> {
        let mut links: BTreeMap<u32, Vec<u32>> = BTreeMap::new();
        for &(n, peers) in topology {
            for &p in peers {
                links.entry(n).or_default().push(p);
                links.entry(p).or_default().push(n);
            }
        }
        let mut dist = BTreeMap::from([(from, 0)]);
        let mut queue = VecDeque::from([from]);
        while let Some(n) = queue.pop_front() {
            let d = dist[&n];
            for &m in links.get(&n).into_iter().flatten() {
                if !dist.contains_key(&m) {
                    dist.insert(m, d + 1);
                    queue.push_back(m);
                }
            }
        }
        dist.remove(&from);
        dist
    }

    /// Start the servers in order, each connecting to the listed peers, and
    /// wait until every link is registered on both ends.
    async fn start_servers(
        topology: &[(u32, &[u32])],
        base_port: u16,
        interception: Option<Arc<InterceptionContext>>,
    ) -> BTreeMap<u32, Server> {
        start_servers_with(topology, network(base_port), interception).await
    }

    async fn start_servers_with(
        topology: &[(u32, &[u32])],
        network: NetworkConfig,
        interception: Option<Arc<InterceptionContext>>,
    ) -> BTreeMap<u32, Server> {
        let mut servers = BTreeMap::new();
        for &(n, peers) in topology {
            let mut config = ServerConfig::new(n).with_network(network);
            for &p in peers {
                config = config.with_peer("127.0.0.1", p);
            }
            let server = Server::start(config, interception.clone()).await.unwrap();
            servers.insert(n, server);
        }

        let degrees = degrees(topology);
        assert!(
            wait_until(
                || degrees
                    .iter()
                    .all(|(n, &d)| servers[n].number_of_neighbours() == d),
                5000
            )
            .await
        );
        servers
    }

    fn shutdown_all(servers: &BTreeMap<u32, Server>) {
        for server in servers.values() {
            server.shutdown();
        }
    }

    async fn critical_section(server: &Server) {
        server.request_critical_section();
        assert!(
            wait_until(|| server.cs_status() == CsStatus::DansSc, 5000).await,
            "server {} never entered the critical section",
            server.identity()
        );
        server.release_critical_section();
        assert_eq!(server.cs_status(), CsStatus::HorsSc);
    }

    fn dem(server: &Server) -> Vec<(u32, u64)> {
        server
            .dem()
            .into_iter()
            .map(|(k, v)| (k.get(), v))
            .collect()
    }

    fn election_over(server: &Server) -> bool {
        matches!(
            server.election_status(),
            ElectionStatus::Leader | ElectionStatus::NonLeader
        )
    }

    async fn elect_first_server(servers: &BTreeMap<u32, Server>) {
        servers[&1].start_election();
        assert!(
            wait_until(
                || servers.values().all(|s| s.winner() == Some(id(1)) && election_over(s)),
                5000
            )
            .await
        );
        assert!(wait_until(|| servers[&1].jet().is_some(), 5000).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_six_server_routes() {
        let servers = start_servers(SIX_SERVERS, 23000, None).await;

        let everyone_known = || {
            servers
                .iter()
                .all(|(&n, s)| (1..=6).filter(|&m| m != n).all(|m| s.route_to(id(m)).is_some()))
        };
        assert!(wait_until(everyone_known, 5000).await);

        let shortest = hop_distances(SIX_SERVERS, 1);
        assert!(
            wait_until(
                || shortest
                    .iter()
                    .all(|(&m, &d)| servers[&1].route_to(id(m)).map(|r| r.hop_count) == Some(d)),
                5000
            )
            .await
        );
        assert_eq!(
            servers[&1].route_to(id(4)),
            Some(Route {
                next_hop: Some(id(3)),
                hop_count: 2
            })
        );
        assert_eq!(servers[&1].first_hop_to(id(4)), Some(id(3)));

        let all_shortest = || {
            servers.iter().all(|(&n, s)| {
                hop_distances(SIX_SERVERS, n)
                    .iter()
                    .all(|(&m, &d)| s.route_to(id(m)).map(|r| r.hop_count) == Some(d))
            })
        };
        assert!(wait_until(all_shortest, 5000).await);

        for (&n, server) in &servers {
            for (dest, route) in server.routes() {
                let next_hop = route.next_hop.unwrap();
                assert_eq!(
                    server.route_to(next_hop).map(|r| r.hop_count),
                    Some(1),
                    "next hop of {n} -> {dest}"
                );
            }
        }

        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lost_neighbour_drops_its_routes() {
        let servers = start_servers(SIX_SERVERS, 25700, None).await;
        assert!(wait_until(|| servers[&5].route_to(id(6)).is_some(), 5000).await);
        assert_eq!(servers[&5].number_of_neighbours(), 3);

        servers[&6].shutdown();
        assert!(
            wait_until(
                || servers[&5].number_of_neighbours() == 2 && servers[&5].route_to(id(6)).is_none(),
                5000
            )
            .await
        );
        assert_eq!(
            servers[&5].route_to(id(4)),
            Some(Route {
                next_hop: Some(id(4)),
                hop_count: 1
            })
        );

        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_election_single_candidate() {
        let servers = start_servers(SIX_SERVERS, 23300, None).await;

        servers[&1].start_election();
        assert!(
            wait_until(
                || servers.values().all(|s| s.winner() == Some(id(1)) && election_over(s)),
                5000
            )
            .await
        );

        for (&n, server) in &servers {
            let expected = if n == 1 {
                ElectionStatus::Leader
            } else {
                ElectionStatus::NonLeader
            };
            assert_eq!(server.election_status(), expected, "server {n}");
        }
        assert!(servers[&1].jet().is_some());
        assert_eq!(servers.values().filter(|s| s.jet().is_some()).count(), 1);

        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_election_several_candidates() {
        let interception = Arc::new(InterceptionContext::new());
        interception
            .register(Interceptor::delaying(
                "token of 1 waits for 2 to wake up",
                id(2),
                |msg| matches!(msg.content, Content::ElectionToken { initiator } if initiator == EntityId::new(1)),
                |core, _| core.election().status() != ElectionStatus::Dormant,
            ))
            .unwrap();
        interception.enable();

        let servers = start_servers(SIX_SERVERS, 23600, Some(Arc::clone(&interception))).await;

        servers[&1].start_election();
        servers[&2].start_election();

        assert!(
            wait_until(
                || servers.values().all(|s| s.winner() == Some(id(1)) && election_over(s)),
                5000
            )
            .await
        );
        assert_eq!(servers[&1].election_status(), ElectionStatus::Leader);
        for n in 2..=6 {
            assert_eq!(servers[&n].election_status(), ElectionStatus::NonLeader, "server {n}");
        }

        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mutex_without_concurrency() {
        let servers = start_servers(LINE_OF_FIVE, 23900, None).await;
        elect_first_server(&servers).await;

        for n in [2, 1, 4, 5, 3] {
            critical_section(&servers[&n]).await;
        }

        let all_requested_once = || {
            servers.iter().all(|(&n, s)| {
                dem(s) == (1..=5).filter(|&o| o != n).map(|o| (o, 1u64)).collect::<Vec<_>>()
            })
        };
        assert!(wait_until(all_requested_once, 5000).await);
        for server in servers.values() {
            assert_eq!(server.ns(), 1);
        }

        let token = servers[&3].jet().unwrap();
        for (peer, value) in [(1, 1), (2, 1), (3, 0), (4, 1), (5, 1)] {
            assert_eq!(token.entry(id(peer)), value, "token entry {peer}");
        }
        assert_eq!(servers.values().filter(|s| s.jet().is_some()).count(), 1);

        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_mutex_with_concurrency() {
        let interception = Arc::new(InterceptionContext::new());
        interception
            .register(Interceptor::delaying(
                "requests of 2 wait for 5 to ask",
                id(5),
                |msg| {
                    msg.sender == EntityId::new(2)
                        && matches!(msg.content, Content::MutexRequest { .. })
                },
                |core, _| core.mutex().ns() == 1,
            ))
            .unwrap();
        interception.enable();

        let servers = start_servers(LINE_OF_FIVE, 24200, Some(Arc::clone(&interception))).await;
        elect_first_server(&servers).await;

        for n in [1, 2, 5, 1, 2] {
            critical_section(&servers[&n]).await;
        }

        let expected: [(u32, Vec<(u32, u64)>); 5] = [
            (1, vec![(2, 2), (5, 1)]),
            (2, vec![(1, 1), (5, 1)]),
            (3, vec![(1, 1), (2, 2), (5, 1)]),
            (4, vec![(1, 1), (2, 2), (5, 1)]),
            (5, vec![(1, 1), (2, 2)]),
        ];
        assert!(
            wait_until(
                || expected.iter().all(|(n, d)| dem(&servers[n]) == *d),
                5000
            )
            .await
        );
        let ns: Vec<u64> = servers.values().map(Server::ns).collect();
        assert_eq!(ns, vec![1, 2, 0, 0, 1]);

        let token = servers[&2].jet().unwrap();
        for (peer, value) in [(1, 1), (2, 1), (5, 1)] {
            assert_eq!(token.entry(id(peer)), value, "token entry {peer}");
        }

        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_critical_section_left_on_timer() {
        let topology: &[(u32, &[u32])] = &[(1, &[]), (2, &[1])];
        let network = NetworkConfig {
            critical_section_ms: 300,
            ..network(26000)
        };
        let servers = start_servers_with(topology, network, None).await;
        elect_first_server(&servers).await;

        servers[&1].request_critical_section();
        assert_eq!(servers[&1].cs_status(), CsStatus::DansSc);
        servers[&2].request_critical_section();

        assert!(wait_until(|| servers[&2].cs_status() == CsStatus::DansSc, 5000).await);
        assert_eq!(servers[&1].cs_status(), CsStatus::HorsSc);
        assert!(servers[&1].jet().is_none());

        assert!(wait_until(|| servers[&2].cs_status() == CsStatus::HorsSc, 5000).await);
        assert!(servers[&2].jet().is_some());
        assert!(servers[&1].jet().is_none());
        assert_eq!(servers[&2].ns(), 1);
        assert_eq!(dem(&servers[&1]), vec![(2, 1)]);

        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_earlier_timer_spares_later_stay() {
        let network = NetworkConfig {
            critical_section_ms: 600,
            ..network(26300)
        };
        let server = Server::start(ServerConfig::new(1).with_network(network), None)
            .await
            .unwrap();
        server.start_election();
        assert!(server.jet().is_some());

        server.request_critical_section();
        assert_eq!(server.cs_status(), CsStatus::DansSc);
        server.release_critical_section();
        assert_eq!(server.cs_status(), CsStatus::HorsSc);

        tokio::time::sleep(Duration::from_millis(300)).await;
        server.request_critical_section();
        assert_eq!(server.cs_status(), CsStatus::DansSc);

        // The first timer fires halfway through the second stay.
        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(server.cs_status(), CsStatus::DansSc);

        assert!(wait_until(|| server.cs_status() == CsStatus::HorsSc, 5000).await);
        assert!(server.jet().is_some());
        server.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_chat_delivered_once() {
        let topology: &[(u32, &[u32])] = &[(1, &[]), (2, &[1]), (3, &[1, 2])];
        let servers = start_servers(topology, 24500, None).await;

        let mut alice = Client::connect("127.0.0.1", 1, network(24500)).await.unwrap();
        let bob = Client::connect("127.0.0.1", 3, network(24500)).await.unwrap();
        assert_eq!(alice.identity(), id(100));
        assert_eq!(bob.identity(), id(300));
        assert!(
            wait_until(
                || servers[&1].number_of_local_clients() == 1
                    && servers[&3].number_of_local_clients() == 1,
                5000
            )
            .await
        );

        assert_eq!(alice.send_chat("hello").unwrap(), 0);
        assert_eq!(alice.send_chat("again").unwrap(), 1);
        assert!(wait_until(|| bob.received_count() == 2, 5000).await);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(bob.received_count(), 2);
        assert_eq!(alice.received_count(), 0);
        let texts: Vec<String> = bob.received().into_iter().map(|l| l.text).collect();
        assert_eq!(texts, vec!["hello".to_string(), "again".to_string()]);

        assert_eq!(alice.server(), id(1));
        assert_eq!(bob.server(), id(3));
        assert_eq!(alice.sent_count(), 2);
        assert_eq!(bob.sent_count(), 0);

        alice.close();
        bob.close();
        shutdown_all(&servers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_port_in_use_fails_start() {
        let first = Server::start(ServerConfig::new(1).with_network(network(24800)), None)
            .await
            .unwrap();
        let second = Server::start(ServerConfig::new(1).with_network(network(24800)), None).await;
        assert!(matches!(second, Err(NetworkError::Bind { .. })));
        first.shutdown();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unreachable_peer_fails_start() {
        let config = ServerConfig::new(2)
            .with_peer("127.0.0.1", 1)
            .with_network(network(25100));
        assert!(matches!(
            Server::start(config, None).await,
            Err(NetworkError::ConnectionFailed(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_console_commands() {
        let server = Server::start(ServerConfig::new(1).with_network(network(25400)), None)
            .await
            .unwrap();

        assert!(server.treat_console_input("dance"));
        assert!(server.treat_console_input("election"));
        assert_eq!(server.election_status(), ElectionStatus::Leader);
        assert!(server.treat_console_input("critical section"));
        assert_eq!(server.cs_status(), CsStatus::DansSc);
        assert_eq!(server.ns(), 0);

        assert!(!server.treat_console_input("quit"));
        assert!(server.is_shut_down());
    }
}
