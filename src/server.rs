use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::action::ActionRegistry;
use crate::config::{CLIENT_OFFSET, NetworkConfig, ServerConfig};
use crate::election::{Election, ElectionStatus};
use crate::error::NetworkError;
use crate::interceptor::{InterceptionContext, spawn_delayed_delivery};
use crate::messaging::{Frame, decode_handshake, decode_message, encode_handshake, encode_message};
use crate::mutex::{CsStatus, MutexStep, MutualExclusion};
use crate::protocol::{Content, ContentKind, Message, MutexToken, Outbound, msg_types};
use crate::routing::{Route, RoutingTable};
use crate::transport::{ConnId, Connection, Inbound, PendingConnection, bind_listener};
use crate::types::{EntityId, PeerEndpoint};

const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// The state of one server behind a single lock, with a condition variable
/// notified after every change.
pub struct Entity {
    core: Mutex<ServerCore>,
    changed: Condvar,
}

impl Entity {
    fn new(core: ServerCore) -> Self {
        Self {
            core: Mutex::new(core),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ServerCore> {
        self.core.lock()
    }

    /// Release the lock until the next change or `timeout`, whichever comes
    /// first.
    pub fn wait_for_change(&self, guard: &mut MutexGuard<'_, ServerCore>, timeout: Duration) {
        let _ = self.changed.wait_for(guard, timeout);
    }

    pub fn notify_changed(&self) {
        self.changed.notify_all();
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut ServerCore) -> R) -> R {
        let result = f(&mut self.lock());
        self.notify_changed();
        result
    }
}

#[derive(Debug)]
enum ServerEvent {
    LeaveCriticalSection { epoch: u64 },
}

pub struct ServerCore {
    identity: EntityId,
    config: NetworkConfig,
    routing: RoutingTable,
    election: Election,
    mutex: MutualExclusion,
    clients_since_start: u32,
    cs_epoch: u64,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    runtime: Handle,
    shutdown_token: CancellationToken,
}

impl ServerCore {
    fn new(
        identity: EntityId,
        config: NetworkConfig,
        events_tx: mpsc::UnboundedSender<ServerEvent>,
        runtime: Handle,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            identity,
            config,
            routing: RoutingTable::new(identity),
            election: Election::new(identity),
            mutex: MutualExclusion::new(identity),
            clients_since_start: 0,
            cs_epoch: 0,
            events_tx,
            runtime,
            shutdown_token,
        }
    }

    pub fn identity(&self) -> EntityId {
        self.identity
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn election(&self) -> &Election {
        &self.election
    }

    pub fn mutex(&self) -> &MutualExclusion {
        &self.mutex
    }

    pub fn number_of_neighbours(&self) -> usize {
        self.routing.neighbours().count()
    }

    pub fn number_of_local_clients(&self) -> usize {
        self.routing.local_clients().count()
    }

    fn next_client_id(&mut self) -> EntityId {
        let id = self
            .identity
            .get()
            .saturating_mul(CLIENT_OFFSET)
            .saturating_add(self.clients_since_start);
        self.clients_since_start += 1;
        EntityId::new(id)
    }

    /// Send `msg` towards `dest` through the routing table, appending this
    /// server to its path.
    pub fn send_to_peer(
        &mut self,
        dest: EntityId,
        msg_type: u32,
        mut msg: Message,
    ) -> Result<(), NetworkError> {
        if dest == self.identity {
            return Err(NetworkError::SendToSelf);
        }
        let entry = self
            .routing
            .get(dest)
            .ok_or(NetworkError::UnknownDestination(dest))?;
        msg.append_to_path(self.identity);
        let frame = encode_message(msg_type, self.identity, &msg, self.config.max_message_size)?;
        entry.connection.send(frame)
    }

    /// Send `msg` to every neighbouring server except `except` and those
    /// already on its path. Returns the number of copies queued.
    pub fn flood_to_neighbours_except(
        &mut self,
        except: Option<EntityId>,
        msg_type: u32,
        msg: &Message,
    ) -> usize {
        let mut msg = msg.clone();
        msg.append_to_path(self.identity);
        let frame = match encode_message(msg_type, self.identity, &msg, self.config.max_message_size)
        {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = %self.identity, msg_type, error = %e, "flood encode failed");
                return 0;
            }
        };

        let mut sent = 0;
        for entry in self.routing.neighbours() {
            if Some(entry.destination) == except || msg.has_visited(entry.destination) {
                continue;
            }
            match entry.connection.send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(id = %self.identity, peer = %entry.destination, error = %e, "flood send failed");
                }
            }
        }
        sent
    }

    /// Deliver a chat message to the local clients except `except`, at most
    /// once per sender and sequence number.
    pub fn flood_to_local_clients_except(
        &mut self,
        except: Option<EntityId>,
        msg_type: u32,
        msg: &Message,
    ) -> usize {
        let Some(seq) = msg.sequence_number() else {
            return 0;
        };
        if !self.routing.is_new_chat(msg.sender, seq) {
            return 0;
        }
        let frame = match encode_message(msg_type, self.identity, msg, self.config.max_message_size) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(id = %self.identity, msg_type, error = %e, "chat encode failed");
                return 0;
            }
        };

        let mut sent = 0;
        for entry in self.routing.local_clients() {
            if Some(entry.destination) == except || msg.has_visited(entry.destination) {
                continue;
            }
            match entry.connection.send(frame.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(id = %self.identity, client = %entry.destination, error = %e, "chat delivery failed");
                }
            }
        }
        if sent > 0 {
            self.routing.record_chat(msg.sender, seq);
        }
        sent
    }

    fn apply(&mut self, outbound: Vec<Outbound>) {
        for out in outbound {
            match out {
                Outbound::Flood {
                    except,
                    msg_type,
                    msg,
                } => {
                    self.flood_to_neighbours_except(except, msg_type, &msg);
                }
                Outbound::ToServer {
                    dest,
                    msg_type,
                    msg,
                } => {
                    if let Err(e) = self.send_to_peer(dest, msg_type, msg) {
                        tracing::error!(id = %self.identity, %dest, msg_type, error = %e, "point to point send failed");
                    }
                }
            }
        }
    }

    fn relay_chat(&mut self, msg_type: u32, msg: Message) {
        let sender = msg.sender;
        self.flood_to_neighbours_except(Some(sender), msg_type, &msg);
        self.flood_to_local_clients_except(Some(sender), msg_type, &msg);
    }

    fn announce_identity(&mut self) {
        let msg = Message::new(self.identity, Content::Identity);
        let sent = self.flood_to_neighbours_except(None, msg_types::IDENTITY, &msg);
        tracing::debug!(id = %self.identity, neighbours = sent, "identity flooded");
    }

    fn announce_identity_to(&mut self, dest: EntityId) {
        let msg = Message::new(self.identity, Content::Identity).addressed_to(dest);
        if let Err(e) = self.send_to_peer(dest, msg_types::IDENTITY, msg) {
            tracing::warn!(id = %self.identity, %dest, error = %e, "identity announcement failed");
        }
    }

    fn learn_routes(&mut self, msg: &Message, connection: &Connection) {
        for dest in self.routing.learn_from_path(&msg.path, connection) {
            self.announce_identity_to(dest);
        }
    }

    /// Run the regular action of `msg`, chosen from its content.
    pub fn execute_message(&mut self, msg: Message) -> Result<(), NetworkError> {
        let registry = ActionRegistry::server();
        let kind = msg.content.kind();
        let action = registry.for_content(kind).ok_or_else(|| {
            NetworkError::Internal(format!("no server action for {} messages", kind.name()))
        })?;
        registry.execute(self, action.msg_type, msg)
    }

    fn execute(&mut self, msg_type: u32, msg: Message) -> Result<(), NetworkError> {
        ActionRegistry::server().execute(self, msg_type, msg)
    }

    pub(crate) fn receive_identity(&mut self, mut msg: Message) -> Result<(), NetworkError> {
        msg.intended_recipient = None;
        self.flood_to_neighbours_except(None, msg_types::IDENTITY, &msg);
        Ok(())
    }

    pub(crate) fn receive_election_token(&mut self, msg: Message) -> Result<(), NetworkError> {
        let Content::ElectionToken { initiator } = msg.content else {
            return Err(unexpected(msg_types::ELECTION_TOKEN, ContentKind::ElectionToken, &msg));
        };
        let neighbours = self.number_of_neighbours();
        let out = self.election.on_token(msg.sender, initiator, neighbours);
        self.apply(out);
        self.after_election_step();
        Ok(())
    }

    pub(crate) fn receive_election_leader(&mut self, msg: Message) -> Result<(), NetworkError> {
        let Content::ElectionLeader { initiator } = msg.content else {
            return Err(unexpected(msg_types::ELECTION_LEADER, ContentKind::ElectionLeader, &msg));
        };
        let neighbours = self.number_of_neighbours();
        let out = self.election.on_leader(initiator, neighbours);
        self.apply(out);
        self.after_election_step();
        Ok(())
    }

    pub(crate) fn receive_mutex_request(&mut self, msg: Message) -> Result<(), NetworkError> {
        if !matches!(msg.content, Content::MutexRequest { .. }) {
            return Err(unexpected(msg_types::MUTEX_REQUEST, ContentKind::MutexRequest, &msg));
        }
        let out = self.mutex.on_request(msg);
        self.apply(out);
        Ok(())
    }

    pub(crate) fn receive_mutex_send_token(&mut self, msg: Message) -> Result<(), NetworkError> {
        let Content::MutexSendToken { token, .. } = msg.content else {
            return Err(unexpected(msg_types::MUTEX_SEND_TOKEN, ContentKind::MutexSendToken, &msg));
        };
        let step = self.mutex.on_token(token);
        self.apply_mutex_step(step);
        Ok(())
    }

    fn start_election(&mut self) {
        let neighbours = self.number_of_neighbours();
        let out = self.election.start(neighbours);
        self.apply(out);
        self.after_election_step();
    }

    fn after_election_step(&mut self) {
        if self.election.is_leader() {
            let step = self.mutex.mint_token();
            self.apply_mutex_step(step);
        }
    }

    fn request_critical_section(&mut self) {
        let step = self.mutex.request();
        self.apply_mutex_step(step);
    }

    fn apply_mutex_step(&mut self, step: MutexStep) {
        self.apply(step.outbound);
        if step.entered {
            self.schedule_cs_exit();
        }
    }

    fn schedule_cs_exit(&mut self) {
        self.cs_epoch += 1;
        if self.config.critical_section_ms == 0 {
            return;
        }
        let epoch = self.cs_epoch;
        let delay = Duration::from_millis(self.config.critical_section_ms);
        let events_tx = self.events_tx.clone();
        let shutdown = self.shutdown_token.clone();
        self.runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = events_tx.send(ServerEvent::LeaveCriticalSection { epoch });
                }
            }
        });
    }

    /// Leave the critical section. With `epoch` set, only when it is still
    /// the stay that timer was armed for.
    fn leave_critical_section(&mut self, epoch: Option<u64>) {
        if epoch.is_some_and(|e| e != self.cs_epoch) {
            return;
        }
        let out = self.mutex.release();
        self.apply(out);
    }

    fn connection_closed(&mut self, conn: ConnId) {
        let removed = self.routing.remove_connection(conn);
        if !removed.is_empty() {
            tracing::info!(id = %self.identity, %conn, lost = ?removed, "connection closed, routes removed");
        }
    }
}

fn unexpected(msg_type: u32, expected: ContentKind, msg: &Message) -> NetworkError {
    NetworkError::ContentMismatch {
        msg_type,
        expected: expected.name(),
        got: msg.content.kind().name(),
    }
}

struct DispatchCtx {
    entity: Arc<Entity>,
    interception: Option<Arc<InterceptionContext>>,
    poll_interval: Duration,
    shutdown_token: CancellationToken,
}

fn spawn_dispatch_loop(
    ctx: DispatchCtx,
    mut inbound_rx: mpsc::Receiver<Inbound>,
    mut events_rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.shutdown_token.cancelled() => break,
                Some(inbound) = inbound_rx.recv() => {
                    match inbound {
                        Inbound::Frame { conn, frame } => handle_frame(&ctx, conn, frame),
                        Inbound::Closed { conn } => ctx.entity.with_core(|core| core.connection_closed(conn)),
                    }
                }
                Some(event) = events_rx.recv() => {
                    match event {
                        ServerEvent::LeaveCriticalSection { epoch } => {
                            ctx.entity.with_core(|core| core.leave_critical_section(Some(epoch)));
                        }
                    }
                }
                else => break,
            }
        }
    });
}

fn handle_frame(ctx: &DispatchCtx, conn: ConnId, frame: Frame) {
    let mut core = ctx.entity.lock();
    let Some(entry) = core.routing.entry_for_connection(conn) else {
        tracing::debug!(id = %core.identity, %conn, "frame from unregistered connection");
        return;
    };
    let from_client = entry.is_local_client();
    let peer = entry.destination;
    let connection = entry.connection.clone();

    let msg = match decode_message(&frame) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(id = %core.identity, %peer, msg_type = frame.msg_type, error = %e, "failed to decode message");
            return;
        }
    };

    if from_client {
        if msg_types::is_client_type(frame.msg_type) && msg.content.kind() == ContentKind::Chat {
            core.relay_chat(frame.msg_type, msg);
        } else {
            tracing::warn!(id = %core.identity, client = %peer, msg_type = frame.msg_type, "unexpected message from client");
        }
    } else {
        core.learn_routes(&msg, &connection);
        dispatch_server_message(ctx, &mut core, frame.msg_type, msg);
    }

    drop(core);
    ctx.entity.notify_changed();
}

fn dispatch_server_message(
    ctx: &DispatchCtx,
    core: &mut ServerCore,
    msg_type: u32,
    msg: Message,
) {
    if msg_types::is_client_type(msg_type) {
        core.relay_chat(msg_type, msg);
        return;
    }

    if let Some(dest) = msg.intended_recipient.filter(|&r| r != core.identity) {
        if let Err(e) = core.send_to_peer(dest, msg_type, msg) {
            tracing::warn!(id = %core.identity, %dest, error = %e, "failed to forward message");
        }
        return;
    }

    let claimed = ctx
        .interception
        .as_ref()
        .and_then(|interception| interception.claim(core.identity, &msg));
    if let Some(interceptor) = claimed {
        spawn_delayed_delivery(
            Arc::clone(&ctx.entity),
            interceptor,
            msg,
            ctx.poll_interval,
            ctx.shutdown_token.clone(),
        );
        return;
    }

    let sender = msg.sender;
    if let Err(e) = core.execute(msg_type, msg) {
        tracing::warn!(id = %core.identity, %sender, msg_type, error = %e, "message dropped");
    }
}

#[derive(Clone, Copy, Debug)]
enum ListenerKind {
    Clients,
    Servers,
}

struct AcceptCtx {
    entity: Arc<Entity>,
    inbound_tx: mpsc::Sender<Inbound>,
    config: NetworkConfig,
    shutdown_token: CancellationToken,
}

fn spawn_accept_loop(listener: TcpListener, kind: ListenerKind, ctx: Arc<AcceptCtx>) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = ctx.shutdown_token.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let ctx = Arc::clone(&ctx);
                            tokio::spawn(async move {
                                let result = match PendingConnection::new(stream, ctx.config.max_message_size) {
                                    Ok(pending) => match kind {
                                        ListenerKind::Clients => accept_client(pending, &ctx).await,
                                        ListenerKind::Servers => accept_server(pending, &ctx).await,
                                    },
                                    Err(e) => Err(e),
                                };
                                if let Err(e) = result {
                                    tracing::warn!(%addr, ?kind, error = %e, "incoming connection rejected");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(?kind, error = %e, "accept error");
                        }
                    }
                }
            }
        }
    });
}

async fn accept_client(mut pending: PendingConnection, ctx: &AcceptCtx) -> Result<(), NetworkError> {
    let (identity, client_id) = {
        let mut core = ctx.entity.lock();
        (core.identity, core.next_client_id())
    };
    pending.send(encode_handshake(identity, client_id)?).await?;

    ctx.entity.with_core(|core| {
        let connection = pending.start(
            ctx.inbound_tx.clone(),
            ctx.config.send_queue_capacity,
            &ctx.shutdown_token,
        );
        tracing::info!(id = %identity, client = %client_id, addr = %connection.peer_addr(), "client connected");
        core.routing.add_local_client(client_id, connection);
    });
    Ok(())
}

async fn accept_server(mut pending: PendingConnection, ctx: &AcceptCtx) -> Result<(), NetworkError> {
    let timeout = Duration::from_millis(ctx.config.handshake_timeout_ms);
    let frame = tokio::time::timeout(timeout, async {
        loop {
            let frame = pending.next_frame().await?;
            if frame.msg_type == msg_types::HANDSHAKE {
                return Ok::<Frame, NetworkError>(frame);
            }
            tracing::debug!(msg_type = frame.msg_type, "skipping frame before handshake");
        }
    })
    .await
    .map_err(|_| NetworkError::HandshakeTimeout)??;
    let peer = decode_handshake(&frame)?;

    ctx.entity.with_core(|core| {
        if peer == core.identity {
            return Err(NetworkError::HandshakeFailed(
                "peer announced our own identity".into(),
            ));
        }
        let connection = pending.start(
            ctx.inbound_tx.clone(),
            ctx.config.send_queue_capacity,
            &ctx.shutdown_token,
        );
        tracing::info!(id = %core.identity, %peer, addr = %connection.peer_addr(), "server connected");
        core.routing.add_neighbour(peer, connection);
        Ok(())
    })
}

async fn connect_to_peer(peer: &PeerEndpoint, ctx: &AcceptCtx) -> Result<(), NetworkError> {
    let addr = format!("{}:{}", peer.host, ctx.config.server_port(peer.id)?);
    let identity = ctx.entity.lock().identity;
    let timeout = Duration::from_millis(ctx.config.handshake_timeout_ms);

    let mut pending = tokio::time::timeout(
        timeout,
        PendingConnection::connect(&addr, ctx.config.max_message_size),
    )
    .await
    .map_err(|_| NetworkError::ConnectionFailed(format!("connect to {addr} timed out")))??;
    pending.send(encode_handshake(identity, identity)?).await?;

    ctx.entity.with_core(|core| {
        let connection = pending.start(
            ctx.inbound_tx.clone(),
            ctx.config.send_queue_capacity,
            &ctx.shutdown_token,
        );
        tracing::info!(id = %identity, peer = %peer.id, %addr, "connected to server");
        core.routing.add_neighbour(peer.id, connection);
    });
    Ok(())
}

/// A running routing server.
pub struct Server {
    identity: EntityId,
    entity: Arc<Entity>,
    shutdown_token: CancellationToken,
}

impl Server {
    /// Bind both listeners, connect to the configured peers and announce
    /// this server to the overlay.
    pub async fn start(
        config: ServerConfig,
        interception: Option<Arc<InterceptionContext>>,
    ) -> Result<Self, NetworkError> {
        config.validate()?;
        let network = config.network;
        network.validate()?;
        let identity = config.identity;

        let client_port = network.client_port(identity)?;
        let server_port = network.server_port(identity)?;
        let client_listener = bind_listener(client_port)?;
        let server_listener = bind_listener(server_port)?;

        let shutdown_token = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let entity = Arc::new(Entity::new(ServerCore::new(
            identity,
            network,
            events_tx,
            Handle::current(),
            shutdown_token.clone(),
        )));

        spawn_dispatch_loop(
            DispatchCtx {
                entity: Arc::clone(&entity),
                interception,
                poll_interval: Duration::from_millis(network.intercept_poll_interval_ms),
                shutdown_token: shutdown_token.clone(),
            },
            inbound_rx,
            events_rx,
        );

        let accept_ctx = Arc::new(AcceptCtx {
            entity: Arc::clone(&entity),
            inbound_tx,
            config: network,
            shutdown_token: shutdown_token.clone(),
        });
        spawn_accept_loop(client_listener, ListenerKind::Clients, Arc::clone(&accept_ctx));
        spawn_accept_loop(server_listener, ListenerKind::Servers, Arc::clone(&accept_ctx));

        tracing::info!(
            id = %identity,
            client_port,
            server_port,
            "server listening"
        );

        for peer in &config.peers {
            if let Err(e) = connect_to_peer(peer, &accept_ctx).await {
                tracing::error!(id = %identity, peer = %peer.id, host = %peer.host, error = %e, "cannot connect to server");
                shutdown_token.cancel();
                return Err(e);
            }
        }

        entity.with_core(ServerCore::announce_identity);

        Ok(Self {
            identity,
            entity,
            shutdown_token,
        })
    }

    pub fn identity(&self) -> EntityId {
        self.identity
    }

    /// Run one console command. Returns `false` once the server has been
    /// asked to quit.
    pub fn treat_console_input(&self, line: &str) -> bool {
        match line.trim() {
            "quit" => {
                self.shutdown();
                return false;
            }
            "election" => self.start_election(),
            "critical section" => self.request_critical_section(),
            "" => {}
            other => tracing::warn!(id = %self.identity, command = other, "unknown command"),
        }
        true
    }

    pub fn start_election(&self) {
        tracing::info!(id = %self.identity, "starting election");
        self.entity.with_core(ServerCore::start_election);
    }

    pub fn request_critical_section(&self) {
        self.entity.with_core(ServerCore::request_critical_section);
    }

    /// Leave the critical section now instead of waiting for the timer.
    pub fn release_critical_section(&self) {
        self.entity
            .with_core(|core| core.leave_critical_section(None));
    }

    pub fn first_hop_to(&self, dest: EntityId) -> Option<EntityId> {
        self.route_to(dest).and_then(|r| r.next_hop)
    }

    pub fn route_to(&self, dest: EntityId) -> Option<Route> {
        self.entity.lock().routing.get(dest).map(|e| e.route())
    }

    /// Every destination this server can reach, with its route.
    pub fn routes(&self) -> BTreeMap<EntityId, Route> {
        self.entity
            .lock()
            .routing
            .entries()
            .map(|e| (e.destination, e.route()))
            .collect()
    }

    pub fn number_of_neighbours(&self) -> usize {
        self.entity.lock().number_of_neighbours()
    }

    pub fn number_of_local_clients(&self) -> usize {
        self.entity.lock().number_of_local_clients()
    }

    pub fn election_status(&self) -> ElectionStatus {
        self.entity.lock().election.status()
    }

    pub fn winner(&self) -> Option<EntityId> {
        self.entity.lock().election.winner()
    }

    pub fn dem(&self) -> BTreeMap<EntityId, u64> {
        self.entity.lock().mutex.dem().clone()
    }

    pub fn jet(&self) -> Option<MutexToken> {
        self.entity.lock().mutex.jet().cloned()
    }

    pub fn ns(&self) -> u64 {
        self.entity.lock().mutex.ns()
    }

    pub fn cs_status(&self) -> CsStatus {
        self.entity.lock().mutex.status()
    }

    pub fn shutdown(&self) {
        if !self.shutdown_token.is_cancelled() {
            tracing::info!(id = %self.identity, "server shutting down");
        }
        self.shutdown_token.cancel();
        self.entity.notify_changed();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown_token.cancel();
        self.entity.notify_changed();
    }
}
