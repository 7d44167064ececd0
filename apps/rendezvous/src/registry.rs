//! Registry of signaling-server connections.
//!
//! Owns the configured server list and the map of live connections, runs one
//! connect-and-consume activity per server and routes every inbound message
//! to the peer registry or the session spawner.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use signal_proto::ServerMessage;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::identity::IdentityProvider;
use crate::negotiation::SessionSpawner;
use crate::peers::{DiscoveredPeer, PeerRegistry};
use crate::reconnect::ReconnectPolicy;
use crate::signaling::{
    Established, InboundFrame, ServerAddress, SignalingConnection, SignalingConnector,
};
use crate::transport::{PinConfig, TransportCapability};

#[derive(Debug, Clone, Default)]
pub struct RegistryConfig {
    pub configured_servers: Vec<ServerAddress>,
    pub stun_servers: Vec<String>,
    pub pin: Option<PinConfig>,
    pub reconnect: ReconnectPolicy,
}

/// External collaborators the registry drives.
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn SignalingConnector>,
    pub identity: Arc<dyn IdentityProvider>,
    pub peers: Arc<dyn PeerRegistry>,
    pub transport: Arc<dyn TransportCapability>,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("server {0} is not configured")]
    UnknownServer(ServerAddress),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Connected { server: ServerAddress },
    ConnectFailed { server: ServerAddress, error: String },
    Disconnected { server: ServerAddress },
    ProtocolError { server: ServerAddress, error: String },
    ServerError { server: ServerAddress, code: u16 },
}

pub type ConnectionMap = HashMap<ServerAddress, Arc<SignalingConnection>>;

pub struct SignalingRegistry {
    configured: Vec<ServerAddress>,
    reconnect: ReconnectPolicy,
    connections: RwLock<Arc<ConnectionMap>>,
    in_flight: Mutex<HashSet<ServerAddress>>,
    connector: Arc<dyn SignalingConnector>,
    identity: Arc<dyn IdentityProvider>,
    peers: Arc<dyn PeerRegistry>,
    spawner: Arc<SessionSpawner>,
    events: broadcast::Sender<RegistryEvent>,
}

impl SignalingRegistry {
    pub fn new(config: RegistryConfig, collaborators: Collaborators) -> Self {
        let mut seen = HashSet::new();
        let configured: Vec<ServerAddress> = config
            .configured_servers
            .into_iter()
            .filter(|server| seen.insert(server.clone()))
            .collect();
        let spawner = Arc::new(
            SessionSpawner::new(collaborators.transport, config.stun_servers)
                .with_pin(config.pin),
        );
        let (events, _) = broadcast::channel(256);
        Self {
            configured,
            reconnect: config.reconnect,
            connections: RwLock::new(Arc::new(ConnectionMap::new())),
            in_flight: Mutex::new(HashSet::new()),
            connector: collaborators.connector,
            identity: collaborators.identity,
            peers: collaborators.peers,
            spawner,
            events,
        }
    }

    pub fn configured_servers(&self) -> &[ServerAddress] {
        &self.configured
    }

    pub fn spawner(&self) -> &Arc<SessionSpawner> {
        &self.spawner
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the live connections.
    pub fn connections(&self) -> Arc<ConnectionMap> {
        Arc::clone(&self.connections.read())
    }

    pub fn connection(&self, server: &ServerAddress) -> Option<Arc<SignalingConnection>> {
        self.connections.read().get(server).cloned()
    }

    /// Start one activity for every configured server that does not already
    /// have one running. Returns immediately.
    pub fn start_all(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for server in &self.configured {
            if !self.in_flight.lock().insert(server.clone()) {
                debug!(server = %server, "signaling activity already running");
                continue;
            }
            let registry = Arc::clone(self);
            let server = server.clone();
            handles.push(tokio::spawn(async move {
                let _in_flight = InFlight {
                    registry: &registry,
                    server: &server,
                };
                registry.run_server(&server).await;
            }));
        }
        handles
    }

    pub fn record_connected(
        &self,
        server: ServerAddress,
        connection: Arc<SignalingConnection>,
    ) -> Result<(), RegistryError> {
        if !self.configured.contains(&server) {
            return Err(RegistryError::UnknownServer(server));
        }
        {
            let mut connections = self.connections.write();
            let mut next = ConnectionMap::clone(&connections);
            if let Some(previous) = next.insert(server.clone(), connection) {
                previous.mark_closed();
            }
            *connections = Arc::new(next);
        }
        info!(server = %server, "signaling connected");
        let _ = self.events.send(RegistryEvent::Connected { server });
        Ok(())
    }

    /// Forget the connection of `server`, retract its peers and release its
    /// sessions. No-op when the server has no live connection.
    pub fn record_disconnected(&self, server: &ServerAddress) {
        let removed = {
            let mut connections = self.connections.write();
            if !connections.contains_key(server) {
                None
            } else {
                let mut next = ConnectionMap::clone(&connections);
                let removed = next.remove(server);
                *connections = Arc::new(next);
                removed
            }
        };
        let Some(connection) = removed else {
            trace!(server = %server, "disconnect for server without a connection");
            return;
        };
        connection.mark_closed();
        let retracted = self.peers.retract_server(server);
        let released = self.spawner.release_connection(server);
        info!(server = %server, retracted, released, "signaling disconnected");
        let _ = self.events.send(RegistryEvent::Disconnected {
            server: server.clone(),
        });
    }

    /// Re-announce the current local identity on every live connection.
    /// Returns how many connections accepted the update.
    pub fn announce(&self) -> usize {
        let info = self.identity.identity().to_wire();
        self.connections()
            .values()
            .filter(|connection| match connection.update_info(info.clone()) {
                Ok(()) => true,
                Err(err) => {
                    debug!(server = %connection.server(), error = %err, "identity update not sent");
                    false
                }
            })
            .count()
    }

    async fn run_server(&self, server: &ServerAddress) {
        let mut failures = 0u32;
        loop {
            let identity = self.identity.identity().to_wire();
            let attempt = match self.connector.connect(server, &identity).await {
                Ok(established) => {
                    failures = 0;
                    self.consume(server, established).await;
                    0
                }
                Err(err) => {
                    warn!(server = %server, error = %err, "signaling connect failed");
                    let _ = self.events.send(RegistryEvent::ConnectFailed {
                        server: server.clone(),
                        error: err.to_string(),
                    });
                    failures += 1;
                    failures - 1
                }
            };
            let Some(delay) = self.reconnect.next_delay(attempt) else {
                break;
            };
            debug!(server = %server, ?delay, failures, "reconnecting after delay");
            tokio::time::sleep(delay).await;
        }
        debug!(server = %server, "signaling activity finished");
    }

    async fn consume(&self, server: &ServerAddress, established: Established) {
        let Established {
            connection,
            mut inbound,
        } = established;
        if let Err(err) = self.record_connected(server.clone(), Arc::clone(&connection)) {
            warn!(error = %err, "dropping connection");
            connection.mark_closed();
            return;
        }
        while let Some(frame) = inbound.recv().await {
            self.dispatch(&connection, frame);
        }
        self.record_disconnected(server);
    }

    fn dispatch(&self, connection: &Arc<SignalingConnection>, frame: InboundFrame) {
        let server = connection.server();
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(server = %server, error = %err, "undecodable signaling message");
                let _ = self.events.send(RegistryEvent::ProtocolError {
                    server: server.clone(),
                    error: err.to_string(),
                });
                return;
            }
        };
        trace!(server = %server, kind = message.kind(), "signaling message");

        match message {
            ServerMessage::Hello { client, peers } => {
                debug!(server = %server, id = %client.id, peers = peers.len(), "hello");
                connection.set_local_peer(client);
                for peer in peers {
                    self.peers
                        .register_peer(DiscoveredPeer::from_wire(peer, server.clone()));
                }
            }
            ServerMessage::Joined { peer } | ServerMessage::Update { peer } => {
                self.peers
                    .register_peer(DiscoveredPeer::from_wire(peer, server.clone()));
            }
            ServerMessage::Left { peer_id } => {
                if !self.peers.retract_peer(server, peer_id) {
                    trace!(server = %server, peer = %peer_id, "left for unknown peer");
                }
            }
            ServerMessage::Offer(offer) => {
                self.spawner.spawn(Arc::clone(connection), offer);
            }
            ServerMessage::Answer(answer) => {
                trace!(server = %server, session_id = %answer.session_id, "ignoring answer");
            }
            ServerMessage::Error { code } => {
                warn!(server = %server, code, "signaling server reported an error");
                let _ = self.events.send(RegistryEvent::ServerError {
                    server: server.clone(),
                    code,
                });
            }
        }
    }
}

/// Clears the in-flight mark of a server when its activity ends.
struct InFlight<'a> {
    registry: &'a SignalingRegistry,
    server: &'a ServerAddress,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.registry.in_flight.lock().remove(self.server);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use signal_proto::{
        ClientInfo, ClientInfoWithoutId, ClientMessage, ProtocolError, ServerSdpMessage,
    };
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use crate::identity::{DeviceClass, LocalIdentity, PROTOCOL_VERSION, StaticIdentity};
    use crate::negotiation::SessionStatus;
    use crate::peers::InMemoryPeerRegistry;
    use crate::signaling::SignalingError;
    use crate::transport::MockTransport;

    #[derive(Default)]
    struct ScriptedConnector {
        failing: HashSet<ServerAddress>,
        attempts: Mutex<Vec<(ServerAddress, ClientInfoWithoutId)>>,
        feeds: Mutex<HashMap<ServerAddress, mpsc::UnboundedSender<InboundFrame>>>,
        outbound: Mutex<Vec<mpsc::UnboundedReceiver<ClientMessage>>>,
    }

    impl ScriptedConnector {
        fn failing(servers: &[&str]) -> Self {
            Self {
                failing: servers.iter().map(|s| ServerAddress::from(*s)).collect(),
                ..Default::default()
            }
        }

        fn attempts(&self) -> usize {
            self.attempts.lock().len()
        }

        fn feed(&self, server: &str, message: ServerMessage) {
            self.feed_frame(server, Ok(message));
        }

        fn feed_frame(&self, server: &str, frame: InboundFrame) {
            let feeds = self.feeds.lock();
            let sender = feeds.get(&ServerAddress::from(server)).expect("server connected");
            sender.send(frame).expect("activity still consuming");
        }

        fn hang_up(&self, server: &str) {
            self.feeds.lock().remove(&ServerAddress::from(server));
        }
    }

    #[async_trait]
    impl SignalingConnector for ScriptedConnector {
        async fn connect(
            &self,
            server: &ServerAddress,
            identity: &ClientInfoWithoutId,
        ) -> Result<Established, SignalingError> {
            self.attempts
                .lock()
                .push((server.clone(), identity.clone()));
            if self.failing.contains(server) {
                return Err(SignalingError::Connect("connection refused".into()));
            }
            let (connection, outbound) = SignalingConnection::detached(server.clone());
            let (tx, inbound) = mpsc::unbounded_channel();
            self.feeds.lock().insert(server.clone(), tx);
            self.outbound.lock().push(outbound);
            Ok(Established {
                connection,
                inbound,
            })
        }
    }

    struct Harness {
        registry: Arc<SignalingRegistry>,
        connector: Arc<ScriptedConnector>,
        peers: Arc<InMemoryPeerRegistry>,
        transport: Arc<MockTransport>,
    }

    fn harness(servers: &[&str], connector: ScriptedConnector, reconnect: ReconnectPolicy) -> Harness {
        let connector = Arc::new(connector);
        let peers = Arc::new(InMemoryPeerRegistry::new());
        let transport = Arc::new(MockTransport::accepting(Vec::new()));
        let identity = Arc::new(StaticIdentity::new(LocalIdentity {
            alias: "Receiver".into(),
            protocol_version: PROTOCOL_VERSION.into(),
            device_model: None,
            device_class: DeviceClass::Desktop,
            fingerprint: "local-fp".into(),
        }));
        let registry = Arc::new(SignalingRegistry::new(
            RegistryConfig {
                configured_servers: servers.iter().map(|s| ServerAddress::from(*s)).collect(),
                stun_servers: vec!["stun:stun.example.org:3478".into()],
                pin: None,
                reconnect,
            },
            Collaborators {
                connector: connector.clone(),
                identity,
                peers: peers.clone(),
                transport: transport.clone(),
            },
        ));
        Harness {
            registry,
            connector,
            peers,
            transport,
        }
    }

    fn client(id: u128, alias: &str) -> ClientInfo {
        ClientInfo {
            id: Uuid::from_u128(id),
            alias: alias.into(),
            version: PROTOCOL_VERSION.into(),
            device_model: None,
            device_type: None,
            fingerprint: format!("fp-{id}"),
        }
    }

    fn offer(from: u128, session_id: &str) -> ServerMessage {
        ServerMessage::Offer(ServerSdpMessage {
            peer: client(from, "sender"),
            session_id: session_id.into(),
            sdp: "c2Rw".into(),
        })
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        while !check() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    async fn wait_connected(events: &mut broadcast::Receiver<RegistryEvent>, count: usize) {
        let mut seen = 0;
        while seen < count {
            if let Ok(RegistryEvent::Connected { .. }) = events.recv().await {
                seen += 1;
            }
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn start_all_attempts_each_server_once() {
        let h = harness(
            &["wss://s1", "wss://s2", "wss://s1"],
            ScriptedConnector::default(),
            ReconnectPolicy::Never,
        );
        assert_eq!(h.registry.configured_servers().len(), 2);
        let mut events = h.registry.subscribe();

        assert_eq!(h.registry.start_all().len(), 2);
        wait_connected(&mut events, 2).await;
        assert!(h.registry.start_all().is_empty());
        assert_eq!(h.connector.attempts(), 2);

        let (_, identity) = h.connector.attempts.lock()[0].clone();
        assert_eq!(identity.alias, "Receiver");
        assert_eq!(identity.fingerprint, "local-fp");
    }

    #[test_timeout::tokio_timeout_test]
    async fn restart_after_activity_ends() {
        let h = harness(&["wss://s1"], ScriptedConnector::default(), ReconnectPolicy::Never);
        let mut events = h.registry.subscribe();
        let handles = h.registry.start_all();
        wait_connected(&mut events, 1).await;

        h.connector.hang_up("wss://s1");
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(h.registry.connections().is_empty());

        assert_eq!(h.registry.start_all().len(), 1);
        wait_connected(&mut events, 1).await;
        assert_eq!(h.connector.attempts(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn connect_failure_never_enters_the_map() {
        let h = harness(
            &["wss://down", "wss://up"],
            ScriptedConnector::failing(&["wss://down"]),
            ReconnectPolicy::Never,
        );
        let mut events = h.registry.subscribe();
        h.registry.start_all();
        loop {
            if let Ok(RegistryEvent::ConnectFailed { server, error }) = events.recv().await {
                assert_eq!(server.as_str(), "wss://down");
                assert!(error.contains("connection refused"));
                break;
            }
        }
        eventually(|| h.registry.connection(&"wss://up".into()).is_some()).await;
        assert!(h.registry.connection(&"wss://down".into()).is_none());
        assert_eq!(h.registry.connections().len(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn backoff_stops_after_max_attempts() {
        let policy = ReconnectPolicy::Backoff {
            initial: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            max_attempts: Some(2),
            jitter: false,
        };
        let h = harness(&["wss://down"], ScriptedConnector::failing(&["wss://down"]), policy);
        for handle in h.registry.start_all() {
            handle.await.unwrap();
        }
        assert_eq!(h.connector.attempts(), 3);
    }

    #[test]
    fn only_configured_servers_can_be_recorded() {
        let h = harness(&["wss://s1"], ScriptedConnector::default(), ReconnectPolicy::Never);
        let (stray, _) = SignalingConnection::detached("wss://stray".into());
        assert!(matches!(
            h.registry.record_connected("wss://stray".into(), stray),
            Err(RegistryError::UnknownServer(_))
        ));

        let (known, _) = SignalingConnection::detached("wss://s1".into());
        h.registry.record_connected("wss://s1".into(), known).unwrap();
        let connections = h.registry.connections();
        assert!(
            connections
                .keys()
                .all(|server| h.registry.configured_servers().contains(server))
        );
    }

    #[test]
    fn record_disconnected_is_idempotent() {
        let h = harness(&["wss://s1"], ScriptedConnector::default(), ReconnectPolicy::Never);
        let mut events = h.registry.subscribe();
        h.registry.record_disconnected(&"wss://s1".into());

        let (connection, _) = SignalingConnection::detached("wss://s1".into());
        h.registry
            .record_connected("wss://s1".into(), Arc::clone(&connection))
            .unwrap();
        let snapshot = h.registry.connections();
        h.registry.record_disconnected(&"wss://s1".into());
        h.registry.record_disconnected(&"wss://s1".into());

        assert!(!connection.is_alive());
        assert!(h.registry.connections().is_empty());
        assert_eq!(snapshot.len(), 1);
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Connected { .. })));
        assert!(matches!(events.try_recv(), Ok(RegistryEvent::Disconnected { .. })));
        assert!(events.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn hello_registers_every_listed_peer() {
        let h = harness(&["wss://s1"], ScriptedConnector::default(), ReconnectPolicy::Never);
        let mut events = h.registry.subscribe();
        h.registry.start_all();
        wait_connected(&mut events, 1).await;

        h.connector.feed(
            "wss://s1",
            ServerMessage::Hello {
                client: client(100, "me"),
                peers: vec![client(1, "a"), client(2, "b"), client(3, "c")],
            },
        );
        eventually(|| h.peers.len() == 3).await;
        let connection = h.registry.connection(&"wss://s1".into()).unwrap();
        assert_eq!(connection.local_peer().map(|p| p.id), Some(Uuid::from_u128(100)));
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_update_and_left_follow_the_server() {
        let h = harness(&["wss://s1"], ScriptedConnector::default(), ReconnectPolicy::Never);
        let mut events = h.registry.subscribe();
        h.registry.start_all();
        wait_connected(&mut events, 1).await;
        let s1 = ServerAddress::from("wss://s1");

        h.connector.feed("wss://s1", ServerMessage::Joined { peer: client(1, "a") });
        h.connector.feed("wss://s1", ServerMessage::Update { peer: client(1, "a2") });
        h.connector.feed("wss://s1", ServerMessage::Left { peer_id: Uuid::from_u128(99) });
        h.connector.feed("wss://s1", ServerMessage::Joined { peer: client(2, "b") });
        eventually(|| h.peers.len() == 2).await;
        assert_eq!(h.peers.get(&s1, Uuid::from_u128(1)).unwrap().alias, "a2");

        h.connector.feed("wss://s1", ServerMessage::Left { peer_id: Uuid::from_u128(1) });
        eventually(|| h.peers.len() == 1).await;
        assert!(h.peers.get(&s1, Uuid::from_u128(2)).is_some());
    }

    #[test_timeout::tokio_timeout_test]
    async fn bad_frames_and_server_errors_keep_the_connection() {
        let h = harness(&["wss://s1"], ScriptedConnector::default(), ReconnectPolicy::Never);
        let mut events = h.registry.subscribe();
        h.registry.start_all();
        wait_connected(&mut events, 1).await;

        h.connector
            .feed_frame("wss://s1", Err(ProtocolError::NotUtf8));
        h.connector.feed("wss://s1", ServerMessage::Error { code: 429 });
        h.connector.feed("wss://s1", ServerMessage::Joined { peer: client(1, "a") });
        eventually(|| h.peers.len() == 1).await;

        assert!(matches!(events.recv().await, Ok(RegistryEvent::ProtocolError { .. })));
        assert!(matches!(
            events.recv().await,
            Ok(RegistryEvent::ServerError { code: 429, .. })
        ));
        assert!(h.registry.connection(&"wss://s1".into()).is_some());
    }

    #[test_timeout::tokio_timeout_test(10, multi_thread)]
    async fn concurrent_offers_spawn_one_session_each() {
        let h = harness(
            &["wss://s1", "wss://s2"],
            ScriptedConnector::default(),
            ReconnectPolicy::Never,
        );
        let mut events = h.registry.subscribe();
        h.registry.start_all();
        wait_connected(&mut events, 2).await;

        h.connector.feed("wss://s1", offer(1, "same"));
        h.connector.feed("wss://s2", offer(1, "same"));
        h.connector.feed("wss://s1", offer(2, "other"));
        let spawner = Arc::clone(h.registry.spawner());
        eventually(|| spawner.len() == 3).await;

        assert_eq!(spawner.active_for(&"wss://s1".into()).len(), 2);
        assert_eq!(spawner.active_for(&"wss://s2".into()).len(), 1);
        eventually(|| h.transport.accept_calls() == 3).await;
    }

    #[test_timeout::tokio_timeout_test]
    async fn stream_end_retracts_peers_but_keeps_sessions() {
        let h = harness(&["wss://s1", "wss://s2"], ScriptedConnector::default(), ReconnectPolicy::Never);
        let mut events = h.registry.subscribe();
        h.registry.start_all();
        wait_connected(&mut events, 2).await;

        h.connector.feed(
            "wss://s1",
            ServerMessage::Hello {
                client: client(100, "me"),
                peers: vec![client(1, "a"), client(2, "b")],
            },
        );
        h.connector.feed("wss://s2", ServerMessage::Joined { peer: client(1, "a") });
        h.connector.feed("wss://s1", offer(1, "x"));
        h.connector.feed("wss://s1", offer(2, "y"));

        let spawner = Arc::clone(h.registry.spawner());
        eventually(|| spawner.len() == 2 && h.peers.len() == 3).await;
        let sessions = spawner.active_for(&"wss://s1".into());
        for session in &sessions {
            session
                .wait_until(|state| state.status == Some(SessionStatus::Connected))
                .await;
        }

        h.connector.hang_up("wss://s1");
        eventually(|| h.registry.connection(&"wss://s1".into()).is_none()).await;

        assert!(h.peers.peers_for(&"wss://s1".into()).is_empty());
        assert_eq!(h.peers.peers_for(&"wss://s2".into()).len(), 1);
        assert!(spawner.is_empty());
        for session in &sessions {
            assert_eq!(session.status(), Some(SessionStatus::Connected));
            assert!(!session.connection().is_alive());
        }
    }

    #[test_timeout::tokio_timeout_test]
    async fn announce_reaches_live_connections() {
        let h = harness(&["wss://s1"], ScriptedConnector::default(), ReconnectPolicy::Never);
        assert_eq!(h.registry.announce(), 0);

        let (connection, mut outbound) = SignalingConnection::detached("wss://s1".into());
        h.registry.record_connected("wss://s1".into(), connection).unwrap();
        assert_eq!(h.registry.announce(), 1);
        assert!(matches!(
            outbound.recv().await,
            Some(ClientMessage::Update { info }) if info.alias == "Receiver"
        ));
    }
}
