//! Peers discovered through signaling servers.
//!
//! The aggregate peer list is owned by the embedding application; this module
//! defines the narrow interface the signaling core feeds and an in-memory
//! implementation used by the CLI and tests.

use dashmap::DashMap;
use signal_proto::ClientInfo;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::identity::DeviceClass;
use crate::signaling::ServerAddress;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMethod {
    Signaling { server: ServerAddress },
}

/// A device reported by a signaling server. Carries no network address;
/// reaching it always goes through the transport capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub id: Uuid,
    pub alias: String,
    pub version: String,
    pub device_model: Option<String>,
    pub device_class: Option<DeviceClass>,
    pub fingerprint: String,
    pub server: ServerAddress,
}

impl DiscoveredPeer {
    pub fn from_wire(info: ClientInfo, server: ServerAddress) -> Self {
        Self {
            id: info.id,
            alias: info.alias,
            version: info.version,
            device_model: info.device_model,
            device_class: info.device_type.map(DeviceClass::from),
            fingerprint: info.fingerprint,
            server,
        }
    }

    pub fn discovery_method(&self) -> DiscoveryMethod {
        DiscoveryMethod::Signaling {
            server: self.server.clone(),
        }
    }
}

/// Sink for discovery results. Must tolerate concurrent calls from every
/// signaling connection.
pub trait PeerRegistry: Send + Sync {
    /// Insert or replace the record for `(peer.server, peer.id)`.
    fn register_peer(&self, peer: DiscoveredPeer);
    /// Returns whether a record was removed.
    fn retract_peer(&self, server: &ServerAddress, peer_id: Uuid) -> bool;
    /// Drop every record attributed to `server`; returns how many went away.
    fn retract_server(&self, server: &ServerAddress) -> usize;
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    Registered(DiscoveredPeer),
    Retracted { server: ServerAddress, peer_id: Uuid },
}

#[derive(Debug)]
pub struct InMemoryPeerRegistry {
    peers: DashMap<(ServerAddress, Uuid), DiscoveredPeer>,
    events: broadcast::Sender<PeerEvent>,
}

impl Default for InMemoryPeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryPeerRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            peers: DashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn get(&self, server: &ServerAddress, peer_id: Uuid) -> Option<DiscoveredPeer> {
        self.peers
            .get(&(server.clone(), peer_id))
            .map(|entry| entry.value().clone())
    }

    pub fn peers_for(&self, server: &ServerAddress) -> Vec<DiscoveredPeer> {
        let mut peers: Vec<DiscoveredPeer> = self
            .peers
            .iter()
            .filter(|entry| &entry.key().0 == server)
            .map(|entry| entry.value().clone())
            .collect();
        peers.sort_by(|a, b| a.alias.cmp(&b.alias).then(a.id.cmp(&b.id)));
        peers
    }
}

impl PeerRegistry for InMemoryPeerRegistry {
    fn register_peer(&self, peer: DiscoveredPeer) {
        self.peers
            .insert((peer.server.clone(), peer.id), peer.clone());
        let _ = self.events.send(PeerEvent::Registered(peer));
    }

    fn retract_peer(&self, server: &ServerAddress, peer_id: Uuid) -> bool {
        let removed = self.peers.remove(&(server.clone(), peer_id)).is_some();
        if removed {
            let _ = self.events.send(PeerEvent::Retracted {
                server: server.clone(),
                peer_id,
            });
        }
        removed
    }

    fn retract_server(&self, server: &ServerAddress) -> usize {
        let stale: Vec<(ServerAddress, Uuid)> = self
            .peers
            .iter()
            .filter(|entry| &entry.key().0 == server)
            .map(|entry| entry.key().clone())
            .collect();
        let mut removed = 0;
        for key in stale {
            if self.peers.remove(&key).is_some() {
                removed += 1;
                let _ = self.events.send(PeerEvent::Retracted {
                    server: key.0,
                    peer_id: key.1,
                });
            }
        }
        removed
    }
}
