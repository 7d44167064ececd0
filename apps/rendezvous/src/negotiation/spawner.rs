use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::debug;

use super::{NegotiationOffer, NegotiationSession, SessionKey, SessionStatus};
use crate::signaling::{ServerAddress, SignalingConnection};
use crate::transport::{PinConfig, TransportCapability};

#[derive(Debug, Clone)]
pub enum SessionEvent {
    Spawned {
        key: SessionKey,
        session: Arc<NegotiationSession>,
    },
    Completed {
        key: SessionKey,
        status: SessionStatus,
    },
}

/// Creates one session per inbound offer and tracks it until it reaches a
/// terminal status or its connection goes away.
pub struct SessionSpawner {
    transport: Arc<dyn TransportCapability>,
    stun_servers: Vec<String>,
    pin: Option<PinConfig>,
    sessions: DashMap<SessionKey, Arc<NegotiationSession>>,
    next_seq: AtomicU64,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionSpawner {
    pub fn new(transport: Arc<dyn TransportCapability>, stun_servers: Vec<String>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            transport,
            stun_servers,
            pin: None,
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(0),
            events,
        }
    }

    /// Gate every session behind this PIN.
    pub fn with_pin(mut self, pin: Option<PinConfig>) -> Self {
        self.pin = pin;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Start a session for `offer`, scoped to the connection it arrived on.
    /// Offers are never deduplicated.
    pub fn spawn(
        self: &Arc<Self>,
        connection: Arc<SignalingConnection>,
        offer: NegotiationOffer,
    ) -> Arc<NegotiationSession> {
        let key = SessionKey {
            server: connection.server().clone(),
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
        };
        debug!(
            session = %key,
            session_id = %offer.session_id,
            peer = %offer.peer.id,
            "spawning negotiation session"
        );
        let session = NegotiationSession::new(key.clone(), offer, connection);
        session.apply_status(SessionStatus::Negotiating);
        self.sessions.insert(key.clone(), Arc::clone(&session));
        let _ = self.events.send(SessionEvent::Spawned {
            key: key.clone(),
            session: Arc::clone(&session),
        });

        let spawner = Arc::clone(self);
        let driven = Arc::clone(&session);
        let transport = Arc::clone(&self.transport);
        let stun_servers = self.stun_servers.clone();
        let pin = self.pin.clone();
        tokio::spawn(async move {
            Arc::clone(&driven).run(transport, stun_servers, pin).await;
            let state = driven
                .wait_until(|state| state.status.as_ref().is_some_and(SessionStatus::is_terminal))
                .await;
            match state.status {
                Some(status) => spawner.complete(&key, status),
                None => debug!(session = %key, "session left without a status"),
            }
        });
        session
    }

    fn complete(&self, key: &SessionKey, status: SessionStatus) {
        self.sessions.remove(key);
        debug!(session = %key, %status, "session completed");
        let _ = self.events.send(SessionEvent::Completed {
            key: key.clone(),
            status,
        });
    }

    /// Stop tracking every session of `server`. The sessions keep running.
    pub fn release_connection(&self, server: &ServerAddress) -> usize {
        let mut released = 0;
        self.sessions.retain(|key, _| {
            let keep = &key.server != server;
            if !keep {
                released += 1;
            }
            keep
        });
        if released > 0 {
            debug!(server = %server, released, "released sessions of closed connection");
        }
        released
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn active(&self) -> Vec<Arc<NegotiationSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn active_for(&self, server: &ServerAddress) -> Vec<Arc<NegotiationSession>> {
        self.sessions
            .iter()
            .filter(|entry| &entry.key().server == server)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}
