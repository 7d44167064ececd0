//! Persistent connections to signaling servers.
//!
//! A [`SignalingConnector`] opens one authenticated connection and hands back
//! the shared [`SignalingConnection`] (send side + liveness) together with the
//! ordered stream of decoded inbound messages. Decode failures arrive as `Err`
//! items on that stream so a single bad frame never tears the connection down.

pub mod websocket;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use signal_proto::{
    ClientInfo, ClientInfoWithoutId, ClientMessage, ClientSdpMessage, ProtocolError,
    ServerMessage,
};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use websocket::WebSocketConnector;

/// URI of a signaling server. Used as the registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerAddress(String);

impl ServerAddress {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServerAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ServerAddress {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling handshake rejected: {0}")]
    Handshake(String),
    #[error("failed to encode identity: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("signaling connection closed")]
    Closed,
}

pub type InboundFrame = Result<ServerMessage, ProtocolError>;

/// One live connection to one signaling server.
#[derive(Debug)]
pub struct SignalingConnection {
    server: ServerAddress,
    outbound: mpsc::UnboundedSender<ClientMessage>,
    alive: AtomicBool,
    local_peer: RwLock<Option<ClientInfo>>,
}

impl SignalingConnection {
    pub fn new(server: ServerAddress, outbound: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self {
            server,
            outbound,
            alive: AtomicBool::new(true),
            local_peer: RwLock::new(None),
        }
    }

    /// A connection whose outbound side is a plain channel. Useful for
    /// in-process servers and tests.
    pub fn detached(
        server: ServerAddress,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(server, tx)), rx)
    }

    pub fn server(&self) -> &ServerAddress {
        &self.server
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    pub fn mark_closed(&self) {
        self.alive.store(false, Ordering::Release);
    }

    /// Our own record as assigned by the server in `HELLO`.
    pub fn local_peer(&self) -> Option<ClientInfo> {
        self.local_peer.read().clone()
    }

    pub fn set_local_peer(&self, info: ClientInfo) {
        *self.local_peer.write() = Some(info);
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if !self.alive.load(Ordering::Acquire) {
            return Err(SignalingError::Closed);
        }
        self.outbound
            .send(message)
            .map_err(|_| SignalingError::Closed)
    }

    pub fn send_answer(
        &self,
        session_id: impl Into<String>,
        target: Uuid,
        sdp: impl Into<String>,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Answer(ClientSdpMessage {
            session_id: session_id.into(),
            target,
            sdp: sdp.into(),
        }))
    }

    pub fn send_offer(
        &self,
        session_id: impl Into<String>,
        target: Uuid,
        sdp: impl Into<String>,
    ) -> Result<(), SignalingError> {
        self.send(ClientMessage::Offer(ClientSdpMessage {
            session_id: session_id.into(),
            target,
            sdp: sdp.into(),
        }))
    }

    pub fn update_info(&self, info: ClientInfoWithoutId) -> Result<(), SignalingError> {
        self.send(ClientMessage::Update { info })
    }
}

/// A freshly opened connection plus its inbound message stream.
#[derive(Debug)]
pub struct Established {
    pub connection: Arc<SignalingConnection>,
    pub inbound: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
pub trait SignalingConnector: Send + Sync {
    /// Open and authenticate. Resolves once the handshake completed or failed.
    async fn connect(
        &self,
        server: &ServerAddress,
        identity: &ClientInfoWithoutId,
    ) -> Result<Established, SignalingError>;
}
