//! Peer transport capability.
//!
//! The negotiation session only sees the two traits below. A concrete
//! capability turns an inbound offer into an open data channel and hands back
//! a controller for the rest of the exchange; everything below that (ICE,
//! DTLS, SCTP) stays inside the implementation. Per-resource refusals and the
//! receiver's per-resource verdicts also travel through the controller.

#[cfg(feature = "webrtc")]
mod exchange;
pub mod framing;
pub mod mock;
#[cfg(feature = "webrtc")]
pub mod webrtc;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use signal_proto::{FileStatus, ResourceDescriptor};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::negotiation::{NegotiationOffer, SessionStatus};
use crate::signaling::{SignalingConnection, SignalingError};

pub use mock::MockTransport;
#[cfg(feature = "webrtc")]
pub use webrtc::WebRtcTransport;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid offer: {0}")]
    InvalidOffer(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
    #[error("data channel error: {0}")]
    Channel(String),
    #[error("{0} already taken")]
    AlreadyTaken(&'static str),
    #[error("transport closed")]
    Closed,
}

/// Status updates from the transport to the owning session.
pub type StatusSink = mpsc::UnboundedSender<SessionStatus>;

/// Require the sender to present `pin` before the manifest is read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinConfig {
    pub pin: String,
    /// Wrong attempts allowed before the session ends as `TooManyAttempts`.
    pub max_tries: u8,
}

/// Everything a capability needs to answer one offer.
#[derive(Debug)]
pub struct AcceptRequest {
    pub stun_servers: Vec<String>,
    pub pin: Option<PinConfig>,
    pub offer: NegotiationOffer,
    /// Connection the offer arrived on; the answer goes back through it.
    pub connection: Arc<SignalingConnection>,
    pub status: StatusSink,
}

/// One accepted resource as it starts arriving.
#[derive(Debug)]
pub struct IncomingResource {
    pub descriptor: ResourceDescriptor,
    pub data: mpsc::Receiver<Bytes>,
}

/// A resource the sender tried to push but the receiver refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceError {
    /// `"unknown"` when data arrived without a header.
    pub id: String,
    pub error: String,
}

#[async_trait]
pub trait TransportCapability: Send + Sync {
    /// Answer `request.offer`. Resolves with a controller once the answer has
    /// been sent back through the signaling connection.
    async fn accept_negotiation(
        &self,
        request: AcceptRequest,
    ) -> Result<Arc<dyn NegotiationController>, TransportError>;
}

#[async_trait]
pub trait NegotiationController: Send + Sync {
    /// The remote side's manifest. Resolves once it has been received.
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, TransportError>;

    /// `Some(ids)` accepts that subset, `None` declines the whole offer.
    /// Only the first call has an effect.
    async fn respond(&self, selection: Option<HashSet<String>>) -> Result<(), TransportError>;

    /// Stream of accepted resources. Can be taken once.
    async fn take_incoming(&self) -> Result<mpsc::Receiver<IncomingResource>, TransportError>;

    /// Per-resource failures while receiving. Can be taken once.
    async fn take_errors(&self) -> Result<mpsc::UnboundedReceiver<ResourceError>, TransportError>;

    /// Tell the sender whether one received resource was stored.
    async fn report(&self, status: FileStatus) -> Result<(), TransportError>;

    async fn close(&self);
}
