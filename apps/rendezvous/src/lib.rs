pub mod config;
pub mod identity;
pub mod negotiation;
pub mod peers;
pub mod reconnect;
pub mod registry;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use negotiation::{NegotiationSession, SessionEvent, SessionSpawner, SessionStatus};
pub use registry::{Collaborators, RegistryConfig, RegistryEvent, SignalingRegistry};
pub use signaling::{ServerAddress, SignalingConnection, SignalingConnector};
