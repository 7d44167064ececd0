//! Shared protocol definitions for signaling-server ↔ client communication.
//! Keeping these in a dedicated crate lets other frontends (server, bindings)
//! reuse the exact message shapes without pulling in the runtime code.

mod manifest;
mod message;
mod peer;
pub mod sdp;

pub use manifest::{
    FileHeader, FileStatus, InitialMessage, InitialResponse, PinMessage, ResourceDescriptor,
    ResourceMetadata,
};
pub use message::{ClientMessage, ClientSdpMessage, ServerMessage, ServerSdpMessage};
pub use peer::{ClientInfo, ClientInfoWithoutId, PeerDeviceType};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message is not valid utf-8")]
    NotUtf8,
    #[error("invalid sdp encoding: {0}")]
    SdpEncoding(String),
}
