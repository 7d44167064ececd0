//! Data-channel framing for control messages.
//!
//! JSON control payloads are split into binary frames of at most
//! [`CHUNK_SIZE`] bytes and terminated by an empty text frame.

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::TransportError;

pub const CHUNK_SIZE: usize = 16 * 1024;

/// Split `payload` into frames of at most [`CHUNK_SIZE`] bytes.
pub fn chunk(mut payload: Bytes) -> Vec<Bytes> {
    let mut frames = Vec::with_capacity(payload.len().div_ceil(CHUNK_SIZE));
    while payload.len() > CHUNK_SIZE {
        frames.push(payload.split_to(CHUNK_SIZE));
    }
    if !payload.is_empty() {
        frames.push(payload);
    }
    frames
}

pub fn encode_control<T: Serialize>(message: &T) -> Result<Vec<Bytes>, TransportError> {
    let json = serde_json::to_vec(message)
        .map_err(|err| TransportError::Channel(format!("encode control message: {err}")))?;
    Ok(chunk(Bytes::from(json)))
}

/// Collects binary frames until the terminating text frame.
#[derive(Debug, Default)]
pub struct ControlAssembler {
    buffer: BytesMut,
}

impl ControlAssembler {
    pub fn push(&mut self, frame: &[u8]) {
        self.buffer.extend_from_slice(frame);
    }

    pub fn finish<T: DeserializeOwned>(&mut self) -> Result<T, TransportError> {
        let raw = self.buffer.split().freeze();
        serde_json::from_slice(&raw)
            .map_err(|err| TransportError::Channel(format!("decode control message: {err}")))
    }
}
