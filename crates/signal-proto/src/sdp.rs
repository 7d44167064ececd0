//! Compact SDP encoding used on the signaling channel.
//!
//! Session descriptions are brotli-compressed and then base64url encoded
//! (no padding) so they fit comfortably in a single signaling frame.

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

use crate::ProtocolError;

const BUFFER_SIZE: usize = 4096;
const QUALITY: u32 = 11;
const WINDOW: u32 = 24;

pub fn encode_sdp(sdp: &str) -> Result<String, ProtocolError> {
    let mut compressor = brotli::CompressorWriter::new(Vec::new(), BUFFER_SIZE, QUALITY, WINDOW);
    compressor
        .write_all(sdp.as_bytes())
        .map_err(|err| ProtocolError::SdpEncoding(format!("compression failed: {err}")))?;
    Ok(URL_SAFE_NO_PAD.encode(compressor.into_inner()))
}

pub fn decode_sdp(encoded: &str) -> Result<String, ProtocolError> {
    let compressed = URL_SAFE_NO_PAD
        .decode(encoded.trim())
        .map_err(|err| ProtocolError::SdpEncoding(format!("invalid base64: {err}")))?;
    let mut decompressor = brotli::Decompressor::new(&compressed[..], BUFFER_SIZE);
    let mut raw = Vec::new();
    decompressor
        .read_to_end(&mut raw)
        .map_err(|err| ProtocolError::SdpEncoding(format!("decompression failed: {err}")))?;
    String::from_utf8(raw).map_err(|_| ProtocolError::NotUtf8)
}
