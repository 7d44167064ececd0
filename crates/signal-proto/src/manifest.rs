//! Messages exchanged on the peer data channel once it is open.
//!
//! The offering side first streams an [`InitialMessage`] listing every offered
//! resource (binary frames, terminated by an empty text frame). The receiving
//! side replies with an [`InitialResponse`] that maps each accepted resource id
//! to a one-time token. Each resource is then preceded by a [`FileHeader`].
//!
//! A receiver that requires a PIN runs the [`PinMessage`] exchange first. Once
//! a resource is stored the receiver may answer with a [`FileStatus`].

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Metadata for one offered item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    pub id: String,
    pub file_name: String,
    pub size: u64,
    pub file_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ResourceMetadata>,
}

impl ResourceDescriptor {
    pub fn new(
        id: impl Into<String>,
        file_name: impl Into<String>,
        size: u64,
        file_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            file_name: file_name.into(),
            size,
            file_type: file_type.into(),
            sha256: None,
            preview: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessed: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitialMessage {
    pub files: Vec<ResourceDescriptor>,
}

/// Accepted resource id → transfer token. An empty map declines everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InitialResponse {
    pub files: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileHeader {
    pub id: String,
    pub token: String,
}

/// Receiver's verdict on one transferred resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileStatus {
    pub id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// PIN gate run before the manifest when the receiver requires one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PinMessage {
    PinRequired,
    Pin { pin: String },
    Accepted,
    TooManyAttempts,
}
