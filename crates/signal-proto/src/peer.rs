use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device class as it travels over the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PeerDeviceType {
    #[serde(alias = "MOBILE")]
    Mobile,
    #[serde(alias = "DESKTOP")]
    Desktop,
    #[serde(alias = "WEB")]
    Web,
    #[serde(alias = "HEADLESS")]
    Headless,
    #[serde(alias = "SERVER")]
    Server,
}

impl PeerDeviceType {
    pub const ALL: [PeerDeviceType; 5] = [
        PeerDeviceType::Mobile,
        PeerDeviceType::Desktop,
        PeerDeviceType::Web,
        PeerDeviceType::Headless,
        PeerDeviceType::Server,
    ];
}

/// Peer record as reported by the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub id: Uuid,
    pub alias: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<PeerDeviceType>,
    pub fingerprint: String,
}

/// Identity presented when opening a connection; the server assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfoWithoutId {
    pub alias: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<PeerDeviceType>,
    pub fingerprint: String,
}

impl From<ClientInfo> for ClientInfoWithoutId {
    fn from(info: ClientInfo) -> Self {
        Self {
            alias: info.alias,
            version: info.version,
            device_model: info.device_model,
            device_type: info.device_type,
            fingerprint: info.fingerprint,
        }
    }
}
