use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{ClientInfo, ClientInfoWithoutId, ProtocolError};

/// Messages received from the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    /// First message after the handshake: our own record plus everyone already present.
    Hello {
        client: ClientInfo,
        peers: Vec<ClientInfo>,
    },
    #[serde(rename = "JOIN", alias = "JOINED")]
    Joined { peer: ClientInfo },
    /// A known peer changed its alias or device info.
    Update { peer: ClientInfo },
    Left {
        #[serde(rename = "peerId")]
        peer_id: Uuid,
    },
    Offer(ServerSdpMessage),
    Answer(ServerSdpMessage),
    Error { code: u16 },
}

impl ServerMessage {
    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?;
        Self::from_text(text)
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Hello { .. } => "hello",
            ServerMessage::Joined { .. } => "joined",
            ServerMessage::Update { .. } => "update",
            ServerMessage::Left { .. } => "left",
            ServerMessage::Offer(_) => "offer",
            ServerMessage::Answer(_) => "answer",
            ServerMessage::Error { .. } => "error",
        }
    }
}

/// Offer or answer relayed by the server on behalf of `peer`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ServerSdpMessage {
    pub peer: ClientInfo,
    pub session_id: String,
    pub sdp: String,
}

/// Messages sent to the signaling server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Update { info: ClientInfoWithoutId },
    Offer(ClientSdpMessage),
    Answer(ClientSdpMessage),
}

impl ClientMessage {
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_text(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClientSdpMessage {
    pub session_id: String,
    pub target: Uuid,
    pub sdp: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PeerDeviceType;
    use serde_json::json;

    fn peer_json(id: &str, alias: &str) -> serde_json::Value {
        json!({
            "id": id,
            "alias": alias,
            "version": "2.3",
            "deviceModel": "Pixel",
            "deviceType": "mobile",
            "fingerprint": format!("fp-{alias}"),
        })
    }

    #[test]
    fn decodes_hello_with_peers() {
        let text = json!({
            "type": "HELLO",
            "client": peer_json("4b1f3c8e-0000-4000-8000-000000000001", "me"),
            "peers": [
                peer_json("4b1f3c8e-0000-4000-8000-000000000002", "alice"),
                peer_json("4b1f3c8e-0000-4000-8000-000000000003", "bob"),
            ],
        })
        .to_string();

        let ServerMessage::Hello { client, peers } = ServerMessage::from_text(&text).unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(client.alias, "me");
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].alias, "bob");
        assert_eq!(peers[0].device_type, Some(PeerDeviceType::Mobile));
    }

    #[test]
    fn join_accepts_both_spellings() {
        for tag in ["JOIN", "JOINED"] {
            let text = json!({
                "type": tag,
                "peer": peer_json("4b1f3c8e-0000-4000-8000-000000000002", "alice"),
            })
            .to_string();
            let message = ServerMessage::from_text(&text).unwrap();
            assert_eq!(message.kind(), "joined");
        }
    }

    #[test]
    fn decodes_left_offer_and_error() {
        let left = ServerMessage::from_text(
            r#"{"type":"LEFT","peerId":"4b1f3c8e-0000-4000-8000-000000000002"}"#,
        )
        .unwrap();
        assert!(matches!(left, ServerMessage::Left { .. }));

        let offer = json!({
            "type": "OFFER",
            "peer": peer_json("4b1f3c8e-0000-4000-8000-000000000002", "alice"),
            "sessionId": "s-1",
            "sdp": "abc",
        })
        .to_string();
        let ServerMessage::Offer(offer) = ServerMessage::from_text(&offer).unwrap() else {
            panic!("expected offer");
        };
        assert_eq!(offer.session_id, "s-1");
        assert_eq!(offer.sdp, "abc");

        let error = ServerMessage::from_text(r#"{"type":"ERROR","code":429}"#).unwrap();
        assert_eq!(error, ServerMessage::Error { code: 429 });
    }

    #[test]
    fn rejects_unknown_kind_and_garbage() {
        assert!(ServerMessage::from_text(r#"{"type":"PING"}"#).is_err());
        assert!(ServerMessage::from_text("not json").is_err());
        assert!(matches!(
            ServerMessage::from_slice(&[0xff, 0xfe]),
            Err(ProtocolError::NotUtf8)
        ));
    }

    #[test]
    fn answer_uses_camel_case_fields() {
        let message = ClientMessage::Answer(ClientSdpMessage {
            session_id: "s-1".into(),
            target: Uuid::nil(),
            sdp: "xyz".into(),
        });
        let value: serde_json::Value =
            serde_json::from_str(&message.to_text().unwrap()).unwrap();
        assert_eq!(value["type"], "ANSWER");
        assert_eq!(value["sessionId"], "s-1");
        assert_eq!(value["target"], Uuid::nil().to_string());
    }
}
