use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures_util::{SinkExt, StreamExt};
use signal_proto::{ClientInfoWithoutId, ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError as WsProtocolError},
};
use tracing::{debug, trace, warn};
use url::Url;

use super::{
    Established, InboundFrame, ServerAddress, SignalingConnection, SignalingConnector,
    SignalingError,
};

/// Query parameter carrying the encoded identity on the handshake request.
const IDENTITY_PARAM: &str = "d";

/// Connects over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(
        &self,
        server: &ServerAddress,
        identity: &ClientInfoWithoutId,
    ) -> Result<Established, SignalingError> {
        let url = handshake_url(server, identity)?;
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| match err {
            WsError::Http(response) => {
                SignalingError::Handshake(format!("http status {}", response.status()))
            }
            other => SignalingError::Connect(other.to_string()),
        })?;
        debug!(server = %server, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<InboundFrame>();
        let connection = Arc::new(SignalingConnection::new(server.clone(), outbound_tx));

        let writer_server = server.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(server = %writer_server, error = %err, "dropping unencodable message");
                        continue;
                    }
                };
                trace!(server = %writer_server, len = text.len(), "ws_out");
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader_connection = Arc::clone(&connection);
        let reader_server = server.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let decoded = match frame {
                    Ok(Message::Text(text)) => {
                        trace!(server = %reader_server, kind = "text", len = text.len(), "ws_in");
                        ServerMessage::from_text(&text)
                    }
                    Ok(Message::Binary(data)) => {
                        trace!(server = %reader_server, kind = "binary", len = data.len(), "ws_in");
                        ServerMessage::from_slice(&data)
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        match &err {
                            WsError::ConnectionClosed
                            | WsError::AlreadyClosed
                            | WsError::Protocol(WsProtocolError::ResetWithoutClosingHandshake) => {
                                debug!(server = %reader_server, "signaling websocket closed: {err}");
                            }
                            _ => {
                                warn!(server = %reader_server, "signaling websocket error: {err}");
                            }
                        }
                        break;
                    }
                };
                if inbound_tx.send(decoded).is_err() {
                    break;
                }
            }
            reader_connection.mark_closed();
            writer.abort();
        });

        Ok(Established {
            connection,
            inbound: inbound_rx,
        })
    }
}

/// Server URI with the identity attached as `?d=<base64url(json)>`.
pub fn handshake_url(
    server: &ServerAddress,
    identity: &ClientInfoWithoutId,
) -> Result<Url, SignalingError> {
    let mut url = Url::parse(server.as_str()).map_err(|err| SignalingError::InvalidUrl {
        url: server.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(SignalingError::InvalidUrl {
            url: server.to_string(),
            reason: format!("unsupported scheme '{}'", url.scheme()),
        });
    }
    let encoded = URL_SAFE_NO_PAD.encode(serde_json::to_vec(identity)?);
    url.query_pairs_mut().append_pair(IDENTITY_PARAM, &encoded);
    Ok(url)
}
