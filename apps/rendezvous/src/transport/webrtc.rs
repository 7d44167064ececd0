//! WebRTC-backed transport capability.
//!
//! Answers an inbound offer, waits for the remote side to open the `data`
//! channel, then runs the receive exchange on the detached channel. The
//! exchange is raced against the peer connection failing or closing.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_proto::sdp::{decode_sdp, encode_sdp};
use signal_proto::{FileStatus, ResourceDescriptor};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data::data_channel::DataChannel;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::exchange::{Frame, FrameStream, FrameWriter, ManifestSlot, ReceiveExchange, Selection};
use super::{
    AcceptRequest, IncomingResource, NegotiationController, ResourceError, TransportCapability,
    TransportError,
};
use crate::negotiation::SessionStatus;

const CHANNEL_LABEL: &str = "data";
const INCOMING_BUFFER: usize = 4;
const REPORT_BUFFER: usize = 16;
const FRAME_BUFFER: usize = 16;
/// Largest SCTP message the default settings accept.
const READ_BUFFER: usize = 65_536;

#[derive(Debug, Clone, Copy, Default)]
pub struct WebRtcTransport;

#[async_trait]
impl TransportCapability for WebRtcTransport {
    async fn accept_negotiation(
        &self,
        request: AcceptRequest,
    ) -> Result<Arc<dyn NegotiationController>, TransportError> {
        let AcceptRequest {
            stun_servers,
            pin,
            offer,
            connection,
            status,
        } = request;
        let remote_sdp =
            decode_sdp(&offer.sdp).map_err(|err| TransportError::InvalidOffer(err.to_string()))?;

        let (peer_connection, mut done_rx) = create_peer_connection(&stun_servers).await?;

        let (channel_tx, mut channel_rx) = mpsc::channel::<Arc<DataChannel>>(1);
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let channel_tx = channel_tx.clone();
            Box::pin(async move {
                if channel.label() != CHANNEL_LABEL {
                    debug!(label = channel.label(), "ignoring unexpected data channel");
                    return;
                }
                let opened = Arc::clone(&channel);
                channel.on_open(Box::new(move || {
                    Box::pin(async move {
                        match opened.detach().await {
                            Ok(raw) => {
                                let _ = channel_tx.try_send(raw);
                            }
                            Err(err) => warn!(error = %err, "detaching data channel failed"),
                        }
                    })
                }));
            })
        }));

        let (manifest_tx, manifest_rx) = watch::channel::<ManifestSlot>(None);
        let (selection_tx, selection_rx) = oneshot::channel::<Selection>();
        let (incoming_tx, incoming_rx) = mpsc::channel::<IncomingResource>(INCOMING_BUFFER);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::channel::<FileStatus>(REPORT_BUFFER);

        let exchange = ReceiveExchange {
            status: status.clone(),
            pin,
            selection: selection_rx,
            incoming: incoming_tx,
            errors: errors_tx,
            reports: reports_rx,
        };
        let exchange_status = status.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                result = async {
                    let channel = channel_rx.recv().await.ok_or(TransportError::Closed)?;
                    let frames = pump_frames(Arc::clone(&channel));
                    exchange
                        .run(&DetachedChannel(channel), frames, &manifest_tx)
                        .await
                } => result,
                _ = done_rx.recv() => Err(TransportError::Negotiation(
                    "peer connection closed before the exchange ended".into(),
                )),
            };
            if let Err(err) = outcome {
                warn!(error = %err, "data channel exchange failed");
                let _ = exchange_status.send(SessionStatus::Error(err.to_string()));
                manifest_tx.send_if_modified(|slot| {
                    if slot.is_some() {
                        return false;
                    }
                    *slot = Some(Err(err.to_string()));
                    true
                });
            }
        });

        let answered = async {
            let remote = RTCSessionDescription::offer(remote_sdp)
                .map_err(|err| TransportError::InvalidOffer(err.to_string()))?;
            peer_connection
                .set_remote_description(remote)
                .await
                .map_err(negotiation_error)?;
            let answer = peer_connection
                .create_answer(None)
                .await
                .map_err(negotiation_error)?;
            let mut gathered = peer_connection.gathering_complete_promise().await;
            peer_connection
                .set_local_description(answer)
                .await
                .map_err(negotiation_error)?;
            let _ = gathered.recv().await;

            let local = peer_connection
                .local_description()
                .await
                .ok_or_else(|| TransportError::Negotiation("no local description".into()))?;
            let encoded = encode_sdp(&local.sdp).map_err(negotiation_error)?;
            connection.send_answer(offer.session_id.clone(), offer.peer.id, encoded)?;
            Ok::<(), TransportError>(())
        }
        .await;

        if let Err(err) = answered {
            let _ = peer_connection.close().await;
            return Err(err);
        }
        debug!(session_id = %offer.session_id, peer = %offer.peer.id, "answer sent");
        let _ = status.send(SessionStatus::SdpExchanged);

        Ok(Arc::new(WebRtcController {
            peer_connection,
            manifest: manifest_rx,
            selection: Mutex::new(Some(selection_tx)),
            incoming: Mutex::new(Some(incoming_rx)),
            errors: Mutex::new(Some(errors_rx)),
            reports: reports_tx,
        }))
    }
}

async fn create_peer_connection(
    stun_servers: &[String],
) -> Result<(Arc<RTCPeerConnection>, mpsc::Receiver<()>), TransportError> {
    let mut media = MediaEngine::default();
    media.register_default_codecs().map_err(negotiation_error)?;
    let registry =
        register_default_interceptors(Registry::new(), &mut media).map_err(negotiation_error)?;
    let mut settings = SettingEngine::default();
    settings.detach_data_channels();
    let api = APIBuilder::new()
        .with_media_engine(media)
        .with_interceptor_registry(registry)
        .with_setting_engine(settings)
        .build();

    let ice_servers = if stun_servers.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls: stun_servers.to_vec(),
            ..Default::default()
        }]
    };
    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    let peer_connection = api
        .new_peer_connection(config)
        .await
        .map_err(negotiation_error)?;

    let (done_tx, done_rx) = mpsc::channel::<()>(1);
    peer_connection.on_peer_connection_state_change(Box::new(
        move |state: RTCPeerConnectionState| {
            debug!(?state, "peer connection state changed");
            if matches!(
                state,
                RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
            ) {
                let _ = done_tx.try_send(());
            }
            Box::pin(async {})
        },
    ));

    Ok((Arc::new(peer_connection), done_rx))
}

fn negotiation_error(err: impl Display) -> TransportError {
    TransportError::Negotiation(err.to_string())
}

fn channel_error(err: impl Display) -> TransportError {
    TransportError::Channel(err.to_string())
}

struct DetachedChannel(Arc<DataChannel>);

#[async_trait]
impl FrameWriter for DetachedChannel {
    async fn write(&self, data: Bytes, text: bool) -> Result<(), TransportError> {
        self.0
            .write_data_channel(&data, text)
            .await
            .map_err(channel_error)?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(err) = self.0.close().await {
            debug!(error = %err, "closing data channel failed");
        }
    }
}

/// Read frames off the detached channel until it closes. An empty text frame
/// reads as `(0, true)`; `(0, false)` is the end of the stream.
fn pump_frames(channel: Arc<DataChannel>) -> FrameStream {
    let (frame_tx, frames) = mpsc::channel(FRAME_BUFFER);
    tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_BUFFER];
        loop {
            let frame = match channel.read_data_channel(&mut buffer).await {
                Ok((0, false)) => break,
                Ok((len, text)) => {
                    let data = Bytes::copy_from_slice(&buffer[..len]);
                    Ok(if text { Frame::Text(data) } else { Frame::Binary(data) })
                }
                Err(err) => Err(channel_error(err)),
            };
            let failed = frame.is_err();
            if frame_tx.send(frame).await.is_err() || failed {
                break;
            }
        }
    });
    frames
}

struct WebRtcController {
    peer_connection: Arc<RTCPeerConnection>,
    manifest: watch::Receiver<ManifestSlot>,
    selection: Mutex<Option<oneshot::Sender<Selection>>>,
    incoming: Mutex<Option<mpsc::Receiver<IncomingResource>>>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<ResourceError>>>,
    reports: mpsc::Sender<FileStatus>,
}

#[async_trait]
impl NegotiationController for WebRtcController {
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, TransportError> {
        let mut manifest = self.manifest.clone();
        let slot = manifest
            .wait_for(Option::is_some)
            .await
            .map_err(|_| TransportError::Closed)?
            .clone();
        match slot {
            Some(Ok(files)) => Ok(files),
            Some(Err(reason)) => Err(TransportError::Channel(reason)),
            None => Err(TransportError::Closed),
        }
    }

    async fn respond(&self, selection: Option<HashSet<String>>) -> Result<(), TransportError> {
        let sender = self
            .selection
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken("response"))?;
        sender.send(selection).map_err(|_| TransportError::Closed)
    }

    async fn take_incoming(&self) -> Result<mpsc::Receiver<IncomingResource>, TransportError> {
        self.incoming
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken("incoming stream"))
    }

    async fn take_errors(&self) -> Result<mpsc::UnboundedReceiver<ResourceError>, TransportError> {
        self.errors
            .lock()
            .take()
            .ok_or(TransportError::AlreadyTaken("error stream"))
    }

    async fn report(&self, status: FileStatus) -> Result<(), TransportError> {
        self.reports
            .send(status)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        if let Err(err) = self.peer_connection.close().await {
            debug!(error = %err, "closing peer connection failed");
        }
    }
}
