//! Receiving side of the data channel exchange.
//!
//! Runs over any ordered frame stream: an optional PIN gate, the manifest,
//! the selection reply and then one header plus binary chunks per accepted
//! resource until the sender's end marker (an empty text frame).

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use signal_proto::{
    FileHeader, FileStatus, InitialMessage, InitialResponse, PinMessage, ResourceDescriptor,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use super::framing::{ControlAssembler, encode_control};
use super::{IncomingResource, PinConfig, ResourceError, StatusSink, TransportError};
use crate::negotiation::SessionStatus;

const INCOMING_BUFFER: usize = 4;
const UNKNOWN_RESOURCE: &str = "unknown";

pub(crate) type ManifestSlot = Option<Result<Vec<ResourceDescriptor>, String>>;
pub(crate) type Selection = Option<HashSet<String>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Binary(Bytes),
    Text(Bytes),
}

/// Inbound frames; the stream ends when the remote side closes the channel.
pub(crate) type FrameStream = mpsc::Receiver<Result<Frame, TransportError>>;

#[async_trait]
pub(crate) trait FrameWriter: Send + Sync {
    async fn write(&self, data: Bytes, text: bool) -> Result<(), TransportError>;
    async fn close(&self);
}

pub(crate) struct ReceiveExchange {
    pub status: StatusSink,
    pub pin: Option<PinConfig>,
    pub selection: oneshot::Receiver<Selection>,
    pub incoming: mpsc::Sender<IncomingResource>,
    pub errors: mpsc::UnboundedSender<ResourceError>,
    pub reports: mpsc::Receiver<FileStatus>,
}

struct Receiving {
    id: String,
    remaining: u64,
    data: mpsc::Sender<Bytes>,
}

impl ReceiveExchange {
    /// Run the exchange on an open channel. `Ok` covers every orderly ending
    /// (finished, declined, PIN exhausted); the matching status has been sent.
    pub async fn run(
        self,
        writer: &dyn FrameWriter,
        mut frames: FrameStream,
        manifest: &watch::Sender<ManifestSlot>,
    ) -> Result<(), TransportError> {
        let ReceiveExchange {
            status,
            pin,
            selection,
            incoming,
            errors,
            mut reports,
        } = self;
        let _ = status.send(SessionStatus::Connected);

        if let Some(pin) = pin {
            if !pin_gate(writer, &mut frames, &status, &pin).await? {
                let _ = status.send(SessionStatus::TooManyAttempts);
                writer.close().await;
                return Ok(());
            }
            let _ = status.send(SessionStatus::Connected);
        }

        let initial: InitialMessage = read_control(&mut frames).await?;
        manifest.send_replace(Some(Ok(initial.files.clone())));

        let Ok(selection) = selection.await else {
            debug!("controller dropped before a selection was made");
            return Ok(());
        };
        let Some(selected) = selection else {
            send_control(writer, &InitialResponse::default()).await?;
            let _ = status.send(SessionStatus::Declined);
            writer.close().await;
            return Ok(());
        };

        let tokens: HashMap<String, String> = initial
            .files
            .iter()
            .filter(|descriptor| selected.contains(&descriptor.id))
            .map(|descriptor| (descriptor.id.clone(), Uuid::new_v4().to_string()))
            .collect();
        send_control(
            writer,
            &InitialResponse {
                files: tokens.clone(),
            },
        )
        .await?;

        let mut current: Option<Receiving> = None;
        let mut sending = false;
        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else {
                        return Err(TransportError::Channel(
                            "channel closed before the end of the transfer".into(),
                        ));
                    };
                    match frame? {
                        Frame::Binary(data) => {
                            let Some(receiving) = current.as_mut() else {
                                refuse(&errors, UNKNOWN_RESOURCE, "received binary data without a header");
                                continue;
                            };
                            receiving.remaining = receiving.remaining.saturating_sub(data.len() as u64);
                            if receiving.data.send(data).await.is_err() {
                                debug!(resource = %receiving.id, "data stream dropped; discarding chunk");
                            }
                            if receiving.remaining == 0 {
                                current = None;
                            }
                        }
                        Frame::Text(data) if data.is_empty() => break,
                        Frame::Text(data) => {
                            current = None;
                            let header: FileHeader = serde_json::from_slice(&data).map_err(|err| {
                                TransportError::Channel(format!("decode file header: {err}"))
                            })?;
                            match tokens.get(&header.id) {
                                Some(token) if *token == header.token => {}
                                Some(_) => {
                                    refuse(&errors, &header.id, "invalid token");
                                    continue;
                                }
                                None => {
                                    refuse(&errors, &header.id, "file not found");
                                    continue;
                                }
                            }
                            let Some(descriptor) =
                                initial.files.iter().find(|d| d.id == header.id).cloned()
                            else {
                                refuse(&errors, &header.id, "file not found");
                                continue;
                            };

                            let (data_tx, data_rx) = mpsc::channel(INCOMING_BUFFER);
                            if descriptor.size > 0 {
                                current = Some(Receiving {
                                    id: descriptor.id.clone(),
                                    remaining: descriptor.size,
                                    data: data_tx,
                                });
                            }
                            if !sending {
                                sending = true;
                                let _ = status.send(SessionStatus::Sending);
                            }
                            if incoming
                                .send(IncomingResource {
                                    descriptor,
                                    data: data_rx,
                                })
                                .await
                                .is_err()
                            {
                                debug!(resource = %header.id, "incoming stream dropped; discarding resource");
                            }
                        }
                    }
                }
                Some(report) = reports.recv() => send_control(writer, &report).await?,
            }
        }

        while let Ok(report) = reports.try_recv() {
            send_control(writer, &report).await?;
        }
        let _ = status.send(SessionStatus::Finished);
        writer.close().await;
        Ok(())
    }
}

/// `Ok(true)` once the sender presented the right PIN, `Ok(false)` after
/// `max_tries` wrong ones.
async fn pin_gate(
    writer: &dyn FrameWriter,
    frames: &mut FrameStream,
    status: &StatusSink,
    pin: &PinConfig,
) -> Result<bool, TransportError> {
    for attempt in 1..=pin.max_tries {
        send_control(writer, &PinMessage::PinRequired).await?;
        let _ = status.send(SessionStatus::PinRequired);
        match read_control::<PinMessage>(frames).await? {
            PinMessage::Pin { pin: offered } if offered == pin.pin => {
                send_control(writer, &PinMessage::Accepted).await?;
                return Ok(true);
            }
            PinMessage::Pin { .. } => debug!(attempt, "wrong pin"),
            other => {
                return Err(TransportError::Channel(format!(
                    "unexpected message during pin exchange: {other:?}"
                )));
            }
        }
    }
    send_control(writer, &PinMessage::TooManyAttempts).await?;
    Ok(false)
}

fn refuse(errors: &mpsc::UnboundedSender<ResourceError>, id: &str, reason: &str) {
    warn!(resource = %id, reason, "refusing resource");
    let _ = errors.send(ResourceError {
        id: id.to_string(),
        error: reason.to_string(),
    });
}

/// Binary chunks up to the next empty text frame, decoded as one message.
pub(crate) async fn read_control<T: DeserializeOwned>(
    frames: &mut FrameStream,
) -> Result<T, TransportError> {
    let mut assembler = ControlAssembler::default();
    loop {
        match frames.recv().await.ok_or(TransportError::Closed)?? {
            Frame::Binary(data) => assembler.push(&data),
            Frame::Text(_) => return assembler.finish(),
        }
    }
}

pub(crate) async fn send_control<T: Serialize>(
    writer: &dyn FrameWriter,
    message: &T,
) -> Result<(), TransportError> {
    for frame in encode_control(message)? {
        writer.write(frame, false).await?;
    }
    writer.write(Bytes::new(), true).await
}
