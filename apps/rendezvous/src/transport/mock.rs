//! Scripted in-process transport for tests and dry runs.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use signal_proto::{FileStatus, ResourceDescriptor};
use tokio::sync::mpsc;

use super::{
    AcceptRequest, IncomingResource, NegotiationController, PinConfig, ResourceError, StatusSink,
    TransportCapability, TransportError,
};
use crate::negotiation::{NegotiationOffer, SessionStatus};

#[derive(Debug, Clone)]
enum Script {
    Accept {
        manifest: Result<Vec<ResourceDescriptor>, String>,
    },
    Reject(String),
}

/// Answers every offer according to a fixed script and records what it saw.
#[derive(Debug)]
pub struct MockTransport {
    script: Script,
    answer_sdp: Option<String>,
    early_statuses: Vec<SessionStatus>,
    hold_sinks: bool,
    offers: Mutex<Vec<NegotiationOffer>>,
    pins: Mutex<Vec<Option<PinConfig>>>,
    sinks: Mutex<Vec<StatusSink>>,
    selections: Arc<Mutex<Vec<Option<HashSet<String>>>>>,
    reports: Arc<Mutex<Vec<FileStatus>>>,
    listings: Arc<AtomicUsize>,
}

impl MockTransport {
    fn with_script(script: Script) -> Self {
        Self {
            script,
            answer_sdp: None,
            early_statuses: Vec::new(),
            hold_sinks: true,
            offers: Mutex::new(Vec::new()),
            pins: Mutex::new(Vec::new()),
            sinks: Mutex::new(Vec::new()),
            selections: Arc::new(Mutex::new(Vec::new())),
            reports: Arc::new(Mutex::new(Vec::new())),
            listings: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accepts every offer; listing returns `manifest`.
    pub fn accepting(manifest: Vec<ResourceDescriptor>) -> Self {
        Self::with_script(Script::Accept {
            manifest: Ok(manifest),
        })
    }

    /// Accepts every offer but fails the listing step.
    pub fn failing_listing(reason: impl Into<String>) -> Self {
        Self::with_script(Script::Accept {
            manifest: Err(reason.into()),
        })
    }

    /// Fails every offer during acceptance.
    pub fn rejecting(reason: impl Into<String>) -> Self {
        Self::with_script(Script::Reject(reason.into()))
    }

    /// Send this SDP back through the signaling connection as the answer.
    pub fn answering(mut self, sdp: impl Into<String>) -> Self {
        self.answer_sdp = Some(sdp.into());
        self
    }

    /// Statuses emitted while acceptance is still in progress.
    pub fn emitting(mut self, statuses: Vec<SessionStatus>) -> Self {
        self.early_statuses = statuses;
        self
    }

    /// Drop each status sink as soon as acceptance finishes.
    pub fn releasing_sinks(mut self) -> Self {
        self.hold_sinks = false;
        self
    }

    pub fn accept_calls(&self) -> usize {
        self.offers.lock().len()
    }

    pub fn listing_calls(&self) -> usize {
        self.listings.load(Ordering::SeqCst)
    }

    pub fn offers(&self) -> Vec<NegotiationOffer> {
        self.offers.lock().clone()
    }

    pub fn selections(&self) -> Vec<Option<HashSet<String>>> {
        self.selections.lock().clone()
    }

    /// PIN gate requested for each offer, in arrival order.
    pub fn pins(&self) -> Vec<Option<PinConfig>> {
        self.pins.lock().clone()
    }

    pub fn reports(&self) -> Vec<FileStatus> {
        self.reports.lock().clone()
    }

    /// Push a status into the sink handed out for the `index`-th offer.
    pub fn push_status(&self, index: usize, status: SessionStatus) -> bool {
        self.sinks
            .lock()
            .get(index)
            .is_some_and(|sink| sink.send(status).is_ok())
    }

    pub fn drop_sinks(&self) {
        self.sinks.lock().clear();
    }
}

#[async_trait]
impl TransportCapability for MockTransport {
    async fn accept_negotiation(
        &self,
        request: AcceptRequest,
    ) -> Result<Arc<dyn NegotiationController>, TransportError> {
        let AcceptRequest {
            offer,
            connection,
            status,
            pin,
            ..
        } = request;
        self.offers.lock().push(offer.clone());
        let gated = pin.is_some();
        self.pins.lock().push(pin);

        for early in &self.early_statuses {
            let _ = status.send(early.clone());
        }
        tokio::task::yield_now().await;

        let manifest = match &self.script {
            Script::Reject(reason) => return Err(TransportError::Negotiation(reason.clone())),
            Script::Accept { manifest } => manifest.clone(),
        };
        if let Some(sdp) = &self.answer_sdp {
            connection.send_answer(offer.session_id.clone(), offer.peer.id, sdp.clone())?;
        }
        if gated {
            let _ = status.send(SessionStatus::PinRequired);
        }

        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let controller = MockController {
            manifest,
            status: Mutex::new(Some(status.clone())),
            listings: Arc::clone(&self.listings),
            selections: Arc::clone(&self.selections),
            reports: Arc::clone(&self.reports),
            responded: Mutex::new(false),
            incoming: Mutex::new(None),
            errors_tx,
            errors: Mutex::new(Some(errors_rx)),
        };
        if self.hold_sinks {
            self.sinks.lock().push(status);
        } else {
            *controller.status.lock() = None;
        }
        Ok(Arc::new(controller))
    }
}

#[derive(Debug)]
struct MockController {
    manifest: Result<Vec<ResourceDescriptor>, String>,
    status: Mutex<Option<StatusSink>>,
    listings: Arc<AtomicUsize>,
    selections: Arc<Mutex<Vec<Option<HashSet<String>>>>>,
    reports: Arc<Mutex<Vec<FileStatus>>>,
    responded: Mutex<bool>,
    incoming: Mutex<Option<mpsc::Receiver<IncomingResource>>>,
    errors_tx: mpsc::UnboundedSender<ResourceError>,
    errors: Mutex<Option<mpsc::UnboundedReceiver<ResourceError>>>,
}

impl MockController {
    fn emit(&self, status: SessionStatus) {
        if let Some(sink) = self.status.lock().as_ref() {
            let _ = sink.send(status);
        }
    }
}

#[async_trait]
impl NegotiationController for MockController {
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, TransportError> {
        self.listings.fetch_add(1, Ordering::SeqCst);
        self.manifest.clone().map_err(TransportError::Channel)
    }

    async fn respond(&self, selection: Option<HashSet<String>>) -> Result<(), TransportError> {
        {
            let mut responded = self.responded.lock();
            if *responded {
                return Err(TransportError::AlreadyTaken("response"));
            }
            *responded = true;
        }
        self.selections.lock().push(selection.clone());

        let Some(selected) = selection else {
            self.emit(SessionStatus::Declined);
            return Ok(());
        };
        let offered = self.manifest.clone().unwrap_or_default();
        for id in &selected {
            if !offered.iter().any(|descriptor| &descriptor.id == id) {
                let _ = self.errors_tx.send(ResourceError {
                    id: id.clone(),
                    error: "file not found".into(),
                });
            }
        }
        let accepted: Vec<_> = offered
            .into_iter()
            .filter(|descriptor| selected.contains(&descriptor.id))
            .collect();
        let (tx, rx) = mpsc::channel(accepted.len().max(1));
        for descriptor in accepted {
            let (data_tx, data_rx) = mpsc::channel(1);
            let _ = data_tx.try_send(Bytes::from(descriptor.id.clone().into_bytes()));
            let _ = tx.try_send(IncomingResource {
                descriptor,
                data: data_rx,
            });
        }
        *self.incoming.lock() = Some(rx);
        self.emit(SessionStatus::Finished);
        Ok(())
    }

    async fn take_incoming(&self) -> Result<mpsc::Receiver<IncomingResource>, TransportError> {
        if !*self.responded.lock() {
            return Err(TransportError::Channel("no selection sent yet".into()));
        }
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
        self.reports.lock().push(status);
        Ok(())
    }

    async fn close(&self) {
        self.status.lock().take();
    }
}
