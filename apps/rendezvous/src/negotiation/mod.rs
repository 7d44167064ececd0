//! Per-offer negotiation sessions.
//!
//! A session is created for every inbound `OFFER`. It asks the transport
//! capability to answer, keeps the returned controller, fetches the remote
//! manifest on a separate task and follows the transport's status updates
//! until a terminal status is reached.

pub mod spawner;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use signal_proto::{FileStatus, ResourceDescriptor, ServerSdpMessage};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::signaling::{ServerAddress, SignalingConnection};
use crate::transport::{
    AcceptRequest, IncomingResource, NegotiationController, PinConfig, ResourceError,
    TransportCapability, TransportError,
};

pub use spawner::{SessionEvent, SessionSpawner};

/// Inbound offer as relayed by the signaling server.
pub type NegotiationOffer = ServerSdpMessage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Negotiating,
    SdpExchanged,
    PinRequired,
    TooManyAttempts,
    Declined,
    Connected,
    Sending,
    Finished,
    Error(String),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Finished
                | SessionStatus::Declined
                | SessionStatus::TooManyAttempts
                | SessionStatus::Error(_)
        )
    }

    /// Progress rank. Updates that would move a session backwards are dropped.
    pub fn rank(&self) -> u8 {
        match self {
            SessionStatus::Negotiating => 0,
            SessionStatus::SdpExchanged => 1,
            SessionStatus::Connected | SessionStatus::PinRequired => 2,
            SessionStatus::Sending => 3,
            SessionStatus::Finished
            | SessionStatus::Declined
            | SessionStatus::TooManyAttempts
            | SessionStatus::Error(_) => 4,
        }
    }

    /// Whether `self` may replace `current`.
    pub fn supersedes(&self, current: &SessionStatus) -> bool {
        if current.is_terminal() {
            return false;
        }
        matches!(self, SessionStatus::Error(_)) || self.rank() >= current.rank()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Negotiating => f.write_str("negotiating"),
            SessionStatus::SdpExchanged => f.write_str("sdp_exchanged"),
            SessionStatus::PinRequired => f.write_str("pin_required"),
            SessionStatus::TooManyAttempts => f.write_str("too_many_attempts"),
            SessionStatus::Declined => f.write_str("declined"),
            SessionStatus::Connected => f.write_str("connected"),
            SessionStatus::Sending => f.write_str("sending"),
            SessionStatus::Finished => f.write_str("finished"),
            SessionStatus::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Observable part of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionState {
    pub status: Option<SessionStatus>,
    pub manifest: Option<Vec<ResourceDescriptor>>,
    pub has_controller: bool,
}

/// Identifies one session among everything the spawner tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub server: ServerAddress,
    pub seq: u64,
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.server, self.seq)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session has no controller yet")]
    NotReady,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct NegotiationSession {
    key: SessionKey,
    offer: NegotiationOffer,
    connection: Arc<SignalingConnection>,
    state: watch::Sender<SessionState>,
    controller: RwLock<Option<Arc<dyn NegotiationController>>>,
}

impl fmt::Debug for NegotiationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiationSession")
            .field("key", &self.key)
            .field("session_id", &self.offer.session_id)
            .field("peer", &self.offer.peer.id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl NegotiationSession {
    pub fn new(
        key: SessionKey,
        offer: NegotiationOffer,
        connection: Arc<SignalingConnection>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(SessionState::default());
        Arc::new(Self {
            key,
            offer,
            connection,
            state,
            controller: RwLock::new(None),
        })
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn offer(&self) -> &NegotiationOffer {
        &self.offer
    }

    pub fn connection(&self) -> &Arc<SignalingConnection> {
        &self.connection
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.state.borrow().status.clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state
            .borrow()
            .status
            .as_ref()
            .is_some_and(SessionStatus::is_terminal)
    }

    pub fn controller(&self) -> Option<Arc<dyn NegotiationController>> {
        self.controller.read().clone()
    }

    /// Resolves with the first state matching `predicate`.
    pub async fn wait_until(&self, predicate: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut state = self.state.subscribe();
        match state.wait_for(predicate).await {
            Ok(current) => current.clone(),
            Err(_) => self.state(),
        }
    }

    /// Accept the listed resources with these ids.
    pub async fn accept(&self, selection: HashSet<String>) -> Result<(), SessionError> {
        let controller = self.controller().ok_or(SessionError::NotReady)?;
        controller.respond(Some(selection)).await?;
        Ok(())
    }

    pub async fn decline(&self) -> Result<(), SessionError> {
        let controller = self.controller().ok_or(SessionError::NotReady)?;
        controller.respond(None).await?;
        Ok(())
    }

    pub async fn incoming(&self) -> Result<mpsc::Receiver<IncomingResource>, SessionError> {
        let controller = self.controller().ok_or(SessionError::NotReady)?;
        Ok(controller.take_incoming().await?)
    }

    pub async fn errors(&self) -> Result<mpsc::UnboundedReceiver<ResourceError>, SessionError> {
        let controller = self.controller().ok_or(SessionError::NotReady)?;
        Ok(controller.take_errors().await?)
    }

    /// Report the outcome of storing one received resource back to the sender.
    pub async fn report(&self, status: FileStatus) -> Result<(), SessionError> {
        let controller = self.controller().ok_or(SessionError::NotReady)?;
        controller.report(status).await?;
        Ok(())
    }

    /// Store `next` unless it would regress the session. Returns whether it
    /// was stored.
    pub(crate) fn apply_status(&self, next: SessionStatus) -> bool {
        let stored = self.state.send_if_modified(|state| match &state.status {
            Some(current) if *current == next || !next.supersedes(current) => false,
            _ => {
                state.status = Some(next.clone());
                true
            }
        });
        if stored {
            debug!(session = %self.key, status = %next, "session status");
        }
        stored
    }

    /// Store `next` only if it ranks above the current status. Used for
    /// progress the session infers itself, so a same-rank transport status
    /// such as `PinRequired` is kept.
    fn raise_to(&self, next: SessionStatus) -> bool {
        let raised = self.state.send_if_modified(|state| match &state.status {
            Some(current) if current.rank() >= next.rank() => false,
            _ => {
                state.status = Some(next.clone());
                true
            }
        });
        if raised {
            debug!(session = %self.key, status = %next, "session status");
        }
        raised
    }

    /// Drive the session: answer the offer, then follow status updates until
    /// the session is terminal. Once a controller exists this only returns
    /// after a terminal status, and the controller is closed on the way out.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn TransportCapability>,
        stun_servers: Vec<String>,
        pin: Option<PinConfig>,
    ) {
        self.apply_status(SessionStatus::Negotiating);

        let (status_tx, mut status_rx) = mpsc::unbounded_channel();
        let listing_status = status_tx.clone();
        let request = AcceptRequest {
            stun_servers,
            pin,
            offer: self.offer.clone(),
            connection: Arc::clone(&self.connection),
            status: status_tx,
        };

        let accepting = transport.accept_negotiation(request);
        tokio::pin!(accepting);
        let accepted = loop {
            tokio::select! {
                result = &mut accepting => break result,
                Some(status) = status_rx.recv() => {
                    self.apply_status(status);
                }
            }
        };

        let controller = match accepted {
            Ok(controller) => controller,
            Err(err) => {
                warn!(session = %self.key, error = %err, "negotiation failed");
                self.apply_status(SessionStatus::Error(err.to_string()));
                return;
            }
        };
        *self.controller.write() = Some(Arc::clone(&controller));
        self.state.send_modify(|state| state.has_controller = true);
        self.raise_to(SessionStatus::Connected);
        info!(
            session = %self.key,
            peer = %self.offer.peer.alias,
            session_id = %self.offer.session_id,
            "negotiation accepted"
        );

        let listing = Arc::clone(&self);
        let lister = Arc::clone(&controller);
        tokio::spawn(async move {
            match lister.list_resources().await {
                Ok(files) => {
                    debug!(session = %listing.key, files = files.len(), "manifest received");
                    listing
                        .state
                        .send_modify(|state| state.manifest = Some(files));
                }
                Err(err) => {
                    // Queued behind whatever the transport reported before giving up.
                    warn!(session = %listing.key, error = %err, "listing resources failed");
                    let _ = listing_status.send(SessionStatus::Error(err.to_string()));
                }
            }
        });

        let mut reporting = true;
        let mut watcher = self.state.subscribe();
        while !self.is_terminal() {
            tokio::select! {
                status = status_rx.recv(), if reporting => match status {
                    Some(status) => {
                        self.apply_status(status);
                    }
                    None => {
                        debug!(session = %self.key, "transport stopped reporting status");
                        reporting = false;
                    }
                },
                changed = watcher.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        controller.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;
    use signal_proto::ClientInfo;
    use uuid::Uuid;

    fn offer(session_id: &str) -> NegotiationOffer {
        ServerSdpMessage {
            peer: ClientInfo {
                id: Uuid::from_u128(7),
                alias: "sender".into(),
                version: "2.1".into(),
                device_model: None,
                device_type: None,
                fingerprint: "fp".into(),
            },
            session_id: session_id.into(),
            sdp: "sdp".into(),
        }
    }

    fn session(session_id: &str) -> Arc<NegotiationSession> {
        let (connection, _outbound) = SignalingConnection::detached("wss://s1".into());
        NegotiationSession::new(
            SessionKey {
                server: "wss://s1".into(),
                seq: 0,
            },
            offer(session_id),
            connection,
        )
    }

    #[test]
    fn terminal_statuses_are_sticky() {
        let session = session("s");
        assert!(session.apply_status(SessionStatus::Connected));
        assert!(session.apply_status(SessionStatus::Finished));
        assert!(!session.apply_status(SessionStatus::Sending));
        assert!(!session.apply_status(SessionStatus::Error("late".into())));
        assert_eq!(session.status(), Some(SessionStatus::Finished));
    }

    #[test]
    fn regressions_are_dropped_but_errors_always_land() {
        let session = session("s");
        session.apply_status(SessionStatus::Sending);
        assert!(!session.apply_status(SessionStatus::SdpExchanged));
        assert!(!session.apply_status(SessionStatus::Connected));
        assert_eq!(session.status(), Some(SessionStatus::Sending));

        let other = self::session("t");
        other.apply_status(SessionStatus::Connected);
        assert!(other.apply_status(SessionStatus::PinRequired));
        assert!(other.apply_status(SessionStatus::Error("boom".into())));
    }

    #[test_timeout::tokio_timeout_test]
    async fn accept_failure_is_terminal_and_never_lists() {
        let transport = Arc::new(MockTransport::rejecting("no route"));
        let session = session("s");
        Arc::clone(&session).run(transport.clone(), Vec::new(), None).await;

        assert_eq!(
            session.status(),
            Some(SessionStatus::Error("negotiation failed: no route".into()))
        );
        assert!(!session.state().has_controller);
        assert_eq!(transport.listing_calls(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn accepted_session_lists_exactly_once() {
        let manifest = vec![ResourceDescriptor::new("f1", "a.txt", 3, "text/plain")];
        let transport = Arc::new(MockTransport::accepting(manifest.clone()).releasing_sinks());
        let session = session("s");
        tokio::spawn(
            Arc::clone(&session).run(transport.clone(), vec!["stun:example.org:3478".into()], None),
        );

        let state = session.wait_until(|state| state.manifest.is_some()).await;
        assert_eq!(state.status, Some(SessionStatus::Connected));
        assert!(state.has_controller);
        assert_eq!(state.manifest, Some(manifest));
        assert_eq!(transport.listing_calls(), 1);
        assert_eq!(
            transport
                .offers()
                .iter()
                .map(|offer| offer.session_id.as_str())
                .collect::<Vec<_>>(),
            vec!["s"]
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn terminal_status_during_accept_still_lists() {
        let manifest = vec![ResourceDescriptor::new("f1", "a.txt", 3, "text/plain")];
        let transport = Arc::new(
            MockTransport::accepting(manifest.clone()).emitting(vec![SessionStatus::Declined]),
        );
        let session = session("s");
        Arc::clone(&session).run(transport.clone(), Vec::new(), None).await;

        let state = session.wait_until(|state| state.manifest.is_some()).await;
        assert_eq!(state.status, Some(SessionStatus::Declined));
        assert!(state.has_controller);
        assert_eq!(state.manifest, Some(manifest));
        assert_eq!(transport.listing_calls(), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn run_outlives_a_silent_transport_until_terminal() {
        let transport =
            Arc::new(MockTransport::failing_listing("truncated manifest").releasing_sinks());
        let session = session("s");
        Arc::clone(&session).run(transport, Vec::new(), None).await;

        let state = session.state();
        assert!(state.has_controller);
        assert_eq!(
            state.status,
            Some(SessionStatus::Error(
                "data channel error: truncated manifest".into()
            ))
        );
    }

    #[test_timeout::tokio_timeout_test]
    async fn pin_required_survives_acceptance() {
        let transport = Arc::new(
            MockTransport::accepting(Vec::new()).emitting(vec![SessionStatus::PinRequired]),
        );
        let session = session("s");
        let driver = tokio::spawn(Arc::clone(&session).run(transport.clone(), Vec::new(), None));

        let state = session
            .wait_until(|state| {
                state.manifest.is_some() && state.status == Some(SessionStatus::PinRequired)
            })
            .await;
        assert!(state.has_controller);

        assert!(transport.push_status(0, SessionStatus::Connected));
        session
            .wait_until(|state| state.status == Some(SessionStatus::Connected))
            .await;
        assert!(transport.push_status(0, SessionStatus::Sending));
        assert!(transport.push_status(0, SessionStatus::Finished));
        driver.await.unwrap();
        assert_eq!(session.status(), Some(SessionStatus::Finished));
    }

    #[test_timeout::tokio_timeout_test]
    async fn gated_offer_waits_for_the_pin() {
        let pin = PinConfig {
            pin: "0000".into(),
            max_tries: 1,
        };
        let transport = Arc::new(MockTransport::accepting(Vec::new()));
        let session = session("s");
        tokio::spawn(Arc::clone(&session).run(transport.clone(), Vec::new(), Some(pin.clone())));

        let state = session
            .wait_until(|state| {
                state.manifest.is_some() && state.status == Some(SessionStatus::PinRequired)
            })
            .await;
        assert!(state.has_controller);
        assert_eq!(transport.pins(), vec![Some(pin)]);

        assert!(transport.push_status(0, SessionStatus::TooManyAttempts));
        let state = session
            .wait_until(|state| state.status.as_ref().is_some_and(SessionStatus::is_terminal))
            .await;
        assert_eq!(state.status, Some(SessionStatus::TooManyAttempts));
    }

    #[test_timeout::tokio_timeout_test]
    async fn listing_failure_only_fails_this_session() {
        let transport = Arc::new(MockTransport::failing_listing("garbled manifest"));
        let failing = session("a");
        tokio::spawn(Arc::clone(&failing).run(transport.clone(), Vec::new(), None));

        let state = failing
            .wait_until(|state| state.status.as_ref().is_some_and(SessionStatus::is_terminal))
            .await;
        assert!(matches!(state.status, Some(SessionStatus::Error(_))));
        assert!(state.manifest.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn early_statuses_do_not_regress_connected() {
        let transport = Arc::new(
            MockTransport::accepting(Vec::new())
                .emitting(vec![SessionStatus::SdpExchanged])
                .releasing_sinks(),
        );
        let session = session("s");
        tokio::spawn(Arc::clone(&session).run(transport, Vec::new(), None));
        let state = session.wait_until(|state| state.manifest.is_some()).await;
        assert_eq!(state.status, Some(SessionStatus::Connected));
    }

    #[test_timeout::tokio_timeout_test]
    async fn selection_reaches_the_controller() {
        let manifest = vec![
            ResourceDescriptor::new("f1", "a.txt", 3, "text/plain"),
            ResourceDescriptor::new("f2", "b.txt", 4, "text/plain"),
        ];
        let transport = Arc::new(MockTransport::accepting(manifest));
        let session = session("s");
        assert!(matches!(
            session.accept(HashSet::new()).await,
            Err(SessionError::NotReady)
        ));

        let driver = tokio::spawn(Arc::clone(&session).run(transport.clone(), Vec::new(), None));
        session.wait_until(|state| state.has_controller).await;
        let selection = HashSet::from(["f2".to_string(), "ghost".to_string()]);
        session.accept(selection.clone()).await.unwrap();
        assert_eq!(transport.selections(), vec![Some(selection)]);

        let mut incoming = session.incoming().await.unwrap();
        let mut resource = incoming.recv().await.unwrap();
        assert_eq!(resource.descriptor.id, "f2");
        assert_eq!(resource.data.recv().await.unwrap().as_ref(), b"f2");
        assert!(incoming.recv().await.is_none());

        let mut errors = session.errors().await.unwrap();
        assert_eq!(
            errors.recv().await,
            Some(ResourceError {
                id: "ghost".into(),
                error: "file not found".into(),
            })
        );
        let stored = FileStatus {
            id: "f2".into(),
            success: true,
            error: None,
        };
        session.report(stored.clone()).await.unwrap();
        assert_eq!(transport.reports(), vec![stored]);

        driver.await.unwrap();
        assert_eq!(session.status(), Some(SessionStatus::Finished));
        assert!(matches!(
            session.decline().await,
            Err(SessionError::Transport(TransportError::AlreadyTaken(_)))
        ));
    }
}
