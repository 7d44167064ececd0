use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use rendezvous_core::config::{AppConfig, DEFAULT_PIN_MAX_TRIES};
use rendezvous_core::identity::StaticIdentity;
use rendezvous_core::negotiation::{NegotiationSession, SessionEvent, SessionStatus};
use rendezvous_core::peers::{InMemoryPeerRegistry, PeerEvent};
use rendezvous_core::registry::{Collaborators, RegistryEvent, SignalingRegistry};
use rendezvous_core::signaling::{ServerAddress, WebSocketConnector};
use rendezvous_core::telemetry::init_tracing;
use rendezvous_core::transport::{PinConfig, TransportCapability};
use signal_proto::FileStatus;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "rendezvous",
    about = "Discover peers through signaling servers and answer transfer offers"
)]
struct Cli {
    /// TOML config file (defaults to the platform config dir).
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
    /// Signaling server URI; repeat for several. Replaces the configured list.
    #[arg(long = "server", value_name = "URI")]
    servers: Vec<String>,
    /// STUN server URI; repeat for several. Replaces the configured list.
    #[arg(long = "stun", value_name = "URI")]
    stun: Vec<String>,
    #[arg(long, env = "RENDEZVOUS_ALIAS")]
    alias: Option<String>,
    /// Require senders to enter this PIN first.
    #[arg(long, value_name = "PIN")]
    pin: Option<String>,
    /// Accept every offered resource instead of declining.
    #[arg(long)]
    accept: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let mut cfg = AppConfig::load(cli.config.as_deref())?;
    if !cli.servers.is_empty() {
        cfg.signaling_servers = cli.servers.into_iter().map(ServerAddress::from).collect();
    }
    if !cli.stun.is_empty() {
        cfg.stun_servers = cli.stun;
    }
    if let Some(alias) = cli.alias {
        cfg.alias = alias;
    }
    if let Some(pin) = cli.pin {
        let max_tries = cfg.pin.as_ref().map_or(DEFAULT_PIN_MAX_TRIES, |current| current.max_tries);
        cfg.pin = Some(PinConfig { pin, max_tries });
    }
    init_tracing(&cfg.log_filter);

    info!(
        servers = ?cfg.signaling_servers,
        stun = ?cfg.stun_servers,
        alias = %cfg.alias,
        device_class = ?cfg.device_class,
        reconnect = ?cfg.reconnect,
        pin = cfg.pin.is_some(),
        accept = cli.accept,
        "starting rendezvous"
    );

    let peers = Arc::new(InMemoryPeerRegistry::new());
    let registry = Arc::new(SignalingRegistry::new(
        cfg.registry_config(),
        Collaborators {
            connector: Arc::new(WebSocketConnector),
            identity: Arc::new(StaticIdentity::new(cfg.identity())),
            peers: peers.clone(),
            transport: build_transport(),
        },
    ));

    tokio::spawn(log_registry_events(registry.subscribe()));
    tokio::spawn(log_peer_events(peers.subscribe()));
    tokio::spawn(follow_sessions(registry.spawner().subscribe(), cli.accept));

    let activities = registry.start_all();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("shutting down");
        }
        _ = futures_util::future::join_all(activities) => {
            info!("all signaling activities ended");
        }
    }
    Ok(())
}

#[cfg(feature = "webrtc")]
fn build_transport() -> Arc<dyn TransportCapability> {
    Arc::new(rendezvous_core::transport::WebRtcTransport)
}

#[cfg(not(feature = "webrtc"))]
fn build_transport() -> Arc<dyn TransportCapability> {
    Arc::new(rendezvous_core::transport::MockTransport::rejecting(
        "built without webrtc support",
    ))
}

async fn log_registry_events(mut events: broadcast::Receiver<RegistryEvent>) {
    loop {
        match events.recv().await {
            Ok(RegistryEvent::Connected { server }) => info!(server = %server, "online"),
            Ok(RegistryEvent::Disconnected { server }) => info!(server = %server, "offline"),
            Ok(event) => debug!(?event, "registry event"),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "registry events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn log_peer_events(mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        match events.recv().await {
            Ok(PeerEvent::Registered(peer)) => info!(
                server = %peer.server,
                id = %peer.id,
                alias = %peer.alias,
                device = ?peer.device_class,
                "peer available"
            ),
            Ok(PeerEvent::Retracted { server, peer_id }) => {
                info!(server = %server, id = %peer_id, "peer gone")
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "peer events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn follow_sessions(mut events: broadcast::Receiver<SessionEvent>, accept: bool) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::Spawned { session, .. }) => {
                tokio::spawn(handle_offer(session, accept));
            }
            Ok(SessionEvent::Completed { key, status }) => {
                info!(session = %key, %status, "session completed")
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "session events lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}

async fn handle_offer(session: Arc<NegotiationSession>, accept: bool) {
    let key = session.key().clone();
    let state = session
        .wait_until(|state| {
            state.manifest.is_some() || state.status.as_ref().is_some_and(SessionStatus::is_terminal)
        })
        .await;
    let Some(manifest) = state.manifest else {
        return;
    };
    for resource in &manifest {
        info!(
            session = %key,
            from = %session.offer().peer.alias,
            name = %resource.file_name,
            size = resource.size,
            "resource offered"
        );
    }

    if !accept {
        if let Err(err) = session.decline().await {
            warn!(session = %key, error = %err, "decline failed");
        }
        return;
    }

    let selection: HashSet<String> = manifest.iter().map(|r| r.id.clone()).collect();
    let mut incoming = match session.accept(selection).await {
        Ok(()) => match session.incoming().await {
            Ok(incoming) => incoming,
            Err(err) => {
                warn!(session = %key, error = %err, "no incoming stream");
                return;
            }
        },
        Err(err) => {
            warn!(session = %key, error = %err, "accept failed");
            return;
        }
    };
    if let Ok(mut errors) = session.errors().await {
        let key = key.clone();
        tokio::spawn(async move {
            while let Some(failure) = errors.recv().await {
                warn!(session = %key, resource = %failure.id, error = %failure.error, "resource refused");
            }
        });
    }
    while let Some(mut resource) = incoming.recv().await {
        let mut received = 0u64;
        while let Some(chunk) = resource.data.recv().await {
            received += chunk.len() as u64;
        }
        let expected = resource.descriptor.size;
        info!(
            session = %key,
            name = %resource.descriptor.file_name,
            received,
            expected,
            "resource received"
        );
        let status = FileStatus {
            id: resource.descriptor.id.clone(),
            success: received == expected,
            error: (received != expected)
                .then(|| format!("received {received} of {expected} bytes")),
        };
        if let Err(err) = session.report(status).await {
            debug!(session = %key, error = %err, "file status not delivered");
        }
    }
}
