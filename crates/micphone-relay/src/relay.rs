//! Relay orchestration.

use std::sync::Arc;

use micphone_audio::MixingGroup;
use micphone_discovery::{DiscoveryBackend, DiscoveryListener, ListenerEvent};
use micphone_rendezvous::{BridgeHandler, RendezvousServer, ServerEvent};
use micphone_types::{DiscoveryState, FailureKind, ServiceRecord};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::connectivity::Connectivity;
use crate::error::RelayError;

/// Requests fed into a running relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEvent {
    Shutdown,
    /// Stop and start discovery, forgetting any resolved peer.
    RestartDiscovery,
}

/// Lifecycle of a [`Relay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelayState {
    #[default]
    Idle,
    Running,
    ShuttingDown,
    Stopped,
}

/// Snapshot published on every change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStatus {
    /// Lifecycle of the relay itself.
    pub state: RelayState,
    /// Rendezvous port; `None` until bound.
    pub port: Option<u16>,
    /// Whether the rendezvous socket is still accepting.
    pub serving: bool,
    /// State of the discovery listener; `Idle` when discovery is disabled.
    pub discovery: DiscoveryState,
    /// The peer relay, once resolved. Cleared on restart or when it is lost.
    pub resolved: Option<ServiceRecord>,
    /// Connections currently joined to the mix.
    pub active_sessions: usize,
    /// Most recent classified failure, kept until replaced.
    pub last_failure: Option<FailureKind>,
}

/// One relay session: rendezvous socket, discovery, and audio bridges.
pub struct Relay<B: DiscoveryBackend> {
    config: Config,
    backend: Option<B>,
    group: Arc<dyn MixingGroup>,
    connectivity: Box<dyn Connectivity>,
    event_tx: mpsc::Sender<RelayEvent>,
    event_rx: mpsc::Receiver<RelayEvent>,
    status_tx: watch::Sender<RelayStatus>,
}

impl<B: DiscoveryBackend> Relay<B> {
    pub fn new(
        config: Config,
        backend: B,
        group: Arc<dyn MixingGroup>,
        connectivity: impl Connectivity + 'static,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (status_tx, _) = watch::channel(RelayStatus::default());
        Self {
            config,
            backend: Some(backend),
            group,
            connectivity: Box::new(connectivity),
            event_tx,
            event_rx,
            status_tx,
        }
    }

    /// Get a clone of the event sender for feeding events into the relay.
    pub fn event_sender(&self) -> mpsc::Sender<RelayEvent> {
        self.event_tx.clone()
    }

    pub fn status_receiver(&self) -> watch::Receiver<RelayStatus> {
        self.status_tx.subscribe()
    }

    /// Run until [`RelayEvent::Shutdown`] or every event sender is dropped.
    ///
    /// A relay runs once; its discovery backend is consumed.
    pub async fn run(&mut self) -> Result<(), RelayError> {
        if !self.connectivity.is_available() {
            error!("no local network connectivity, relay not started");
            return Err(RelayError::NoConnectivity);
        }
        let backend = self.backend.take().ok_or(RelayError::AlreadyRunning)?;
        let rendezvous = self.config.rendezvous_config()?;

        let handler = Arc::new(BridgeHandler::new(Arc::clone(&self.group)));
        let (server, mut server_rx) = RendezvousServer::start(rendezvous, handler.clone())?;
        let server = Arc::new(server);
        self.update(|s| {
            s.state = RelayState::Running;
            s.serving = true;
        });

        let mut discovery = if self.config.discovery.enabled {
            let (mut listener, rx) = DiscoveryListener::new(backend, self.config.discovery_target());
            listener.start().await;
            self.update(|s| s.discovery = listener.state());
            Some((listener, rx))
        } else {
            info!("discovery disabled");
            None
        };

        info!("relay running");
        let mut server_open = true;

        loop {
            tokio::select! {
                event = server_rx.recv(), if server_open => match event {
                    Some(event) => self.on_server_event(event, &handler),
                    None => {
                        debug!("rendezvous event channel closed");
                        server_open = false;
                        self.update(|s| s.serving = false);
                    }
                },
                Some(event) = next_listener_event(&mut discovery) => {
                    let state = discovery
                        .as_ref()
                        .map_or(DiscoveryState::Idle, |(listener, _)| listener.state());
                    self.on_listener_event(event, state);
                }
                event = self.event_rx.recv() => match event {
                    Some(RelayEvent::RestartDiscovery) => {
                        if let Some((listener, _)) = discovery.as_mut() {
                            info!("restarting discovery");
                            listener.stop().await;
                            listener.start().await;
                            let state = listener.state();
                            self.update(|s| {
                                s.resolved = None;
                                s.discovery = state;
                            });
                        } else {
                            debug!("discovery disabled, nothing to restart");
                        }
                    }
                    Some(RelayEvent::Shutdown) | None => {
                        info!("shutting down");
                        break;
                    }
                },
            }
        }

        self.shutdown(discovery, server, &handler).await;
        Ok(())
    }

    fn on_server_event(&self, event: ServerEvent, handler: &BridgeHandler) {
        match event {
            ServerEvent::Listening(port) => {
                info!(port, "rendezvous port ready");
                self.update(|s| s.port = Some(port));
            }
            ServerEvent::SessionStarted {
                session_id, remote, ..
            } => {
                info!(session = %session_id, remote = %remote, "session started");
                let active = handler.active_sessions();
                self.update(|s| s.active_sessions = active);
            }
            ServerEvent::SessionEnded {
                session_id, remote, ..
            } => {
                info!(session = %session_id, remote = %remote, "session ended");
                let active = handler.active_sessions();
                self.update(|s| s.active_sessions = active);
            }
            ServerEvent::BridgeFailed { error, .. } => {
                self.update(|s| s.last_failure = error.kind());
            }
            ServerEvent::Faulted(e) => {
                warn!(error = %e, "rendezvous socket no longer accepting");
                self.update(|s| {
                    s.serving = false;
                    s.last_failure = e.kind();
                });
            }
            ServerEvent::Stopped => {
                self.update(|s| s.serving = false);
            }
        }
    }

    fn on_listener_event(&self, event: ListenerEvent, state: DiscoveryState) {
        match event {
            ListenerEvent::Started | ListenerEvent::Stopped => {
                self.update(|s| s.discovery = state);
            }
            ListenerEvent::Resolved(record) => {
                info!(
                    service = %record.name,
                    host = ?record.host,
                    port = ?record.port,
                    "peer relay resolved"
                );
                self.update(|s| {
                    s.resolved = Some(record);
                    s.discovery = state;
                });
            }
            ListenerEvent::Lost(record) => {
                info!(service = %record.name, "peer relay lost");
                self.update(|s| {
                    if s.resolved.as_ref().is_some_and(|r| r.same_identity(&record)) {
                        s.resolved = None;
                    }
                });
            }
            ListenerEvent::Failed(e) => {
                warn!(error = %e, "discovery failure");
                self.update(|s| {
                    s.last_failure = e.kind();
                    s.discovery = state;
                });
            }
        }
    }

    /// Stop discovery, close the rendezvous socket, then leave the mix.
    async fn shutdown(
        &mut self,
        discovery: Option<(DiscoveryListener<B>, mpsc::Receiver<ListenerEvent>)>,
        server: Arc<RendezvousServer>,
        handler: &BridgeHandler,
    ) {
        self.update(|s| s.state = RelayState::ShuttingDown);

        if let Some((mut listener, _rx)) = discovery {
            listener.stop().await;
            let state = listener.state();
            self.update(|s| s.discovery = state);
        }

        // Joins the accept thread, which may be finishing a join.
        let tearing = Arc::clone(&server);
        if let Err(e) = tokio::task::spawn_blocking(move || tearing.tear_down()).await {
            warn!(error = %e, "rendezvous teardown task failed");
        }

        let detached = handler.detach_all();
        debug!(detached, "audio bridges detached");

        self.update(|s| {
            s.state = RelayState::Stopped;
            s.serving = false;
            s.active_sessions = 0;
        });
        info!("relay stopped");
    }

    fn update(&self, f: impl FnOnce(&mut RelayStatus)) {
        self.status_tx.send_modify(f);
    }
}

async fn next_listener_event<B: DiscoveryBackend>(
    discovery: &mut Option<(DiscoveryListener<B>, mpsc::Receiver<ListenerEvent>)>,
) -> Option<ListenerEvent> {
    match discovery {
        Some((_, rx)) => rx.recv().await,
        None => std::future::pending().await,
    }
}
