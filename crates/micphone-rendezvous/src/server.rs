//! The rendezvous listening socket and its accept thread.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use micphone_audio::StreamId;
use micphone_types::{FailureKind, SessionId};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::connection::{AcceptedConnection, ConnectionHandler};
use crate::error::RendezvousError;
use crate::port::PortCell;

const ACCEPT_THREAD_NAME: &str = "rendezvous-accept";

/// Where the rendezvous socket listens. The port is always chosen by the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendezvousConfig {
    /// Local address to bind; unspecified accepts on every interface.
    pub bind: IpAddr,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

/// Notifications from the accept thread.
#[derive(Debug)]
pub enum ServerEvent {
    /// The socket is bound; the port will not change.
    Listening(u16),
    /// An accepted connection joined the mixing group.
    SessionStarted {
        session_id: SessionId,
        remote: SocketAddr,
        /// The stream the connection was joined as.
        stream: StreamId,
    },
    /// A session's stream ended on its own, usually because the peer hung up.
    SessionEnded {
        session_id: SessionId,
        remote: SocketAddr,
        stream: StreamId,
    },
    /// An accepted connection could not be bridged. The server keeps accepting.
    BridgeFailed {
        session_id: SessionId,
        remote: SocketAddr,
        /// Why the join failed; classified as an audio join failure.
        error: RendezvousError,
    },
    /// Bind or accept failed. The server stops serving for good.
    Faulted(RendezvousError),
    /// The accept loop exited after teardown.
    Stopped,
}

struct Teardown {
    thread: Option<JoinHandle<()>>,
    closed: bool,
}

/// Listening socket on an ephemeral port with a dedicated accept thread.
///
/// The accept thread is started by [`start`](Self::start) and stopped by
/// [`tear_down`](Self::tear_down) or on drop.
pub struct RendezvousServer {
    port: Arc<PortCell>,
    cancel: watch::Sender<bool>,
    alive: Arc<AtomicBool>,
    teardown: Mutex<Teardown>,
}

/// Clears the alive flag when the accept thread exits, however it exits.
struct AliveGuard(Arc<AtomicBool>);

impl Drop for AliveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl RendezvousServer {
    /// Bind and start accepting on a background thread.
    ///
    /// The port is published asynchronously: [`local_port`](Self::local_port)
    /// is `None` until the first [`ServerEvent::Listening`].
    pub fn start(
        config: RendezvousConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerEvent>), RendezvousError> {
        let port = Arc::new(PortCell::new());
        let (cancel, cancel_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        let thread = {
            let port = Arc::clone(&port);
            let guard = AliveGuard(Arc::clone(&alive));
            std::thread::Builder::new()
                .name(ACCEPT_THREAD_NAME.to_string())
                .spawn(move || {
                    let _guard = guard;
                    run_accept_thread(config, &port, &handler, &events_tx, cancel_rx);
                })
                .map_err(RendezvousError::Spawn)?
        };

        Ok((
            Self {
                port,
                cancel,
                alive,
                teardown: Mutex::new(Teardown {
                    thread: Some(thread),
                    closed: false,
                }),
            },
            events_rx,
        ))
    }

    /// The bound port, or `None` while still unassigned.
    pub fn local_port(&self) -> Option<u16> {
        self.port.get()
    }

    /// Block until the port is assigned or `timeout` elapses.
    pub fn wait_for_port(&self, timeout: Duration) -> Option<u16> {
        self.port.wait(timeout)
    }

    /// Whether the accept thread is still alive.
    ///
    /// Turns false once the thread exits, whether by teardown or by a fault.
    pub fn is_running(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Stop accepting, close the socket, and wait for the accept thread.
    ///
    /// Idempotent. A connection already handed to the handler finishes first.
    /// Concurrent callers all return only after the thread has exited.
    pub fn tear_down(&self) {
        let mut teardown = self.lock();
        if teardown.closed {
            return;
        }
        teardown.closed = true;

        // Wakes the accept loop, which drops the listener on its way out.
        self.cancel.send_replace(true);

        let Some(thread) = teardown.thread.take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            // Called from a handler on the accept thread; the loop exits once
            // the handler returns.
            debug!("teardown requested from the accept thread");
            return;
        }
        if thread.join().is_err() {
            let err = RendezvousError::Close("accept thread panicked".to_string());
            error!(
                kind = %FailureKind::SocketCloseFailure,
                error = %err,
                "rendezvous socket was not closed cleanly"
            );
        }
        info!("rendezvous server torn down");
    }

    fn lock(&self) -> MutexGuard<'_, Teardown> {
        self.teardown.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        self.tear_down();
    }
}

fn run_accept_thread(
    config: RendezvousConfig,
    port: &PortCell,
    handler: &Arc<dyn ConnectionHandler>,
    events: &mpsc::UnboundedSender<ServerEvent>,
    cancel: watch::Receiver<bool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            fault(events, RendezvousError::Bind(e));
            return;
        }
    };
    runtime.block_on(accept_loop(config, port, handler.as_ref(), events, cancel));
}

async fn accept_loop(
    config: RendezvousConfig,
    port: &PortCell,
    handler: &dyn ConnectionHandler,
    events: &mpsc::UnboundedSender<ServerEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let listener = match TcpListener::bind(SocketAddr::new(config.bind, 0)).await {
        Ok(listener) => listener,
        Err(e) => {
            fault(events, RendezvousError::Bind(e));
            return;
        }
    };
    let bound = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => {
            fault(events, RendezvousError::Bind(e));
            return;
        }
    };

    port.set(bound.port());
    info!(addr = %bound, port = bound.port(), "rendezvous socket listening");
    let _ = events.send(ServerEvent::Listening(bound.port()));

    let mut ended = handler.ended_streams();

    loop {
        if *cancel.borrow_and_update() {
            break;
        }
        tokio::select! {
            biased;

            changed = cancel.changed() => {
                if changed.is_err() {
                    // Server handle dropped without a teardown.
                    break;
                }
            }
            stream = next_ended(&mut ended) => match stream {
                Some(stream) => handler.stream_ended(stream, events),
                None => ended = None,
            },
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    let stream = match stream.into_std().and_then(|s| {
                        s.set_nonblocking(false)?;
                        Ok(s)
                    }) {
                        Ok(stream) => stream,
                        Err(e) => {
                            warn!(remote = %remote, error = %e, "dropping unusable connection");
                            continue;
                        }
                    };
                    let connection = AcceptedConnection::new(stream, remote);
                    debug!(
                        session = %connection.session_id,
                        remote = %remote,
                        "accepted connection"
                    );
                    handler.handle(connection, events);
                }
                Err(e) => {
                    if *cancel.borrow() {
                        break;
                    }
                    fault(events, RendezvousError::Accept(e));
                    return;
                }
            },
        }
    }

    drop(listener);
    debug!(port = bound.port(), "accept loop stopped by teardown");
    let _ = events.send(ServerEvent::Stopped);
}

async fn next_ended(ended: &mut Option<mpsc::UnboundedReceiver<StreamId>>) -> Option<StreamId> {
    match ended {
        Some(ended) => ended.recv().await,
        None => std::future::pending().await,
    }
}

fn fault(events: &mpsc::UnboundedSender<ServerEvent>, err: RendezvousError) {
    error!(kind = %FailureKind::BindOrAcceptFailure, error = %err, "rendezvous server stopped");
    let _ = events.send(ServerEvent::Faulted(err));
}

#[cfg(test)]
mod tests {
    use std::net::TcpStream;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::mpsc::error::TryRecvError;

    use super::*;

    #[derive(Default)]
    struct CountingHandler {
        accepted: AtomicUsize,
    }

    impl ConnectionHandler for CountingHandler {
        fn handle(&self, _connection: AcceptedConnection, _events: &mpsc::UnboundedSender<ServerEvent>) {
            self.accepted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn loopback() -> RendezvousConfig {
        RendezvousConfig {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    #[test]
    fn default_binds_all_interfaces() {
        assert!(RendezvousConfig::default().bind.is_unspecified());
    }

    #[test]
    fn publishes_port_and_accepts() {
        let handler = Arc::new(CountingHandler::default());
        let (server, mut events) = RendezvousServer::start(loopback(), handler.clone()).unwrap();

        let port = server.wait_for_port(Duration::from_secs(5)).unwrap();
        assert_ne!(port, 0);
        assert!(matches!(events.blocking_recv(), Some(ServerEvent::Listening(p)) if p == port));

        let _client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while handler.accepted.load(Ordering::SeqCst) == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handler.accepted.load(Ordering::SeqCst), 1);

        assert!(server.is_running());
        server.tear_down();
        assert!(!server.is_running());
        assert_eq!(server.local_port(), Some(port));
        assert!(matches!(events.try_recv(), Ok(ServerEvent::Stopped)));
        // The accept thread owned the only sender.
        assert!(matches!(events.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn fault_ends_the_thread_without_teardown() {
        let handler = Arc::new(CountingHandler::default());
        // TEST-NET-1 is never a local address.
        let config = RendezvousConfig {
            bind: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)),
        };
        let (server, mut events) = RendezvousServer::start(config, handler).unwrap();

        assert!(matches!(events.blocking_recv(), Some(ServerEvent::Faulted(_))));
        assert!(events.blocking_recv().is_none());
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while server.is_running() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!server.is_running());
        assert_eq!(server.local_port(), None);
        server.tear_down();
    }

    #[test]
    fn drop_tears_down() {
        let handler = Arc::new(CountingHandler::default());
        let (server, mut events) = RendezvousServer::start(loopback(), handler).unwrap();
        server.wait_for_port(Duration::from_secs(5)).unwrap();
        drop(server);

        let mut saw_stopped = false;
        while let Some(event) = events.blocking_recv() {
            saw_stopped |= matches!(event, ServerEvent::Stopped);
        }
        assert!(saw_stopped);
    }
}
