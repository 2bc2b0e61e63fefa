//! Joining accepted connections to the shared mixing group.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use micphone_audio::{AudioError, AudioStream, MixingGroup, StreamId, StreamMode};
use micphone_types::{FailureKind, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connection::{AcceptedConnection, ConnectionHandler};
use crate::error::RendezvousError;
use crate::server::ServerEvent;

/// One accepted connection joined to a mixing group as a receive-only stream.
pub struct AudioBridge {
    session_id: SessionId,
    remote: SocketAddr,
    stream: StreamId,
    group: Arc<dyn MixingGroup>,
    detached: bool,
}

impl AudioBridge {
    /// Wrap `connection` in a receive-only stream and join it to `group`.
    pub fn attach(
        connection: AcceptedConnection,
        group: Arc<dyn MixingGroup>,
    ) -> Result<Self, RendezvousError> {
        let AcceptedConnection {
            session_id,
            remote,
            stream,
        } = connection;

        let mut audio = AudioStream::new(remote).with_source(stream);
        audio.set_mode(StreamMode::ReceiveOnly);
        let stream = group.join(audio)?;

        info!(session = %session_id, remote = %remote, stream = %stream, "audio bridge attached");
        Ok(Self {
            session_id,
            remote,
            stream,
            group,
            detached: false,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn stream(&self) -> StreamId {
        self.stream
    }

    /// Leave the mixing group.
    pub fn detach(mut self) -> Result<(), RendezvousError> {
        self.leave()
    }

    fn leave(&mut self) -> Result<(), RendezvousError> {
        if self.detached {
            return Ok(());
        }
        self.detached = true;
        self.group.leave(self.stream)?;
        debug!(session = %self.session_id, stream = %self.stream, "audio bridge detached");
        Ok(())
    }

    /// The group already dropped the stream; there is nothing left to leave.
    fn mark_ended(&mut self) {
        self.detached = true;
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        if let Err(e) = self.leave() {
            debug!(session = %self.session_id, error = %e, "leave on drop failed");
        }
    }
}

impl std::fmt::Debug for AudioBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioBridge")
            .field("session_id", &self.session_id)
            .field("remote", &self.remote)
            .field("stream", &self.stream)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

/// [`ConnectionHandler`] that bridges every connection into one mixing group.
///
/// A session is released when its bridge is detached or when the group
/// reports its stream ended.
pub struct BridgeHandler {
    group: Arc<dyn MixingGroup>,
    bridges: Mutex<Vec<AudioBridge>>,
    ended: Mutex<Option<mpsc::UnboundedReceiver<StreamId>>>,
}

impl BridgeHandler {
    pub fn new(group: Arc<dyn MixingGroup>) -> Self {
        let ended = group.subscribe_ended();
        Self {
            group,
            bridges: Mutex::new(Vec::new()),
            ended: Mutex::new(Some(ended)),
        }
    }

    /// Sessions currently joined to the group.
    pub fn active_sessions(&self) -> usize {
        self.lock().len()
    }

    /// Detach every bridge. Returns how many were detached cleanly.
    pub fn detach_all(&self) -> usize {
        let bridges = std::mem::take(&mut *self.lock());
        let mut detached = 0;
        for bridge in bridges {
            let session = bridge.session_id();
            match bridge.detach() {
                Ok(()) => detached += 1,
                Err(RendezvousError::AudioJoin(AudioError::UnknownStream(stream))) => {
                    // Ended after the last stream_ended was handled.
                    debug!(session = %session, stream = %stream, "audio bridge already ended");
                }
                Err(e) => warn!(session = %session, error = %e, "failed to detach audio bridge"),
            }
        }
        detached
    }

    fn lock(&self) -> MutexGuard<'_, Vec<AudioBridge>> {
        self.bridges.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ConnectionHandler for BridgeHandler {
    fn handle(&self, connection: AcceptedConnection, events: &mpsc::UnboundedSender<ServerEvent>) {
        let session_id = connection.session_id;
        let remote = connection.remote;

        match AudioBridge::attach(connection, Arc::clone(&self.group)) {
            Ok(bridge) => {
                let stream = bridge.stream();
                self.lock().push(bridge);
                let _ = events.send(ServerEvent::SessionStarted {
                    session_id,
                    remote,
                    stream,
                });
            }
            Err(error) => {
                // The connection was consumed by the failed join and is closed.
                warn!(
                    kind = %FailureKind::AudioJoinFailure,
                    session = %session_id,
                    remote = %remote,
                    error = %error,
                    "could not join connection to the mix"
                );
                let _ = events.send(ServerEvent::BridgeFailed {
                    session_id,
                    remote,
                    error,
                });
            }
        }
    }

    fn ended_streams(&self) -> Option<mpsc::UnboundedReceiver<StreamId>> {
        self.ended
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    fn stream_ended(&self, stream: StreamId, events: &mpsc::UnboundedSender<ServerEvent>) {
        let ended = {
            let mut bridges = self.lock();
            bridges
                .iter()
                .position(|bridge| bridge.stream() == stream)
                .map(|pos| bridges.swap_remove(pos))
        };
        let Some(mut bridge) = ended else {
            debug!(stream = %stream, "ended stream has no session");
            return;
        };
        bridge.mark_ended();
        info!(
            session = %bridge.session_id(),
            remote = %bridge.remote(),
            stream = %stream,
            "session ended by peer"
        );
        let _ = events.send(ServerEvent::SessionEnded {
            session_id: bridge.session_id(),
            remote: bridge.remote(),
            stream,
        });
    }
}
