//! Accepted connections and the seam between accepting and bridging.

use std::net::{SocketAddr, TcpStream};

use micphone_audio::StreamId;
use micphone_types::SessionId;
use tokio::sync::mpsc;

use crate::server::ServerEvent;

/// A peer connection taken off the rendezvous socket.
#[derive(Debug)]
pub struct AcceptedConnection {
    /// Fresh id assigned when the connection was accepted.
    pub session_id: SessionId,
    /// Peer address reported by `accept`.
    pub remote: SocketAddr,
    /// The connected socket, in blocking mode.
    pub stream: TcpStream,
}

impl AcceptedConnection {
    pub fn new(stream: TcpStream, remote: SocketAddr) -> Self {
        Self {
            session_id: SessionId::new(),
            remote,
            stream,
        }
    }
}

/// Receives each accepted connection.
///
/// Called inline on the accept thread: the server accepts nothing else
/// until `handle` returns, and teardown waits for it.
pub trait ConnectionHandler: Send + Sync + 'static {
    fn handle(&self, connection: AcceptedConnection, events: &mpsc::UnboundedSender<ServerEvent>);

    /// Streams that end without a teardown, polled by the accept loop.
    ///
    /// Taken once when the loop starts. Each id received is passed to
    /// [`stream_ended`](Self::stream_ended) on the accept thread.
    fn ended_streams(&self) -> Option<mpsc::UnboundedReceiver<StreamId>> {
        None
    }

    fn stream_ended(&self, _stream: StreamId, _events: &mpsc::UnboundedSender<ServerEvent>) {}
}
