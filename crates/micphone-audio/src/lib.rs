//! Audio mixing-group capability for micphone.
//!
//! This crate defines the [`MixingGroup`] trait that every playback backend
//! implements, plus the [`AudioStream`] descriptor handed to it. A group is
//! always passed around explicitly so bridges and tests can substitute their
//! own. [`SoftwareMixer`] is the in-process backend; a recording mock lives
//! behind the `mock` feature.

use std::net::{SocketAddr, TcpStream};

use tokio::sync::mpsc;

pub mod error;
pub mod mixer;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod sink;

pub use error::AudioError;
pub use mixer::{MixerConfig, SoftwareMixer};
pub use sink::{PcmSink, SinkConfig};

/// Direction of a real-time stream relative to this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Send and receive.
    Normal,
    SendOnly,
    ReceiveOnly,
}

impl StreamMode {
    pub fn receives(self) -> bool {
        matches!(self, Self::Normal | Self::ReceiveOnly)
    }
}

/// Handle to a stream joined to a [`MixingGroup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// A real-time audio stream scoped to one remote peer.
#[derive(Debug)]
pub struct AudioStream {
    remote: SocketAddr,
    mode: StreamMode,
    source: Option<TcpStream>,
}

impl AudioStream {
    /// A new stream in [`StreamMode::Normal`] with no payload source.
    pub fn new(remote: SocketAddr) -> Self {
        Self {
            remote,
            mode: StreamMode::Normal,
            source: None,
        }
    }

    /// Attach the connection carrying the peer's audio payload.
    #[must_use]
    pub fn with_source(mut self, source: TcpStream) -> Self {
        self.source = Some(source);
        self
    }

    pub fn set_mode(&mut self, mode: StreamMode) {
        self.mode = mode;
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    pub fn take_source(&mut self) -> Option<TcpStream> {
        self.source.take()
    }
}

/// Aggregates inbound streams into one local playback signal.
///
/// `join` must not block for long: it is called inline on the rendezvous
/// accept loop.
pub trait MixingGroup: Send + Sync + 'static {
    /// Add a stream to the mix.
    fn join(&self, stream: AudioStream) -> Result<StreamId, AudioError>;

    /// Remove a stream from the mix and release its payload source.
    fn leave(&self, id: StreamId) -> Result<(), AudioError>;

    /// Number of streams currently in the mix.
    fn stream_count(&self) -> usize;

    /// Receive the id of every stream the group drops on its own, such as
    /// when the peer hangs up. Streams removed by [`leave`](Self::leave) are
    /// not reported.
    fn subscribe_ended(&self) -> mpsc::UnboundedReceiver<StreamId>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_defaults_to_normal_without_source() {
        let mut stream = AudioStream::new("127.0.0.1:5004".parse().unwrap());
        assert_eq!(stream.mode(), StreamMode::Normal);
        assert!(!stream.has_source());
        stream.set_mode(StreamMode::ReceiveOnly);
        assert_eq!(stream.mode(), StreamMode::ReceiveOnly);
        assert!(stream.mode().receives());
        assert!(!StreamMode::SendOnly.receives());
    }
}
