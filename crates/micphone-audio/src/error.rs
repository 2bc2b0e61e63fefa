//! Audio subsystem errors.

use thiserror::Error;

use crate::{StreamId, StreamMode};

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("stream mode {0:?} cannot join a playback group")]
    UnsupportedMode(StreamMode),

    #[error("stream has no payload source")]
    NoSource,

    #[error("unknown stream: {0}")]
    UnknownStream(StreamId),

    #[error("mixing group rejected stream: {0}")]
    JoinRejected(String),

    #[error("audio I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
