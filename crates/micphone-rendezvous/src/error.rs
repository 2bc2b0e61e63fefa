//! Rendezvous and bridge errors.

use micphone_audio::AudioError;
use micphone_types::FailureKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RendezvousError {
    #[error("failed to bind listening socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    #[error("failed to start accept thread: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to close listening socket: {0}")]
    Close(String),

    #[error("failed to join audio stream: {0}")]
    AudioJoin(#[from] AudioError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RendezvousError {
    /// Classify the error, if it belongs to the shared failure taxonomy.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Bind(_) | Self::Accept(_) | Self::Spawn(_) => {
                Some(FailureKind::BindOrAcceptFailure)
            }
            Self::Close(_) => Some(FailureKind::SocketCloseFailure),
            Self::AudioJoin(_) => Some(FailureKind::AudioJoinFailure),
            Self::Io(_) | Self::Other(_) => None,
        }
    }
}
