//! Relay errors.

use micphone_types::FailureKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("no local network connectivity")]
    NoConnectivity,

    #[error("already running")]
    AlreadyRunning,

    #[error("discovery error: {0}")]
    Discovery(#[from] micphone_discovery::DiscoveryError),

    #[error("rendezvous error: {0}")]
    Rendezvous(#[from] micphone_rendezvous::RendezvousError),

    #[error("audio error: {0}")]
    Audio(#[from] micphone_audio::AudioError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Discovery(e) => e.kind(),
            Self::Rendezvous(e) => e.kind(),
            Self::Audio(_) => Some(FailureKind::AudioJoinFailure),
            Self::Config(_) | Self::NoConnectivity | Self::AlreadyRunning | Self::Other(_) => None,
        }
    }
}
