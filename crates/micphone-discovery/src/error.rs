//! Discovery subsystem errors.

use micphone_types::{FailureCode, FailureKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery of {service_type} failed to start: {code}")]
    StartFailed {
        service_type: String,
        code: FailureCode,
    },

    #[error("discovery of {service_type} failed to stop: {code}")]
    StopFailed {
        service_type: String,
        code: FailureCode,
    },

    #[error("resolving {name} ({service_type}) failed: {code}")]
    ResolveFailed {
        name: String,
        service_type: String,
        code: FailureCode,
    },

    #[error("discovery backend error: {0}")]
    Backend(String),

    #[error("backend not available on this platform")]
    Unavailable,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DiscoveryError {
    /// Classified failure, if this error is one the caller should surface.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::StartFailed { .. } => Some(FailureKind::DiscoveryStartFailure),
            Self::StopFailed { .. } => Some(FailureKind::DiscoveryStopFailure),
            Self::ResolveFailed { .. } => Some(FailureKind::ResolutionFailure),
            Self::Backend(_) | Self::Unavailable | Self::Other(_) => None,
        }
    }

    /// Opaque backend code; errors without one report `Internal`.
    pub fn code(&self) -> FailureCode {
        match self {
            Self::StartFailed { code, .. }
            | Self::StopFailed { code, .. }
            | Self::ResolveFailed { code, .. } => *code,
            Self::Backend(_) | Self::Unavailable | Self::Other(_) => FailureCode::Internal,
        }
    }
}
