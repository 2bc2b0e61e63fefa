//! Classified failures shared by every subsystem.
//!
//! Subsystem errors map onto a [`FailureKind`] so callers can decide how to
//! present them without matching on crate-specific error types.

use serde::{Deserialize, Serialize};

/// Failure taxonomy for the relay core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    DiscoveryStartFailure,
    DiscoveryStopFailure,
    ResolutionFailure,
    BindOrAcceptFailure,
    SocketCloseFailure,
    AudioJoinFailure,
}

impl FailureKind {
    /// Whether the failure permanently stops the component that raised it.
    ///
    /// Resolution and audio join failures leave discovery running and the
    /// server accepting; everything else needs an explicit restart.
    pub fn is_fatal(self) -> bool {
        !matches!(self, Self::ResolutionFailure | Self::AudioJoinFailure)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DiscoveryStartFailure => "discovery start failure",
            Self::DiscoveryStopFailure => "discovery stop failure",
            Self::ResolutionFailure => "resolution failure",
            Self::BindOrAcceptFailure => "bind or accept failure",
            Self::SocketCloseFailure => "socket close failure",
            Self::AudioJoinFailure => "audio join failure",
        };
        f.write_str(s)
    }
}

/// Opaque error code reported by a discovery backend.
///
/// The named values follow the DNS-SD failure codes used by mobile
/// discovery stacks; anything else is carried through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureCode {
    Internal,
    AlreadyActive,
    MaxLimit,
    Other(i32),
}

impl FailureCode {
    #[must_use]
    pub fn from_raw(code: i32) -> Self {
        match code {
            0 => Self::Internal,
            3 => Self::AlreadyActive,
            4 => Self::MaxLimit,
            other => Self::Other(other),
        }
    }

    #[must_use]
    pub fn as_raw(self) -> i32 {
        match self {
            Self::Internal => 0,
            Self::AlreadyActive => 3,
            Self::MaxLimit => 4,
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for FailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Internal => write!(f, "internal error (0)"),
            Self::AlreadyActive => write!(f, "already active (3)"),
            Self::MaxLimit => write!(f, "max limit (4)"),
            Self::Other(code) => write!(f, "code {code}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_code_raw_values() {
        assert_eq!(FailureCode::from_raw(0), FailureCode::Internal);
        assert_eq!(FailureCode::from_raw(3), FailureCode::AlreadyActive);
        assert_eq!(FailureCode::from_raw(4), FailureCode::MaxLimit);
        assert_eq!(FailureCode::from_raw(-7), FailureCode::Other(-7));
        assert_eq!(FailureCode::Other(42).as_raw(), 42);
        assert_eq!(FailureCode::MaxLimit.as_raw(), 4);
    }

    #[test]
    fn only_resolution_and_join_are_recoverable() {
        assert!(!FailureKind::ResolutionFailure.is_fatal());
        assert!(!FailureKind::AudioJoinFailure.is_fatal());
        assert!(FailureKind::BindOrAcceptFailure.is_fatal());
        assert!(FailureKind::DiscoveryStartFailure.is_fatal());
    }
}
