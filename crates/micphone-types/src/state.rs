//! Discovery state.

use serde::{Deserialize, Serialize};

/// Lifecycle of a discovery session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryState {
    /// Never started.
    #[default]
    Idle,
    /// Browsing for advertisements.
    Discovering,
    /// Stopped explicitly or by a terminal backend error.
    Stopped,
}

impl DiscoveryState {
    /// Whether backend events should still be acted on.
    pub fn is_active(self) -> bool {
        self == Self::Discovering
    }
}

impl std::fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Discovering => write!(f, "Discovering"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}
