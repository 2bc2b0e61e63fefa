//! Session identity.

use uuid::Uuid;

/// Identifier for one accepted rendezvous connection and its audio bridge.
///
/// Only used to correlate log lines and status updates; it never goes on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_accepted_connection_gets_a_fresh_id() {
        let ids: std::collections::HashSet<SessionId> = (0..16).map(|_| SessionId::new()).collect();
        assert_eq!(ids.len(), 16);
    }

    #[test]
    fn displays_as_hyphenated_uuid_for_logs() {
        let shown = SessionId::new().to_string();
        assert_eq!(shown.matches('-').count(), 4);
        assert!(Uuid::parse_str(&shown).is_ok());
    }
}
