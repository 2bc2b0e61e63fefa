//! DNS-SD service records.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Service type advertised by the relay peer.
pub const DEFAULT_SERVICE_TYPE: &str = "_rtp._udp.";

/// Instance name of the relay peer.
pub const DEFAULT_SERVICE_NAME: &str = "KboxServer";

const LOCAL_DOMAIN: &str = "local.";
const LOCAL_SUFFIX: &str = ".local";

/// An advertised service, before or after resolution.
///
/// Identity is `(name, service_type)`. `host` and `port` are only filled in
/// by a successful resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Instance name, e.g. `KboxServer`.
    pub name: String,
    /// Service type, e.g. `_rtp._udp.`.
    pub service_type: String,
    /// Address the instance resolved to; IPv4 is preferred when both exist.
    pub host: Option<IpAddr>,
    /// Port the instance advertises.
    pub port: Option<u16>,
}

/// Why a DNS-SD fullname could not be turned into a [`ServiceRecord`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("fullname {fullname:?} does not belong to service type {service_type:?}")]
    TypeMismatch {
        fullname: String,
        service_type: String,
    },

    #[error("fullname {0:?} has an empty instance name")]
    EmptyName(String),
}

impl ServiceRecord {
    /// An unresolved record as reported by a browse.
    pub fn discovered(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            host: None,
            port: None,
        }
    }

    /// Split a DNS-SD fullname (`<instance>.<type>.local.`) into a record.
    pub fn from_fullname(fullname: &str, service_type: &str) -> Result<Self, RecordError> {
        let wanted = normalize_service_type(service_type);
        let trimmed = fullname.trim_end_matches('.');
        let trimmed = trimmed.strip_suffix(LOCAL_SUFFIX).unwrap_or(trimmed);

        let name = trimmed
            .strip_suffix(wanted.as_str())
            .and_then(|s| s.strip_suffix('.'))
            .ok_or_else(|| RecordError::TypeMismatch {
                fullname: fullname.to_string(),
                service_type: service_type.to_string(),
            })?;

        if name.is_empty() {
            return Err(RecordError::EmptyName(fullname.to_string()));
        }
        Ok(Self::discovered(name, service_type))
    }

    /// Return a copy carrying the resolved host and port.
    #[must_use]
    pub fn resolved(&self, host: IpAddr, port: u16) -> Self {
        Self {
            host: Some(host),
            port: Some(port),
            ..self.clone()
        }
    }

    /// Whether host and port are both known.
    pub fn is_resolved(&self) -> bool {
        self.host.is_some() && self.port.is_some()
    }

    /// Connectable address, if resolved.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        Some(SocketAddr::new(self.host?, self.port?))
    }

    /// Whether two records name the same service instance.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.name == other.name && same_service_type(&self.service_type, &other.service_type)
    }
}

impl std::fmt::Display for ServiceRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.service_type)?;
        if let Some(addr) = self.socket_addr() {
            write!(f, " at {addr}")?;
        }
        Ok(())
    }
}

/// Canonical form of a service type: no `local.` domain, no trailing dot.
pub fn normalize_service_type(service_type: &str) -> String {
    let trimmed = service_type.trim().trim_end_matches('.');
    let trimmed = trimmed.strip_suffix(LOCAL_SUFFIX).unwrap_or(trimmed);
    trimmed.to_ascii_lowercase()
}

/// Compare two service types ignoring domain and trailing dots.
pub fn same_service_type(a: &str, b: &str) -> bool {
    normalize_service_type(a) == normalize_service_type(b)
}

/// Fully-qualified form for mDNS browsing, e.g. `_rtp._udp.local.`.
pub fn qualified_service_type(service_type: &str) -> String {
    format!("{}.{LOCAL_DOMAIN}", normalize_service_type(service_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_type_normalisation() {
        assert!(same_service_type("_rtp._udp.", "_rtp._udp.local."));
        assert!(same_service_type("_rtp._udp", "_RTP._udp."));
        assert!(!same_service_type("_rtp._udp.", "_rtp._tcp."));
        assert_eq!(qualified_service_type("_rtp._udp."), "_rtp._udp.local.");
    }

    #[test]
    fn fullname_split() {
        let record =
            ServiceRecord::from_fullname("KboxServer._rtp._udp.local.", DEFAULT_SERVICE_TYPE)
                .unwrap();
        assert_eq!(record.name, "KboxServer");
        assert_eq!(record.service_type, DEFAULT_SERVICE_TYPE);
        assert!(!record.is_resolved());
    }

    #[test]
    fn fullname_with_dots_in_instance() {
        let record =
            ServiceRecord::from_fullname("living.room._rtp._udp.local.", "_rtp._udp.").unwrap();
        assert_eq!(record.name, "living.room");
    }

    #[test]
    fn fullname_of_other_type_rejected() {
        let err = ServiceRecord::from_fullname("KboxServer._http._tcp.local.", "_rtp._udp.")
            .unwrap_err();
        assert!(matches!(err, RecordError::TypeMismatch { .. }));
    }

    #[test]
    fn fullname_without_instance_rejected() {
        let err = ServiceRecord::from_fullname("._rtp._udp.local.", "_rtp._udp.").unwrap_err();
        assert!(matches!(err, RecordError::EmptyName(_)));
    }

    #[test]
    fn resolved_copy_keeps_identity() {
        let found = ServiceRecord::discovered("KboxServer", "_rtp._udp.");
        let host: IpAddr = "192.168.1.20".parse().unwrap();
        let resolved = found.resolved(host, 5004);
        assert!(resolved.is_resolved());
        assert!(resolved.same_identity(&found));
        assert_eq!(resolved.socket_addr(), Some(SocketAddr::new(host, 5004)));
        assert_eq!(resolved.to_string(), "KboxServer (_rtp._udp.) at 192.168.1.20:5004");
    }
}
