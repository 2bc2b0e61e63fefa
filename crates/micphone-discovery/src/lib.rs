//! DNS-SD discovery for micphone.
//!
//! Defines the [`DiscoveryBackend`] trait for browsing and resolving
//! advertised services, the [`DiscoveryMachine`] that decides which
//! advertisements matter, and the [`DiscoveryListener`] that drives a backend
//! through the machine. The mdns-sd backend lives behind the `mdns` feature,
//! a scriptable backend for tests behind `mock`.

use async_trait::async_trait;
use micphone_types::{FailureCode, ServiceRecord};
use tokio::sync::mpsc;

pub mod error;
pub mod listener;
#[cfg(feature = "mdns")]
pub mod mdns;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod state;

pub use error::DiscoveryError;
pub use listener::DiscoveryListener;
pub use state::{DiscoveryMachine, Effect};

/// The single service instance a discovery session is looking for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryTarget {
    /// DNS-SD service type, e.g. `_rtp._udp.`.
    pub service_type: String,
    /// Exact instance name to resolve; every other instance is ignored.
    pub service_name: String,
}

impl DiscoveryTarget {
    pub fn new(service_type: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            service_type: service_type.into(),
            service_name: service_name.into(),
        }
    }
}

impl Default for DiscoveryTarget {
    fn default() -> Self {
        Self::new(
            micphone_types::DEFAULT_SERVICE_TYPE,
            micphone_types::DEFAULT_SERVICE_NAME,
        )
    }
}

/// Callbacks from a discovery backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    DiscoveryStarted,
    DiscoveryStopped,
    ServiceFound(ServiceRecord),
    ServiceLost(ServiceRecord),
    Resolved(ServiceRecord),
    ResolveFailed {
        record: ServiceRecord,
        code: FailureCode,
    },
    StartFailed {
        code: FailureCode,
    },
    StopFailed {
        code: FailureCode,
    },
}

/// Notifications delivered to the owner of a [`DiscoveryListener`].
#[derive(Debug)]
pub enum ListenerEvent {
    Started,
    Stopped,
    /// The target service resolved to a connectable host and port.
    Resolved(ServiceRecord),
    /// A previously seen instance of the target went away.
    Lost(ServiceRecord),
    Failed(DiscoveryError),
}

/// Platform discovery subsystem.
///
/// Implementations report everything asynchronously through the channel
/// handed to [`start_discovery`](Self::start_discovery), including the
/// outcome of [`resolve`](Self::resolve).
#[async_trait]
pub trait DiscoveryBackend: Send + 'static {
    /// Start browsing for `service_type`, sending callbacks to `events`.
    async fn start_discovery(
        &mut self,
        service_type: &str,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<(), DiscoveryError>;

    /// Stop browsing.
    async fn stop_discovery(&mut self) -> Result<(), DiscoveryError>;

    /// Issue a resolution for `record`. The result arrives as
    /// [`BackendEvent::Resolved`] or [`BackendEvent::ResolveFailed`].
    async fn resolve(&mut self, record: ServiceRecord) -> Result<(), DiscoveryError>;
}
