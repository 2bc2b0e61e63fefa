//! Shared types for micphone.
//!
//! This crate contains the types shared across the micphone workspace:
//! DNS-SD service records, discovery state, session identifiers and the
//! failure taxonomy every subsystem reports through.

pub mod failure;
pub mod record;
pub mod session;
pub mod state;

pub use failure::{FailureCode, FailureKind};
pub use record::{
    normalize_service_type, qualified_service_type, same_service_type, RecordError,
    ServiceRecord, DEFAULT_SERVICE_NAME, DEFAULT_SERVICE_TYPE,
};
pub use session::SessionId;
pub use state::DiscoveryState;
