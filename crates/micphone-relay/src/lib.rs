//! Relay session lifecycle for micphone.
//!
//! [`Relay`] ties the pieces together: it gates on local network
//! connectivity, opens the rendezvous socket, discovers the peer relay over
//! DNS-SD, bridges every inbound connection into the mixing group, and tears
//! all of it down in a fixed order.

pub mod config;
pub mod connectivity;
pub mod error;
pub mod relay;
pub mod setup;

pub use config::Config;
pub use connectivity::{AlwaysConnected, Connectivity, LanConnectivity};
pub use error::RelayError;
pub use relay::{Relay, RelayEvent, RelayState, RelayStatus};
