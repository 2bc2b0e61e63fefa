//! Rendezvous listening socket and audio bridge for micphone.
//!
//! [`RendezvousServer`] owns one listening TCP socket on an ephemeral port
//! and a dedicated accept thread. Every accepted connection is handed to a
//! [`ConnectionHandler`]; [`BridgeHandler`] is the production handler, which
//! wraps the connection in an [`AudioBridge`] and joins it to the injected
//! mixing group.

pub mod bridge;
pub mod connection;
pub mod error;
pub mod port;
pub mod server;

pub use bridge::{AudioBridge, BridgeHandler};
pub use connection::{AcceptedConnection, ConnectionHandler};
pub use error::RendezvousError;
pub use port::PortCell;
pub use server::{RendezvousConfig, RendezvousServer, ServerEvent};
