//! Local network connectivity gate.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

use tracing::debug;

/// Whether the device is on a network where discovery can work.
pub trait Connectivity: Send + Sync {
    fn is_available(&self) -> bool;
}

/// Checks for a route off this host.
///
/// Connecting a UDP socket sends nothing but makes the OS pick a local
/// source address; a loopback or missing route means no usable network.
#[derive(Debug, Clone, Copy)]
pub struct LanConnectivity {
    target: SocketAddr,
}

impl LanConnectivity {
    pub fn new(target: SocketAddr) -> Self {
        Self { target }
    }
}

impl Default for LanConnectivity {
    /// Routes toward the mDNS multicast group, which every DNS-SD capable link carries.
    fn default() -> Self {
        Self::new(SocketAddr::from((Ipv4Addr::new(224, 0, 0, 251), 5353)))
    }
}

impl Connectivity for LanConnectivity {
    fn is_available(&self) -> bool {
        let local = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .and_then(|socket| {
                socket.connect(self.target)?;
                socket.local_addr()
            });
        match local {
            Ok(addr) => {
                let ip = addr.ip();
                debug!(route = %self.target, local = %ip, "connectivity check");
                !ip.is_loopback() && !ip.is_unspecified()
            }
            Err(e) => {
                debug!(route = %self.target, error = %e, "no route for connectivity check");
                false
            }
        }
    }
}

/// Always reports connectivity.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnected;

impl Connectivity for AlwaysConnected {
    fn is_available(&self) -> bool {
        true
    }
}
