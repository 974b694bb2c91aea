//! Tunnel device seams.
//!
//! The operating system's tunneling facility is an external collaborator:
//! the engine hands it a [`TunnelConfig`] and gets back a packet-level
//! duplex handle. Everything above this module works against the traits, so
//! platform backends and test doubles plug in the same way.

use clearguard_policy::AppId;
use std::io;
use std::net::Ipv4Addr;
use std::sync::Arc;
use thiserror::Error;

/// Parameters for establishing the virtual interface.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Interface address.
    pub address: Ipv4Addr,
    /// Prefix length for the interface address.
    pub prefix_len: u8,
    /// Route pulled through the tunnel, as network/prefix.
    pub route: (Ipv4Addr, u8),
    /// DNS server advertised to the device; queries to it are intercepted.
    pub dns_server: Ipv4Addr,
    /// Interface MTU.
    pub mtu: u16,
    /// Session name shown by the host.
    pub session_name: String,
    /// Apps excluded from the tunnel, drawn from the whitelist.
    /// Exclusion is best-effort: a failure per app is logged and skipped.
    pub excluded_apps: Vec<AppId>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            address: Ipv4Addr::new(10, 0, 0, 2),
            prefix_len: 32,
            route: (Ipv4Addr::new(0, 0, 0, 0), 0),
            dns_server: Ipv4Addr::new(10, 0, 0, 1),
            mtu: 1500,
            session_name: "clearguard".to_string(),
            excluded_apps: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel permission denied")]
    PermissionDenied,

    #[error("tunnel device unavailable: {0}")]
    Unavailable(String),

    #[error("tunnel I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Established packet-level duplex handle.
///
/// Reads block until a packet arrives or the device is closed; closing from
/// another thread makes pending and future reads fail, which is how the
/// relay loop is shut down.
pub trait TunnelDevice: Send + Sync {
    /// Reads one IP packet into `buf`, returning its length.
    fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Writes one IP packet out the device.
    fn write_packet(&self, packet: &[u8]) -> io::Result<usize>;

    /// Closes the device. Idempotent; unblocks pending reads.
    fn close(&self);
}

/// The OS tunneling facility.
pub trait TunnelProvider: Send + Sync {
    fn establish(&self, config: &TunnelConfig) -> Result<Arc<dyn TunnelDevice>, TunnelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_matches_interface_contract() {
        let config = TunnelConfig::default();

        assert_eq!(config.address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.prefix_len, 32);
        assert_eq!(config.route, (Ipv4Addr::new(0, 0, 0, 0), 0));
        assert_eq!(config.dns_server, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(config.mtu, 1500);
        assert!(config.excluded_apps.is_empty());
    }
}
