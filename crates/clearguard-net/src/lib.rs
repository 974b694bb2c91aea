//! Network interception for ClearGuard.
//!
//! Owns the virtual-tunnel packet relay and the DNS interception path:
//! raw IP packets are read from the tunnel device, DNS datagrams are peeled
//! off to the proxy for a block/forward decision, and everything else is
//! relayed verbatim.

pub mod blocklist;
pub mod packet;
pub mod proxy;
pub mod relay;
pub mod tunnel;
pub mod wire;

pub use blocklist::{DomainBlocklist, SeedBlocklist};
pub use proxy::{DnsProxy, DnsProxyConfig, ProxyError, ProxyStats};
pub use relay::{DnsJob, RelayStats, TunnelRelay, DNS_QUEUE_DEPTH, RELAY_BUFFER_SIZE};
pub use tunnel::{TunnelConfig, TunnelDevice, TunnelError, TunnelProvider};
