//! Tunnel packet relay.
//!
//! Owns the read side of the tunnel device on a dedicated OS thread:
//! read one packet, peel off DNS queries to the proxy worker's queue, write
//! everything else back out unchanged. The loop ends when closing the
//! device makes the blocking read fail.

use crate::packet;
use crate::tunnel::TunnelDevice;
use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, trace, warn};

/// Read buffer size, larger than any packet the interface MTU allows.
pub const RELAY_BUFFER_SIZE: usize = 32767;

/// Depth of the relay-to-proxy DNS queue.
pub const DNS_QUEUE_DEPTH: usize = 128;

/// Port DNS queries are redirected to.
const DNS_PORT: u16 = 53;

/// One intercepted DNS query, with the addressing needed to send the
/// answer back through the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsJob {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
    pub query: Vec<u8>,
}

/// Relay loop counters.
#[derive(Debug, Default)]
pub struct RelayStats {
    pub packets_in: AtomicU64,
    pub packets_relayed: AtomicU64,
    pub dns_intercepted: AtomicU64,
    pub dropped_queries: AtomicU64,
    pub write_failures: AtomicU64,
}

/// The tunnel read loop.
pub struct TunnelRelay {
    device: Arc<dyn TunnelDevice>,
    jobs: mpsc::Sender<DnsJob>,
    stats: Arc<RelayStats>,
}

impl TunnelRelay {
    pub fn new(device: Arc<dyn TunnelDevice>, jobs: mpsc::Sender<DnsJob>) -> Self {
        Self {
            device,
            jobs,
            stats: Arc::new(RelayStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RelayStats> {
        self.stats.clone()
    }

    /// Spawns the relay on its own named thread.
    pub fn spawn(self) -> io::Result<thread::JoinHandle<()>> {
        thread::Builder::new()
            .name("tunnel-relay".to_string())
            .spawn(move || {
                info!("tunnel relay started");
                self.run();
                info!("tunnel relay stopped");
            })
    }

    fn run(self) {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];

        loop {
            let len = match self.device.read_packet(&mut buf) {
                Ok(0) => {
                    info!("tunnel device closed; relay exiting");
                    break;
                }
                Ok(len) => len,
                Err(err) => {
                    // Reads fail when the device is torn down; that is the
                    // normal shutdown path.
                    info!("tunnel read ended: {}", err);
                    break;
                }
            };

            self.stats.packets_in.fetch_add(1, Ordering::Relaxed);
            let packet = &buf[..len];

            match packet::parse_udp(packet) {
                Some(udp) if udp.dst.port() == DNS_PORT => {
                    trace!("intercepted DNS query {} -> {}", udp.src, udp.dst);
                    let job = DnsJob {
                        src: udp.src,
                        dst: udp.dst,
                        query: udp.payload,
                    };
                    match self.jobs.try_send(job) {
                        Ok(()) => {
                            self.stats.dns_intercepted.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(TrySendError::Full(_)) => {
                            // The client will retry; forwarding must not stall.
                            self.stats.dropped_queries.fetch_add(1, Ordering::Relaxed);
                            warn!("DNS queue full, dropping query");
                        }
                        Err(TrySendError::Closed(_)) => {
                            info!("DNS worker gone; relay exiting");
                            break;
                        }
                    }
                }
                _ => {
                    // Everything that is not a DNS query is relayed verbatim.
                    match self.device.write_packet(packet) {
                        Ok(_) => {
                            self.stats.packets_relayed.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(err) => {
                            // A stuck packet must not halt the relay.
                            self.stats.write_failures.fetch_add(1, Ordering::Relaxed);
                            warn!("tunnel write failed: {}", err);
                        }
                    }
                }
            }
        }
    }
}
