//! DNS interception proxy.
//!
//! Decision order, per query:
//! 1. Protection disabled → forward unconditionally.
//! 2. Blocked domain → synthesize a sinkhole/NXDOMAIN answer locally.
//! 3. Otherwise forward the raw bytes to the upstream resolver on a fresh
//!    socket; no upstream answer within the timeout → SERVFAIL.
//!
//! The proxy serves two feeding paths: the tunnel relay's job queue (answers
//! re-encapsulated as IPv4/UDP and written back to the device) and a local
//! UDP listener for redirected datagrams.

use crate::blocklist::DomainBlocklist;
use crate::packet;
use crate::relay::DnsJob;
use crate::tunnel::TunnelDevice;
use crate::wire::{self, QTYPE_A, QTYPE_AAAA};
use clearguard_policy::PolicyStore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Largest DNS-over-UDP datagram we accept (EDNS0 default).
const MAX_DATAGRAM: usize = 4096;

#[derive(Debug, Clone)]
pub struct DnsProxyConfig {
    /// Upstream resolver forwarded queries go to.
    pub upstream: SocketAddr,
    /// Local listener for redirected queries.
    pub listen_addr: SocketAddr,
    /// How long to wait for an upstream answer before giving up.
    pub upstream_timeout: Duration,
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            upstream: "8.8.8.8:53".parse().unwrap(),
            listen_addr: "127.0.0.1:5353".parse().unwrap(),
            upstream_timeout: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind DNS listener: {0}")]
    Bind(std::io::Error),

    #[error("upstream I/O error: {0}")]
    Upstream(std::io::Error),

    #[error("upstream did not answer in time")]
    UpstreamTimeout,
}

/// Proxy counters.
#[derive(Debug, Default)]
pub struct ProxyStats {
    pub queries: AtomicU64,
    pub blocked: AtomicU64,
    pub forwarded: AtomicU64,
    pub upstream_timeouts: AtomicU64,
    pub upstream_errors: AtomicU64,
}

type BlockObserver = Arc<dyn Fn(&str) + Send + Sync>;

pub struct DnsProxy {
    config: DnsProxyConfig,
    policy: PolicyStore,
    blocklist: Arc<dyn DomainBlocklist>,
    block_observer: Option<BlockObserver>,
    stats: Arc<ProxyStats>,
}

impl DnsProxy {
    pub fn new(
        config: DnsProxyConfig,
        policy: PolicyStore,
        blocklist: Arc<dyn DomainBlocklist>,
    ) -> Self {
        Self {
            config,
            policy,
            blocklist,
            block_observer: None,
            stats: Arc::new(ProxyStats::default()),
        }
    }

    /// Registers a callback invoked with each blocked domain.
    pub fn set_block_observer<F>(&mut self, observer: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.block_observer = Some(Arc::new(observer));
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        self.stats.clone()
    }

    /// Answers one raw query datagram.
    ///
    /// Always produces an answer when one can be synthesized; `None` only
    /// when the query was unparseable and upstream failed too.
    pub async fn resolve(&self, query: &[u8]) -> Option<Vec<u8>> {
        self.stats.queries.fetch_add(1, Ordering::Relaxed);

        let snapshot = self.policy.snapshot();
        let question = wire::parse_question(query).ok();

        if snapshot.protection_enabled {
            if let Some(q) = &question {
                if self.blocklist.is_blocked(&q.name) {
                    self.stats.blocked.fetch_add(1, Ordering::Relaxed);
                    info!("blocked DNS query for {}", q.name);
                    if let Some(observer) = &self.block_observer {
                        observer(&q.name);
                    }
                    let answer = match q.qtype {
                        QTYPE_A | QTYPE_AAAA => wire::synthesize_sinkhole(query, q),
                        _ => wire::synthesize_nxdomain(query, q),
                    };
                    return Some(answer);
                }
            }
        }

        match self.forward(query).await {
            Ok(answer) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                Some(answer)
            }
            Err(ProxyError::UpstreamTimeout) => {
                self.stats.upstream_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!("upstream {} timed out", self.config.upstream);
                question.map(|q| wire::synthesize_servfail(query, &q))
            }
            Err(err) => {
                self.stats.upstream_errors.fetch_add(1, Ordering::Relaxed);
                warn!("upstream forward failed: {}", err);
                question.map(|q| wire::synthesize_servfail(query, &q))
            }
        }
    }

    /// Forwards the raw query on a transient socket.
    ///
    /// One socket per query keeps concurrent transactions from colliding on
    /// transaction IDs; the upstream answer is returned byte-for-byte.
    async fn forward(&self, query: &[u8]) -> Result<Vec<u8>, ProxyError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(ProxyError::Upstream)?;
        socket
            .connect(self.config.upstream)
            .await
            .map_err(ProxyError::Upstream)?;
        socket.send(query).await.map_err(ProxyError::Upstream)?;

        let mut buf = vec![0u8; MAX_DATAGRAM];
        let len = tokio::time::timeout(self.config.upstream_timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)?
            .map_err(ProxyError::Upstream)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Drains the relay's DNS queue, writing answers back out the tunnel.
    pub async fn run_worker(
        self: Arc<Self>,
        mut jobs: mpsc::Receiver<DnsJob>,
        device: Arc<dyn TunnelDevice>,
        cancel: CancellationToken,
    ) {
        info!("DNS worker started");
        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            // Each query resolves on its own task so one slow upstream
            // round-trip cannot delay the next query.
            let proxy = self.clone();
            let device = device.clone();
            tokio::spawn(async move {
                let Some(answer) = proxy.resolve(&job.query).await else {
                    return;
                };
                let response = packet::build_udp(job.dst, job.src, &answer);
                let write =
                    tokio::task::spawn_blocking(move || device.write_packet(&response)).await;
                match write {
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => warn!("failed to write DNS answer to tunnel: {}", err),
                    Err(err) => warn!("DNS answer write task failed: {}", err),
                }
            });
        }
        info!("DNS worker stopped");
    }

    /// Binds the local listener socket.
    pub async fn bind_listener(&self) -> Result<UdpSocket, ProxyError> {
        UdpSocket::bind(self.config.listen_addr)
            .await
            .map_err(ProxyError::Bind)
    }

    /// Serves redirected queries on the local listener.
    pub async fn run_listener(self: Arc<Self>, socket: UdpSocket, cancel: CancellationToken) {
        let socket = Arc::new(socket);
        let mut buf = vec![0u8; MAX_DATAGRAM];
        info!("DNS listener serving on {}", self.config.listen_addr);

        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(err) => {
                        warn!("DNS listener receive failed: {}", err);
                        continue;
                    }
                },
            };

            let query = buf[..len].to_vec();
            let proxy = self.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                if let Some(answer) = proxy.resolve(&query).await {
                    if let Err(err) = socket.send_to(&answer, peer).await {
                        debug!("failed to answer {}: {}", peer, err);
                    }
                }
            });
        }
        info!("DNS listener stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocklist::SeedBlocklist;
    use clearguard_policy::{PolicyState, PolicyStore};

    const QUERY_ID: [u8; 2] = [0xAB, 0xCD];

    fn query_for(name: &str) -> Vec<u8> {
        let mut datagram = vec![
            QUERY_ID[0], QUERY_ID[1], 0x01, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        for label in name.split('.') {
            datagram.push(label.len() as u8);
            datagram.extend_from_slice(label.as_bytes());
        }
        datagram.extend_from_slice(&[0x00, 0x00, 0x01, 0x00, 0x01]); // root, A, IN
        datagram
    }

    fn policy(enabled: bool) -> PolicyStore {
        let mut state = PolicyState::default();
        state.protection_enabled = enabled;
        PolicyStore::new(state)
    }

    fn proxy_with(
        upstream: SocketAddr,
        timeout: Duration,
        enabled: bool,
        blocklist: Arc<dyn DomainBlocklist>,
    ) -> DnsProxy {
        let config = DnsProxyConfig {
            upstream,
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            upstream_timeout: timeout,
        };
        DnsProxy::new(config, policy(enabled), blocklist)
    }

    /// Fake resolver: echoes each query back with the QR bit set.
    async fn spawn_echo_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            while let Ok((len, peer)) = socket.recv_from(&mut buf).await {
                let mut reply = buf[..len].to_vec();
                if reply.len() > 2 {
                    reply[2] |= 0x80;
                }
                let _ = socket.send_to(&reply, peer).await;
            }
        });
        addr
    }

    /// Resolver that accepts queries and never answers.
    async fn spawn_silent_upstream() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            while socket.recv_from(&mut buf).await.is_ok() {}
        });
        addr
    }

    #[tokio::test]
    async fn test_forward_preserves_transaction_id() {
        let upstream = spawn_echo_upstream().await;
        let proxy = proxy_with(
            upstream,
            Duration::from_secs(2),
            true,
            Arc::new(SeedBlocklist::with_entries([], [])),
        );

        let answer = proxy.resolve(&query_for("example.com")).await.unwrap();
        assert_eq!(&answer[0..2], &QUERY_ID);
        assert_eq!(answer[2] >> 7, 1); // upstream answer came back
    }

    #[tokio::test]
    async fn test_blocked_domain_gets_sinkhole_without_upstream() {
        // Unreachable upstream: a sinkhole answer proves no forward happened.
        let proxy = proxy_with(
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(50),
            true,
            Arc::new(SeedBlocklist::with_entries(["blocked.example"], [])),
        );

        let answer = proxy
            .resolve(&query_for("sub.blocked.example"))
            .await
            .unwrap();

        assert_eq!(&answer[0..2], &QUERY_ID);
        assert_eq!(answer[3] & 0x0F, 0); // NOERROR sinkhole, not SERVFAIL
        assert_eq!(u16::from_be_bytes([answer[6], answer[7]]), 1);
        assert_eq!(&answer[answer.len() - 4..], &[0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_disabled_policy_forwards_blocked_domain() {
        let upstream = spawn_echo_upstream().await;
        let proxy = proxy_with(
            upstream,
            Duration::from_secs(2),
            false,
            Arc::new(SeedBlocklist::with_entries(["blocked.example"], [])),
        );

        let answer = proxy.resolve(&query_for("blocked.example")).await.unwrap();
        // Forwarded to upstream rather than synthesized: no answer record.
        assert_eq!(u16::from_be_bytes([answer[6], answer[7]]), 0);
        assert_eq!(&answer[0..2], &QUERY_ID);
    }

    #[tokio::test]
    async fn test_upstream_timeout_yields_servfail() {
        let upstream = spawn_silent_upstream().await;
        let proxy = proxy_with(
            upstream,
            Duration::from_millis(50),
            true,
            Arc::new(SeedBlocklist::with_entries([], [])),
        );

        let answer = proxy.resolve(&query_for("example.com")).await.unwrap();
        assert_eq!(&answer[0..2], &QUERY_ID);
        assert_eq!(answer[3] & 0x0F, wire::RCODE_SERVFAIL);
    }

    #[tokio::test]
    async fn test_block_observer_sees_domain() {
        use std::sync::Mutex;

        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut proxy = proxy_with(
            "127.0.0.1:1".parse().unwrap(),
            Duration::from_millis(50),
            true,
            Arc::new(SeedBlocklist::with_entries(["blocked.example"], [])),
        );
        let sink = seen.clone();
        proxy.set_block_observer(move |domain| sink.lock().unwrap().push(domain.to_string()));

        let _ = proxy.resolve(&query_for("blocked.example")).await;
        assert_eq!(seen.lock().unwrap().as_slice(), &["blocked.example"]);
    }

    #[tokio::test]
    async fn test_unparseable_query_still_forwards() {
        let upstream = spawn_echo_upstream().await;
        let proxy = proxy_with(
            upstream,
            Duration::from_secs(2),
            true,
            Arc::new(SeedBlocklist::new()),
        );

        // Too short to parse; forwarded as-is rather than dropped.
        let answer = proxy.resolve(b"junk").await.unwrap();
        assert_eq!(&answer[..2], b"ju");
    }

    #[tokio::test]
    async fn test_listener_answers_redirected_query() {
        let upstream = spawn_echo_upstream().await;
        let proxy = Arc::new(proxy_with(
            upstream,
            Duration::from_secs(2),
            true,
            Arc::new(SeedBlocklist::with_entries([], [])),
        ));

        let listener = proxy.bind_listener().await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(proxy.clone().run_listener(listener, cancel.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query_for("example.com"), listen_addr)
            .await
            .unwrap();

        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..2], &QUERY_ID);
        assert!(len >= 12);

        cancel.cancel();
        server.await.unwrap();
    }
}
