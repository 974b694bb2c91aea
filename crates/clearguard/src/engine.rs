//! Master orchestrator.
//!
//! [`FilterEngine`] owns the lifecycle of every filtering loop. The state
//! machine has two variants, `Stopped` and `Running`; the tunnel device and
//! task handles exist only inside `Running`, so writing to a closed tunnel
//! or double-starting a loop is unrepresentable. One cancellation token per
//! run replaces the shared is-running flags such services usually grow.
//!
//! Start establishes the tunnel (whitelisted apps excluded best-effort),
//! then spawns the relay thread, the DNS worker and listener, and the
//! screen sampler. Stop cancels the token, closes the device (which
//! unblocks the relay's blocking read), hides any active overlay, and
//! waits for every loop to finish. Stop is idempotent and safe even when a
//! sub-loop already died on its own.

use clearguard_net::{
    DnsProxy, DnsProxyConfig, DomainBlocklist, ProxyError, TunnelConfig, TunnelDevice,
    TunnelError, TunnelProvider, TunnelRelay, DNS_QUEUE_DEPTH,
};
use clearguard_overlay::{BlockingCoordinator, OverlaySurface, DEFAULT_COOLDOWN};
use clearguard_policy::PolicyStore;
use clearguard_vision::{
    ClassifierConfig, ClassifyError, ForegroundInspector, SamplerConfig, ScreenCapture,
    ScreenSampler, VisionClassifier,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tunnel: TunnelConfig,
    pub dns: DnsProxyConfig,
    pub classifier: ClassifierConfig,
    pub sampler: SamplerConfig,
    /// How long the blocking overlay stays up.
    pub overlay_cooldown: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            dns: DnsProxyConfig::default(),
            classifier: ClassifierConfig::default(),
            sampler: SamplerConfig::default(),
            overlay_cooldown: DEFAULT_COOLDOWN,
        }
    }
}

/// External capabilities supplied by the host.
pub struct HostSeams {
    pub tunnel: Arc<dyn TunnelProvider>,
    pub blocklist: Arc<dyn DomainBlocklist>,
    pub overlay: Arc<dyn OverlaySurface>,
    /// Screen capture surface. `None` on deployments without one; the
    /// sampler is then not started.
    pub capture: Option<Arc<dyn ScreenCapture>>,
    pub foreground: Arc<dyn ForegroundInspector>,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine already running")]
    AlreadyRunning,

    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error(transparent)]
    Dns(#[from] ProxyError),

    #[error("classifier unavailable: {0}")]
    Classifier(#[from] ClassifyError),

    #[error("failed to spawn relay thread: {0}")]
    Relay(std::io::Error),
}

struct Running {
    cancel: CancellationToken,
    device: Arc<dyn TunnelDevice>,
    relay_thread: std::thread::JoinHandle<()>,
    tasks: Vec<JoinHandle<()>>,
    coordinator: Arc<BlockingCoordinator>,
}

enum EngineState {
    Stopped,
    Running(Running),
}

pub struct FilterEngine {
    policy: PolicyStore,
    config: EngineConfig,
    seams: HostSeams,
    state: Mutex<EngineState>,
}

impl FilterEngine {
    pub fn new(policy: PolicyStore, config: EngineConfig, seams: HostSeams) -> Self {
        Self {
            policy,
            config,
            seams,
            state: Mutex::new(EngineState::Stopped),
        }
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, EngineState::Running(_))
    }

    /// Follows a master-toggle transition. Starting an already-running
    /// engine (or stopping a stopped one) is a no-op.
    pub async fn set_enabled(&self, enabled: bool) -> Result<(), EngineError> {
        if enabled {
            match self.start().await {
                Err(EngineError::AlreadyRunning) => Ok(()),
                other => other,
            }
        } else {
            self.stop().await;
            Ok(())
        }
    }

    /// Starts every filtering loop.
    ///
    /// A startup failure (tunnel permission, socket bind, classifier init)
    /// is fatal to the whole start: nothing is left half-running and the
    /// error is reported to the caller, which owns the "protection
    /// disabled" surface.
    pub async fn start(&self) -> Result<(), EngineError> {
        let mut state = self.state.lock().await;
        if matches!(*state, EngineState::Running(_)) {
            return Err(EngineError::AlreadyRunning);
        }

        let snapshot = self.policy.snapshot();
        let mut tunnel_config = self.config.tunnel.clone();
        tunnel_config.excluded_apps = snapshot.whitelist.iter().cloned().collect();

        let device = self.seams.tunnel.establish(&tunnel_config)?;

        // Everything fallible happens before anything is spawned, so a
        // failed start only has the device to clean up.
        let setup = self.prepare().await;
        let (proxy, coordinator, listener, classifier) = match setup {
            Ok(parts) => parts,
            Err(err) => {
                device.close();
                return Err(err);
            }
        };

        let cancel = CancellationToken::new();
        let (job_tx, job_rx) = mpsc::channel(DNS_QUEUE_DEPTH);

        let relay_thread = match TunnelRelay::new(device.clone(), job_tx).spawn() {
            Ok(handle) => handle,
            Err(err) => {
                device.close();
                return Err(EngineError::Relay(err));
            }
        };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(proxy.clone().run_worker(
            job_rx,
            device.clone(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(proxy.clone().run_listener(listener, cancel.clone())));

        if let Some(capture) = &self.seams.capture {
            let sampler = ScreenSampler::new(
                self.policy.clone(),
                capture.clone(),
                self.seams.foreground.clone(),
                Arc::new(classifier),
                self.config.sampler.clone(),
            );
            let coordinator = coordinator.clone();
            tasks.push(tokio::spawn(sampler.run(
                move |result| {
                    coordinator.evaluate(&result);
                },
                cancel.clone(),
            )));
        } else {
            warn!("no capture surface wired; screen sampling disabled");
        }

        *state = EngineState::Running(Running {
            cancel,
            device,
            relay_thread,
            tasks,
            coordinator,
        });
        info!("protection started");
        Ok(())
    }

    async fn prepare(
        &self,
    ) -> Result<
        (
            Arc<DnsProxy>,
            Arc<BlockingCoordinator>,
            tokio::net::UdpSocket,
            VisionClassifier,
        ),
        EngineError,
    > {
        let coordinator = BlockingCoordinator::new(
            self.policy.clone(),
            self.seams.overlay.clone(),
            self.config.overlay_cooldown,
        );

        let mut proxy = DnsProxy::new(
            self.config.dns.clone(),
            self.policy.clone(),
            self.seams.blocklist.clone(),
        );
        {
            let coordinator = coordinator.clone();
            proxy.set_block_observer(move |domain| coordinator.note_dns_block(domain));
        }
        let proxy = Arc::new(proxy);

        let listener = proxy.bind_listener().await?;
        let classifier =
            VisionClassifier::new(self.config.classifier.clone(), self.policy.clone())?;

        Ok((proxy, coordinator, listener, classifier))
    }

    /// Stops every loop and tears the tunnel down. Idempotent.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let EngineState::Running(running) = std::mem::replace(&mut *state, EngineState::Stopped)
        else {
            debug!("engine already stopped");
            return;
        };

        info!("stopping protection");
        let Running {
            cancel,
            device,
            relay_thread,
            tasks,
            coordinator,
        } = running;

        cancel.cancel();
        // Closing the device fails the relay's blocking read, ending its
        // loop even though it never polls the token.
        device.close();
        coordinator.dismiss();

        for task in tasks {
            let _ = task.await;
        }
        let _ = tokio::task::spawn_blocking(move || relay_thread.join()).await;

        info!("protection stopped");
    }
}
