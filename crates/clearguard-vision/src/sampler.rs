//! Periodic screen sampling loop.
//!
//! Idle → Sampling → Idle: the loop starts on master-enable and runs until
//! its cancellation token fires. Each iteration captures one frame, skips
//! classification when the foreground app is whitelisted, and otherwise
//! hands the frame to the classifier. The cadence is re-read from the
//! policy store every iteration, so frequency changes apply live.
//!
//! A failed capture is logged and retried after a fixed backoff; a single
//! bad frame never ends the loop.

use crate::capture::{ForegroundInspector, ScreenCapture};
use crate::classifier::{Classification, Classify};
use clearguard_policy::PolicyStore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Pause after a failed capture before trying again.
    pub capture_backoff: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            capture_backoff: Duration::from_secs(2),
        }
    }
}

/// Sampling loop counters.
#[derive(Debug, Default)]
pub struct SamplerStats {
    pub frames_captured: AtomicU64,
    pub capture_failures: AtomicU64,
    pub whitelist_skips: AtomicU64,
    pub classified: AtomicU64,
}

/// The capture/classify loop.
pub struct ScreenSampler<C: Classify> {
    policy: PolicyStore,
    capture: Arc<dyn ScreenCapture>,
    foreground: Arc<dyn ForegroundInspector>,
    classifier: Arc<C>,
    config: SamplerConfig,
    stats: Arc<SamplerStats>,
}

impl<C: Classify + 'static> ScreenSampler<C> {
    pub fn new(
        policy: PolicyStore,
        capture: Arc<dyn ScreenCapture>,
        foreground: Arc<dyn ForegroundInspector>,
        classifier: Arc<C>,
        config: SamplerConfig,
    ) -> Self {
        Self {
            policy,
            capture,
            foreground,
            classifier,
            config,
            stats: Arc::new(SamplerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SamplerStats> {
        self.stats.clone()
    }

    /// Runs until cancelled. Every verdict goes to `on_result`.
    pub async fn run<F>(self, on_result: F, cancel: CancellationToken)
    where
        F: Fn(Classification) + Send,
    {
        info!("screen sampler entering Sampling state");

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let snapshot = self.policy.snapshot();

            if !snapshot.protection_enabled {
                trace!("protection disabled, skipping sample");
                if !pause(snapshot.scan_interval, &cancel).await {
                    break;
                }
                continue;
            }

            let capture = self.capture.clone();
            let captured = tokio::select! {
                _ = cancel.cancelled() => break,
                captured = tokio::task::spawn_blocking(move || capture.capture()) => captured,
            };

            let frame = match captured {
                Ok(Ok(frame)) => frame,
                Ok(Err(err)) => {
                    self.stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("screen capture failed: {}", err);
                    if !pause(self.config.capture_backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
                Err(err) => {
                    self.stats.capture_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("capture task failed: {}", err);
                    if !pause(self.config.capture_backoff, &cancel).await {
                        break;
                    }
                    continue;
                }
            };
            self.stats.frames_captured.fetch_add(1, Ordering::Relaxed);

            let whitelisted = self
                .foreground
                .current_app()
                .map(|app| snapshot.is_whitelisted(&app))
                .unwrap_or(false);

            if whitelisted {
                // The frame is dropped here; whitelisted apps never reach
                // the classifier.
                self.stats.whitelist_skips.fetch_add(1, Ordering::Relaxed);
                trace!("foreground app whitelisted, skipping classification");
            } else {
                let result = tokio::select! {
                    _ = cancel.cancelled() => break,
                    result = self.classifier.classify(frame) => result,
                };
                self.stats.classified.fetch_add(1, Ordering::Relaxed);
                on_result(result);
            }

            // Read the interval fresh so live frequency changes apply
            // without restarting the loop.
            let interval = self.policy.snapshot().scan_interval;
            if !pause(interval, &cancel).await {
                break;
            }
        }

        self.capture.release();
        info!("screen sampler back to Idle state");
    }
}

/// Sleeps unless cancelled first. Returns false on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::CaptureError;
    use crate::frame::Frame;
    use clearguard_policy::{AppId, PolicyState};
    use std::future::Future;
    use std::sync::atomic::AtomicBool;

    struct StaticCapture {
        released: AtomicBool,
        fail_first: AtomicU64,
    }

    impl StaticCapture {
        fn new() -> Self {
            Self {
                released: AtomicBool::new(false),
                fail_first: AtomicU64::new(0),
            }
        }

        fn failing_first(n: u64) -> Self {
            Self {
                released: AtomicBool::new(false),
                fail_first: AtomicU64::new(n),
            }
        }
    }

    impl ScreenCapture for StaticCapture {
        fn capture(&self) -> Result<Frame, CaptureError> {
            if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(CaptureError::Failed("no image available".to_string()));
            }
            Ok(Frame::rgba8(2, 2, vec![0; 16]).unwrap())
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    struct FixedForeground(Option<AppId>);

    impl ForegroundInspector for FixedForeground {
        fn current_app(&self) -> Option<AppId> {
            self.0.clone()
        }
    }

    struct CountingClassifier {
        calls: AtomicU64,
    }

    impl CountingClassifier {
        fn new() -> Self {
            Self {
                calls: AtomicU64::new(0),
            }
        }
    }

    impl Classify for CountingClassifier {
        fn classify(&self, _frame: Frame) -> impl Future<Output = Classification> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async {
                Classification {
                    explicit: false,
                    score: 0.1,
                    detail: None,
                    error: None,
                }
            }
        }
    }

    fn enabled_policy(whitelist: &[&str]) -> PolicyStore {
        let mut state = PolicyState::default();
        state.protection_enabled = true;
        state.whitelist = whitelist.iter().map(|a| AppId::from(*a)).collect();
        PolicyStore::new(state)
    }

    fn sampler_with(
        policy: PolicyStore,
        capture: Arc<StaticCapture>,
        foreground: Option<AppId>,
        classifier: Arc<CountingClassifier>,
    ) -> ScreenSampler<CountingClassifier> {
        ScreenSampler::new(
            policy,
            capture,
            Arc::new(FixedForeground(foreground)),
            classifier,
            SamplerConfig::default(),
        )
    }

    async fn run_for(
        sampler: ScreenSampler<CountingClassifier>,
        duration: Duration,
    ) {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(|_| {}, cancel.clone()));
        tokio::time::sleep(duration).await;
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_samples_are_classified() {
        let capture = Arc::new(StaticCapture::new());
        let classifier = Arc::new(CountingClassifier::new());
        let sampler = sampler_with(enabled_policy(&[]), capture, None, classifier.clone());
        let stats = sampler.stats();

        run_for(sampler, Duration::from_secs(3)).await;

        assert!(classifier.calls.load(Ordering::SeqCst) > 0);
        assert!(stats.frames_captured.load(Ordering::SeqCst) > 0);
        assert_eq!(stats.whitelist_skips.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_whitelisted_app_never_reaches_classifier() {
        let capture = Arc::new(StaticCapture::new());
        let classifier = Arc::new(CountingClassifier::new());
        let sampler = sampler_with(
            enabled_policy(&["com.example.reader"]),
            capture,
            Some(AppId::from("com.example.reader")),
            classifier.clone(),
        );
        let stats = sampler.stats();

        run_for(sampler, Duration::from_secs(3)).await;

        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
        assert!(stats.whitelist_skips.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_foreground_still_classifies() {
        let capture = Arc::new(StaticCapture::new());
        let classifier = Arc::new(CountingClassifier::new());
        let sampler = sampler_with(
            enabled_policy(&["com.example.reader"]),
            capture,
            None,
            classifier.clone(),
        );

        run_for(sampler, Duration::from_secs(3)).await;

        assert!(classifier.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_errors_back_off_and_continue() {
        let capture = Arc::new(StaticCapture::failing_first(2));
        let classifier = Arc::new(CountingClassifier::new());
        let sampler = sampler_with(enabled_policy(&[]), capture, None, classifier.clone());
        let stats = sampler.stats();

        run_for(sampler, Duration::from_secs(10)).await;

        assert_eq!(stats.capture_failures.load(Ordering::SeqCst), 2);
        assert!(classifier.calls.load(Ordering::SeqCst) > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_classifier_calls_and_releases_capture() {
        let capture = Arc::new(StaticCapture::new());
        let classifier = Arc::new(CountingClassifier::new());
        let sampler = sampler_with(enabled_policy(&[]), capture.clone(), None, classifier.clone());

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(|_| {}, cancel.clone()));
        tokio::time::sleep(Duration::from_secs(2)).await;

        cancel.cancel();
        handle.await.unwrap();
        let calls_at_disable = classifier.calls.load(Ordering::SeqCst);

        // The loop is gone: nothing further reaches the classifier.
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(classifier.calls.load(Ordering::SeqCst), calls_at_disable);
        assert!(capture.released.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_protection_samples_nothing() {
        let capture = Arc::new(StaticCapture::new());
        let classifier = Arc::new(CountingClassifier::new());
        let sampler = sampler_with(PolicyStore::default(), capture, None, classifier.clone());
        let stats = sampler.stats();

        run_for(sampler, Duration::from_secs(3)).await;

        assert_eq!(classifier.calls.load(Ordering::SeqCst), 0);
        assert_eq!(stats.frames_captured.load(Ordering::SeqCst), 0);
    }
}
