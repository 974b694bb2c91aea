//! Blocking coordinator.
//!
//! Turns classification verdicts into overlay actions. The overlay is held
//! for a cooldown and hidden by a single cancellable timer; a new block
//! while one is active restarts that timer instead of stacking overlays.
//! DNS-triggered blocks carry no overlay (the traffic simply never
//! resolves) and are only recorded.
//!
//! An errored classification is inconclusive and never drives an action.

use crate::surface::OverlaySurface;
use clearguard_policy::PolicyStore;
use clearguard_vision::Classification;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long the overlay stays up after a block.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(5);

/// Outcome of evaluating one verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// No block warranted.
    None,
    /// Overlay shown.
    Block,
    /// Overlay was already up; its countdown restarted.
    AlreadyBlocked,
}

/// What triggered a block.
#[derive(Debug, Clone, PartialEq)]
pub enum BlockReason {
    ScreenContent { score: f32 },
    DnsDomain { domain: String },
}

/// One recorded block. Terminal once the cooldown passes without a
/// re-trigger.
#[derive(Debug, Clone)]
pub struct BlockDecision {
    pub triggered_at: Instant,
    pub reason: BlockReason,
    pub cooldown_until: Instant,
}

struct CoordinatorState {
    overlay_active: bool,
    /// Bumped on every trigger; a timer only hides the overlay if its
    /// generation is still current.
    generation: u64,
    hide_timer: Option<JoinHandle<()>>,
    last_decision: Option<BlockDecision>,
}

pub struct BlockingCoordinator {
    policy: PolicyStore,
    overlay: Arc<dyn OverlaySurface>,
    cooldown: Duration,
    state: Mutex<CoordinatorState>,
}

impl BlockingCoordinator {
    pub fn new(
        policy: PolicyStore,
        overlay: Arc<dyn OverlaySurface>,
        cooldown: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy,
            overlay,
            cooldown,
            state: Mutex::new(CoordinatorState {
                overlay_active: false,
                generation: 0,
                hide_timer: None,
                last_decision: None,
            }),
        })
    }

    /// Evaluates one classification verdict against the current filter
    /// level. The score boundary is inclusive.
    pub fn evaluate(self: &Arc<Self>, result: &Classification) -> Action {
        if result.error.is_some() {
            // Inconclusive: not a decision in either direction.
            return Action::None;
        }

        let threshold = self.policy.snapshot().filter_level.threshold();
        if !result.explicit || result.score < threshold {
            return Action::None;
        }

        self.trigger(BlockReason::ScreenContent {
            score: result.score,
        })
    }

    /// Records a DNS-level block. No overlay for this path.
    pub fn note_dns_block(&self, domain: &str) {
        let now = Instant::now();
        let decision = BlockDecision {
            triggered_at: now,
            reason: BlockReason::DnsDomain {
                domain: domain.to_string(),
            },
            cooldown_until: now,
        };
        info!("blocked DNS resolution of {}", domain);
        self.state.lock().unwrap().last_decision = Some(decision);
    }

    fn trigger(self: &Arc<Self>, reason: BlockReason) -> Action {
        let mut state = self.state.lock().unwrap();

        // Only one hide timer is ever live.
        if let Some(timer) = state.hide_timer.take() {
            timer.abort();
        }
        state.generation += 1;
        let generation = state.generation;

        let was_active = state.overlay_active;
        if !was_active {
            self.overlay.show();
            state.overlay_active = true;
        }

        let now = Instant::now();
        state.last_decision = Some(BlockDecision {
            triggered_at: now,
            reason: reason.clone(),
            cooldown_until: now + self.cooldown,
        });
        info!(
            "content blocked ({:?}), overlay up for {:?}",
            reason, self.cooldown
        );

        let coordinator = Arc::clone(self);
        state.hide_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(coordinator.cooldown).await;
            coordinator.expire(generation);
        }));

        if was_active {
            Action::AlreadyBlocked
        } else {
            Action::Block
        }
    }

    fn expire(&self, generation: u64) {
        let mut state = self.state.lock().unwrap();
        if state.generation != generation || !state.overlay_active {
            return;
        }
        debug!("overlay cooldown elapsed");
        self.overlay.hide();
        self.overlay_down(&mut state);
    }

    /// Tears the overlay down immediately. Used on master disable; safe to
    /// call at any time.
    pub fn dismiss(&self) {
        let mut state = self.state.lock().unwrap();
        if let Some(timer) = state.hide_timer.take() {
            timer.abort();
        }
        if state.overlay_active {
            self.overlay.hide();
        }
        state.generation += 1;
        state.overlay_active = false;
    }

    fn overlay_down(&self, state: &mut CoordinatorState) {
        state.overlay_active = false;
        state.hide_timer = None;
    }

    pub fn overlay_active(&self) -> bool {
        self.state.lock().unwrap().overlay_active
    }

    pub fn last_decision(&self) -> Option<BlockDecision> {
        self.state.lock().unwrap().last_decision.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clearguard_policy::{FilterLevel, PolicyState};
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingOverlay {
        shows: AtomicU64,
        hides: AtomicU64,
    }

    impl CountingOverlay {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                shows: AtomicU64::new(0),
                hides: AtomicU64::new(0),
            })
        }
    }

    impl OverlaySurface for CountingOverlay {
        fn show(&self) {
            self.shows.fetch_add(1, Ordering::SeqCst);
        }

        fn hide(&self) {
            self.hides.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn coordinator_at(
        level: FilterLevel,
        overlay: Arc<CountingOverlay>,
    ) -> Arc<BlockingCoordinator> {
        let mut state = PolicyState::default();
        state.filter_level = level;
        BlockingCoordinator::new(PolicyStore::new(state), overlay, DEFAULT_COOLDOWN)
    }

    fn verdict(explicit: bool, score: f32) -> Classification {
        Classification {
            explicit,
            score,
            detail: None,
            error: None,
        }
    }

    fn errored_verdict(score: f32) -> Classification {
        Classification {
            explicit: false,
            score,
            detail: None,
            error: Some(clearguard_vision::ClassifyError::Transport(
                "network".to_string(),
            )),
        }
    }

    #[tokio::test]
    async fn test_medium_level_decision_table() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::Medium, overlay);

        assert_eq!(coordinator.evaluate(&verdict(true, 0.6)), Action::Block);
        coordinator.dismiss();
        assert_eq!(coordinator.evaluate(&verdict(true, 0.4)), Action::None);
        assert_eq!(coordinator.evaluate(&errored_verdict(0.9)), Action::None);
    }

    #[tokio::test]
    async fn test_threshold_boundary_is_inclusive() {
        for (level, threshold) in [
            (FilterLevel::Low, 0.7),
            (FilterLevel::Medium, 0.5),
            (FilterLevel::High, 0.3),
        ] {
            let overlay = CountingOverlay::new();
            let coordinator = coordinator_at(level, overlay);

            assert_eq!(
                coordinator.evaluate(&verdict(true, threshold)),
                Action::Block,
                "score equal to threshold must block at {:?}",
                level
            );
            coordinator.dismiss();
            assert_eq!(
                coordinator.evaluate(&verdict(true, threshold - 0.01)),
                Action::None
            );
        }
    }

    #[tokio::test]
    async fn test_non_explicit_high_score_does_not_block() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::High, overlay);
        assert_eq!(coordinator.evaluate(&verdict(false, 0.95)), Action::None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlay_hides_after_cooldown() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::Medium, overlay.clone());

        coordinator.evaluate(&verdict(true, 0.9));
        assert!(coordinator.overlay_active());

        tokio::time::sleep(DEFAULT_COOLDOWN + Duration::from_millis(100)).await;
        assert!(!coordinator.overlay_active());
        assert_eq!(overlay.shows.load(Ordering::SeqCst), 1);
        assert_eq!(overlay.hides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_block_restarts_countdown_without_stacking() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::Medium, overlay.clone());

        assert_eq!(coordinator.evaluate(&verdict(true, 0.9)), Action::Block);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(
            coordinator.evaluate(&verdict(true, 0.8)),
            Action::AlreadyBlocked
        );

        // The first timer would have fired here; the restart kept it up.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(coordinator.overlay_active());

        tokio::time::sleep(DEFAULT_COOLDOWN).await;
        assert!(!coordinator.overlay_active());

        // Exactly one overlay lifecycle.
        assert_eq!(overlay.shows.load(Ordering::SeqCst), 1);
        assert_eq!(overlay.hides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errored_result_never_touches_overlay() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::High, overlay.clone());

        coordinator.evaluate(&errored_verdict(1.0));
        tokio::time::sleep(DEFAULT_COOLDOWN).await;

        assert_eq!(overlay.shows.load(Ordering::SeqCst), 0);
        assert!(coordinator.last_decision().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dismiss_hides_and_cancels_timer() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::Medium, overlay.clone());

        coordinator.evaluate(&verdict(true, 0.9));
        coordinator.dismiss();
        assert!(!coordinator.overlay_active());
        assert_eq!(overlay.hides.load(Ordering::SeqCst), 1);

        // The aborted timer must not hide a second time.
        tokio::time::sleep(DEFAULT_COOLDOWN + Duration::from_secs(1)).await;
        assert_eq!(overlay.hides.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dns_block_is_logged_without_overlay() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::Medium, overlay.clone());

        coordinator.note_dns_block("blocked.example");

        assert_eq!(overlay.shows.load(Ordering::SeqCst), 0);
        assert!(matches!(
            coordinator.last_decision().unwrap().reason,
            BlockReason::DnsDomain { ref domain } if domain == "blocked.example"
        ));
    }

    #[tokio::test]
    async fn test_decision_records_cooldown_window() {
        let overlay = CountingOverlay::new();
        let coordinator = coordinator_at(FilterLevel::Medium, overlay);

        coordinator.evaluate(&verdict(true, 0.7));
        let decision = coordinator.last_decision().unwrap();

        assert!(matches!(
            decision.reason,
            BlockReason::ScreenContent { score } if score == 0.7
        ));
        assert_eq!(
            decision.cooldown_until - decision.triggered_at,
            DEFAULT_COOLDOWN
        );
    }
}
