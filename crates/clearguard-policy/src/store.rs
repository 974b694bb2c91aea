//! Copy-on-write policy store.
//!
//! Readers take an `Arc` snapshot and never observe a partially-updated
//! state; writers build a modified clone and swap the whole `Arc` in one
//! step. This replaces per-field mutation so an enabled flag can never be
//! seen next to a stale whitelist.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::warn;

/// Lower bound enforced on the scan interval.
///
/// The interval invariant is "strictly positive"; anything below this is
/// treated as a misconfiguration and clamped.
pub const MIN_SCAN_INTERVAL: Duration = Duration::from_millis(100);

/// Default capture cadence.
pub const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(500);

/// Application identifier, matched exactly against the whitelist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AppId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// User-selected filtering sensitivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl FilterLevel {
    /// Classification-score threshold at which content is blocked.
    ///
    /// Higher sensitivity means a lower threshold. The boundary is
    /// inclusive: a score equal to the threshold triggers a block.
    pub fn threshold(&self) -> f32 {
        match self {
            FilterLevel::Low => 0.7,
            FilterLevel::Medium => 0.5,
            FilterLevel::High => 0.3,
        }
    }
}

/// One consistent view of the filtering policy.
#[derive(Debug, Clone)]
pub struct PolicyState {
    /// Master protection flag.
    pub protection_enabled: bool,
    /// Filtering sensitivity.
    pub filter_level: FilterLevel,
    /// Delay between screen samples. Always > 0.
    pub scan_interval: Duration,
    /// Apps exempt from filtering, by exact identifier.
    pub whitelist: HashSet<AppId>,
    /// Bearer credential for the classification endpoint.
    pub classifier_key: String,
}

impl Default for PolicyState {
    fn default() -> Self {
        Self {
            protection_enabled: false,
            filter_level: FilterLevel::Medium,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            whitelist: HashSet::new(),
            classifier_key: String::new(),
        }
    }
}

impl PolicyState {
    /// Exact-match whitelist lookup.
    pub fn is_whitelisted(&self, app: &AppId) -> bool {
        self.whitelist.contains(app)
    }
}

/// Handle to the shared policy. Cheap to clone; all clones observe the
/// same state.
#[derive(Clone)]
pub struct PolicyStore {
    inner: Arc<RwLock<Arc<PolicyState>>>,
}

impl PolicyStore {
    pub fn new(state: PolicyState) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(state))),
        }
    }

    /// Returns a consistent snapshot of the current policy.
    pub fn snapshot(&self) -> Arc<PolicyState> {
        self.inner.read().unwrap().clone()
    }

    /// Replaces the entire policy in one step.
    pub fn replace(&self, state: PolicyState) {
        *self.inner.write().unwrap() = Arc::new(state);
    }

    fn update(&self, mutate: impl FnOnce(&mut PolicyState)) {
        let mut guard = self.inner.write().unwrap();
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
    }

    pub fn set_protection_enabled(&self, enabled: bool) {
        self.update(|state| state.protection_enabled = enabled);
    }

    pub fn set_filter_level(&self, level: FilterLevel) {
        self.update(|state| state.filter_level = level);
    }

    /// Sets the scan interval, clamping values below [`MIN_SCAN_INTERVAL`].
    pub fn set_scan_interval(&self, interval: Duration) {
        let interval = if interval < MIN_SCAN_INTERVAL {
            warn!(
                "scan interval {:?} below minimum, clamping to {:?}",
                interval, MIN_SCAN_INTERVAL
            );
            MIN_SCAN_INTERVAL
        } else {
            interval
        };
        self.update(|state| state.scan_interval = interval);
    }

    pub fn add_whitelisted_app(&self, app: AppId) {
        self.update(|state| {
            state.whitelist.insert(app);
        });
    }

    pub fn remove_whitelisted_app(&self, app: &AppId) {
        self.update(|state| {
            state.whitelist.remove(app);
        });
    }

    pub fn set_classifier_key(&self, key: impl Into<String>) {
        let key = key.into();
        self.update(|state| state.classifier_key = key);
    }
}

impl Default for PolicyStore {
    fn default() -> Self {
        Self::new(PolicyState::default())
    }
}
