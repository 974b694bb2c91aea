//! Blocking decisions and overlay lifecycle.

pub mod coordinator;
pub mod surface;

pub use coordinator::{Action, BlockDecision, BlockReason, BlockingCoordinator, DEFAULT_COOLDOWN};
pub use surface::{LogOverlay, OverlaySurface};
