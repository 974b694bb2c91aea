//! Host display seam.
//!
//! The overlay's visual design and window plumbing belong to the host; the
//! coordinator only drives show/hide.

use tracing::info;

/// Full-screen, input-transparent blocking overlay.
pub trait OverlaySurface: Send + Sync {
    fn show(&self);
    fn hide(&self);
}

/// Surface for headless hosts: block events are only logged.
pub struct LogOverlay;

impl OverlaySurface for LogOverlay {
    fn show(&self) {
        info!("blocking overlay shown");
    }

    fn hide(&self) {
        info!("blocking overlay hidden");
    }
}
