//! Host capture seams.
//!
//! Screen capture and foreground-app identification are platform
//! capabilities supplied by the host; the sampler only depends on these
//! traits.

use crate::frame::Frame;
use clearguard_policy::AppId;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("screen capture permission revoked")]
    PermissionDenied,

    #[error("capture surface unavailable: {0}")]
    SurfaceUnavailable(String),

    #[error("capture failed: {0}")]
    Failed(String),
}

/// Source of screen frames.
///
/// `capture` may block while the host produces an image; the sampler calls
/// it on the blocking pool.
pub trait ScreenCapture: Send + Sync {
    fn capture(&self) -> Result<Frame, CaptureError>;

    /// Releases the capture surface. Called once when sampling stops.
    fn release(&self) {}
}

/// Identifies the app currently in the foreground.
///
/// The mechanism is host-specific and may be approximate or unavailable;
/// `None` means unknown. Whitelisting requires a positive exact match, so
/// unknown never skips classification.
pub trait ForegroundInspector: Send + Sync {
    fn current_app(&self) -> Option<AppId>;
}

/// Inspector for hosts without app identification.
pub struct NoForegroundInspector;

impl ForegroundInspector for NoForegroundInspector {
    fn current_app(&self) -> Option<AppId> {
        None
    }
}
