//! The seam between the capture loop and whatever produces pixels.
//!
//! A [`CameraBackend`] opens hardware sessions; a [`CameraSession`] is one
//! configured, streaming connection that the capture thread drives. Splitting
//! the two lets resolution changes tear the session down and reopen it while
//! the backend itself stays registered.

use thiserror::Error;

use crate::capture::frame::Frame;
use crate::CaptureSettings;

#[derive(Error, Debug)]
pub enum CaptureError {
    /// The capture session could not be opened or configured at all.
    /// Surfaced to the caller; `Camera::start` fails with this.
    #[error("camera hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// The session died mid-stream. The capture loop stops on this.
    #[error("capture session lost: {0}")]
    SessionLost(String),

    /// One capture attempt failed but the session looks alive.
    /// Logged and retried with backoff; the loop continues.
    #[error("transient capture error: {0}")]
    Transient(String),

    /// A captured buffer could not be decoded into a usable frame.
    #[error("frame decode error: {0}")]
    Decode(String),
}

/// A source of camera sessions. Implementations: [`SyntheticBackend`]
/// (always available), `V4l2Backend` behind the `v4l2` feature.
///
/// [`SyntheticBackend`]: crate::capture::SyntheticBackend
pub trait CameraBackend: Send + Sync + 'static {
    /// Opens a streaming session configured for the given settings.
    fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraSession>, CaptureError>;
}

/// One live, streaming capture session. Owned by the capture thread.
pub trait CameraSession: Send {
    /// Captures the next frame. Blocks for at most roughly one frame time.
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    /// Applies brightness/contrast/saturation/exposure to the live session.
    /// Resolution is intentionally absent: changing it requires a reopen.
    fn apply_controls(&mut self, settings: &CaptureSettings) -> Result<(), CaptureError>;

    /// Re-applies rate limiting to the live session without a restart.
    fn set_frame_rate(&mut self, fps: f64) -> Result<(), CaptureError>;
}

impl std::fmt::Debug for dyn CameraSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CameraSession")
    }
}
