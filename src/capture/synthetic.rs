//! Synthetic camera backend: a moving-gradient test pattern.
//!
//! Stands in for real hardware in tests, demos and CI. Sessions are opened
//! and torn down exactly like a hardware backend's, so lifecycle behavior
//! (restart on resolution change, live control updates) is observable through
//! the counters this backend keeps.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use super::backend::{CameraBackend, CameraSession, CaptureError};
use super::frame::{Frame, PixelFormat};
use crate::CaptureSettings;

#[derive(Default)]
pub struct SyntheticBackend {
    unavailable: AtomicBool,
    sessions_opened: AtomicU64,
    frames_produced: Arc<AtomicU64>,
    /// Per-session frame budget after which capture reports SessionLost;
    /// 0 means sessions never die
    session_frame_limit: AtomicU64,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent `open` calls fail, to exercise the
    /// hardware-unavailable path.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// Number of sessions opened so far. A settings update that only touches
    /// controls must not bump this; a resolution change must.
    pub fn sessions_opened(&self) -> u64 {
        self.sessions_opened.load(Ordering::Relaxed)
    }

    /// Total frames produced across all sessions.
    pub fn frames_produced(&self) -> u64 {
        self.frames_produced.load(Ordering::Relaxed)
    }

    /// Makes sessions opened from now on report `SessionLost` after
    /// producing `frames` frames, to exercise the mid-stream loss path.
    pub fn fail_capture_after(&self, frames: u64) {
        self.session_frame_limit.store(frames, Ordering::Relaxed);
    }
}

impl CameraBackend for SyntheticBackend {
    fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraSession>, CaptureError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(CaptureError::HardwareUnavailable(
                "synthetic backend flagged unavailable".into(),
            ));
        }
        self.sessions_opened.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(SyntheticSession {
            width: settings.width,
            height: settings.height,
            brightness: settings.brightness,
            sequence: 0,
            frame_limit: self.session_frame_limit.load(Ordering::Relaxed),
            produced: Arc::clone(&self.frames_produced),
        }))
    }
}

struct SyntheticSession {
    width: u32,
    height: u32,
    brightness: f32,
    sequence: u64,
    frame_limit: u64,
    produced: Arc<AtomicU64>,
}

impl CameraSession for SyntheticSession {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.frame_limit != 0 && self.sequence >= self.frame_limit {
            return Err(CaptureError::SessionLost(
                "synthetic session frame budget exhausted".into(),
            ));
        }
        self.sequence += 1;
        let phase = (self.sequence % 256) as u32;
        let bias = (self.brightness * 64.0) as i32;

        let mut data = Vec::with_capacity((self.width * self.height * 3) as usize);
        for y in 0..self.height {
            for x in 0..self.width {
                let g = ((x + y + phase) % 256) as i32;
                data.push((g + bias).clamp(0, 255) as u8);
                data.push(((g + 85) % 256) as u8);
                data.push(((g + 170) % 256) as u8);
            }
        }

        self.produced.fetch_add(1, Ordering::Relaxed);
        Ok(Frame::new(
            Bytes::from(data),
            self.sequence,
            self.width,
            self.height,
            PixelFormat::Rgb24,
        ))
    }

    fn apply_controls(&mut self, settings: &CaptureSettings) -> Result<(), CaptureError> {
        self.brightness = settings.brightness;
        Ok(())
    }

    fn set_frame_rate(&mut self, _fps: f64) -> Result<(), CaptureError> {
        // Pacing is the capture loop's job; nothing to configure here.
        Ok(())
    }
}
