pub mod capture;
pub mod negotiator;
pub mod outputs;
pub mod processing;
pub mod video;

use serde::{Deserialize, Serialize};

pub use capture::{Camera, CaptureError, Frame, PixelFormat, SyntheticBackend};
pub use outputs::{
    storage::StorageSink,
    stream::{StreamCursor, StreamSink},
    timelapse::TimelapseSink,
    FrameConsumer, FrameSink, OutputError, OutputModule,
};
pub use processing::ProcessingStrategy;

/// System configuration. Owned by the control layer; components receive
/// snapshots, never a shared mutable global.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureSettings,
    pub stream: StreamConfig,
    pub storage: StorageConfig,
    pub timelapse: TimelapseConfig,
}

/// Camera settings. Resolution changes require a session restart; the other
/// fields can be applied to a running session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    /// Range: -1.0 to 1.0
    pub brightness: f32,
    /// Range: 0.0 to 4.0
    pub contrast: f32,
    /// Range: 0.0 to 4.0
    pub saturation: f32,
    /// In microseconds, 0 for auto
    pub exposure_us: u32,
    /// Capture rate when no output module demands one
    pub idle_fps: f64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            brightness: 0.0,
            contrast: 1.0,
            saturation: 1.0,
            exposure_us: 0,
            idle_fps: 1.0 / 20.0, // one frame every 20s when idle
        }
    }
}

/// Partial camera settings update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct SettingsUpdate {
    pub resolution: Option<(u32, u32)>,
    pub brightness: Option<f32>,
    pub contrast: Option<f32>,
    pub saturation: Option<f32>,
    pub exposure_us: Option<u32>,
}

impl SettingsUpdate {
    /// Folds this update into a settings snapshot, reporting whether anything
    /// changed and whether the change forces a session restart.
    pub fn apply_to(&self, settings: &mut CaptureSettings) -> (bool, bool) {
        let mut changed = false;
        let mut restart = false;

        if let Some((w, h)) = self.resolution {
            if w > 0 && h > 0 && (w, h) != (settings.width, settings.height) {
                settings.width = w;
                settings.height = h;
                changed = true;
                restart = true;
            }
        }
        if let Some(b) = self.brightness {
            if b != settings.brightness {
                settings.brightness = b;
                changed = true;
            }
        }
        if let Some(c) = self.contrast {
            if c != settings.contrast {
                settings.contrast = c;
                changed = true;
            }
        }
        if let Some(s) = self.saturation {
            if s != settings.saturation {
                settings.saturation = s;
                changed = true;
            }
        }
        if let Some(e) = self.exposure_us {
            if e != settings.exposure_us {
                settings.exposure_us = e;
                changed = true;
            }
        }

        (changed, restart)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub fps: f64,
    pub jpeg_quality: u8,
    pub queue_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: 10.0,
            jpeg_quality: 90,
            queue_capacity: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub fps: f64,
    pub output_dir: std::path::PathBuf,
    pub queue_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            fps: 1.0,
            output_dir: "recordings".into(),
            queue_capacity: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelapseConfig {
    /// Seconds between collected frames
    pub interval_secs: f64,
    /// Session length before assembly triggers; 0 disables the timer
    pub duration_secs: f64,
    /// Minimum collected frames for an artifact to be produced
    pub min_frames: usize,
    pub output_dir: std::path::PathBuf,
    /// Playback rate of the assembled video
    pub output_fps: f64,
    pub queue_capacity: usize,
}

impl Default for TimelapseConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5.0,
            duration_secs: 300.0,
            min_frames: 10,
            output_dir: "timelapses".into(),
            output_fps: 25.0,
            queue_capacity: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_expected_profile() {
        let config = Config::default();
        assert_eq!(config.capture.width, 1920);
        assert_eq!(config.capture.height, 1080);
        assert!(config.capture.idle_fps > 0.0);
        assert_eq!(config.stream.fps, 10.0);
        assert_eq!(config.storage.fps, 1.0);
        assert_eq!(config.timelapse.min_frames, 10);
    }

    #[test]
    fn partial_update_resolution_forces_restart() {
        let mut settings = CaptureSettings::default();
        let update = SettingsUpdate {
            resolution: Some((640, 480)),
            ..Default::default()
        };
        let (changed, restart) = update.apply_to(&mut settings);
        assert!(changed);
        assert!(restart);
        assert_eq!((settings.width, settings.height), (640, 480));
    }

    #[test]
    fn control_only_update_does_not_restart() {
        let mut settings = CaptureSettings::default();
        let update = SettingsUpdate {
            brightness: Some(0.5),
            contrast: Some(2.0),
            ..Default::default()
        };
        let (changed, restart) = update.apply_to(&mut settings);
        assert!(changed);
        assert!(!restart);
        assert_eq!(settings.brightness, 0.5);
    }

    #[test]
    fn same_resolution_is_a_noop() {
        let mut settings = CaptureSettings::default();
        let update = SettingsUpdate {
            resolution: Some((settings.width, settings.height)),
            ..Default::default()
        };
        let (changed, restart) = update.apply_to(&mut settings);
        assert!(!changed);
        assert!(!restart);
    }

    #[test]
    fn zero_resolution_is_rejected() {
        let mut settings = CaptureSettings::default();
        let update = SettingsUpdate {
            resolution: Some((0, 480)),
            ..Default::default()
        };
        let (changed, restart) = update.apply_to(&mut settings);
        assert!(!changed);
        assert!(!restart);
        assert_eq!(settings.width, 1920);
    }
}
