//! Recording sink.
//!
//! Writes every drained frame into one video artifact per run. The artifact
//! is opened lazily on the first frame, so its dimensions come from the
//! frames actually captured and a run that never sees a frame leaves no file
//! behind. The playback rate is fixed at open time from the module rate, so
//! a recording at 1 fps plays back in real time.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Local;
use tracing::{info, warn};

use super::{FrameSink, SinkContext};
use crate::capture::frame::Frame;
use crate::video::{MjpegAviWriter, VideoEncoder, VideoError};

const RECORD_JPEG_QUALITY: u8 = 90;

pub struct StorageSink {
    output_dir: PathBuf,
    /// Optional filename prefix, e.g. an experiment name
    label: Mutex<Option<String>>,
    encoder: Mutex<Option<Box<dyn VideoEncoder>>>,
    last_artifact: Mutex<Option<PathBuf>>,
}

impl StorageSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            label: Mutex::new(None),
            encoder: Mutex::new(None),
            last_artifact: Mutex::new(None),
        }
    }

    /// Filename prefix for subsequent artifacts. Takes effect at the next
    /// artifact open, not mid-file.
    pub fn set_label(&self, label: Option<String>) {
        *self.label.lock().unwrap() = label;
    }

    /// Path of the artifact currently being written, if one is open.
    pub fn current_file(&self) -> Option<PathBuf> {
        self.encoder
            .lock()
            .unwrap()
            .as_ref()
            .map(|enc| enc.path().to_path_buf())
    }

    /// Path of the most recently finalized artifact.
    pub fn last_artifact(&self) -> Option<PathBuf> {
        self.last_artifact.lock().unwrap().clone()
    }

    pub fn frames_written(&self) -> u64 {
        self.encoder
            .lock()
            .unwrap()
            .as_ref()
            .map(|enc| enc.frames_written())
            .unwrap_or(0)
    }

    fn open_encoder(&self, frame: &Frame, fps: f64) -> Result<Box<dyn VideoEncoder>, VideoError> {
        fs::create_dir_all(&self.output_dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let name = match self.label.lock().unwrap().as_deref() {
            Some(label) => format!("{label}_video_{stamp}.avi"),
            None => format!("video_{stamp}.avi"),
        };
        let path = self.output_dir.join(name);
        let writer = MjpegAviWriter::create(
            &path,
            frame.width(),
            frame.height(),
            fps,
            RECORD_JPEG_QUALITY,
        )?;
        info!(path = %path.display(), fps, "recording started");
        Ok(Box::new(writer))
    }
}

impl FrameSink for StorageSink {
    fn on_frame(&self, frame: Frame, ctx: &SinkContext) {
        let mut slot = self.encoder.lock().unwrap();
        if slot.is_none() {
            match self.open_encoder(&frame, ctx.module_fps) {
                Ok(encoder) => *slot = Some(encoder),
                Err(e) => {
                    // Dropped; the next frame retries the open
                    warn!("could not open recording artifact: {e}");
                    return;
                }
            }
        }
        let encoder = slot.as_mut().unwrap();
        if let Err(e) = encoder.write_frame(&frame) {
            warn!(path = %encoder.path().display(), "frame not recorded: {e}");
        }
    }

    fn on_stop(&self) {
        let Some(mut encoder) = self.encoder.lock().unwrap().take() else {
            return;
        };
        let path = encoder.path().to_path_buf();
        match encoder.finish() {
            Ok(()) => {
                info!(
                    path = %path.display(),
                    frames = encoder.frames_written(),
                    "recording finalized"
                );
                *self.last_artifact.lock().unwrap() = Some(path);
            }
            Err(e) => {
                warn!(path = %path.display(), "recording not finalized, removing: {e}");
                let _ = fs::remove_file(&path);
            }
        }
    }
}
