//! Timelapse sink.
//!
//! Collects widely spaced frames in memory over a session and assembles them
//! into a short video played back at normal speed. Assembly happens when the
//! configured session duration elapses (the session then re-arms and keeps
//! collecting) and again on stop. Sessions that collected fewer than the
//! minimum frame count are discarded without producing a file.

use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use chrono::Local;
use tracing::{debug, info, warn};

use super::{FrameSink, OutputModule, SinkContext};
use crate::capture::frame::Frame;
use crate::video::{MjpegAviWriter, VideoEncoder, VideoError};

const TIMELAPSE_JPEG_QUALITY: u8 = 90;

/// One collection session's in-memory state.
#[derive(Default)]
struct Session {
    frames: Vec<Frame>,
    started_at: Option<Instant>,
}

pub struct TimelapseSink {
    output_dir: PathBuf,
    /// Session length before assembly triggers; 0 disables the timer
    duration_secs: f64,
    min_frames: usize,
    /// Playback rate of the assembled video
    output_fps: f64,
    session: Mutex<Session>,
    last_artifact: Mutex<Option<PathBuf>>,
}

/// Point-in-time view of the collection session.
#[derive(Debug, Clone, PartialEq)]
pub struct TimelapseStatus {
    pub collected: usize,
    pub elapsed_secs: f64,
    /// Seconds until the duration timer assembles; `None` when disabled
    pub assembly_in_secs: Option<f64>,
}

impl TimelapseSink {
    pub fn new(
        output_dir: impl Into<PathBuf>,
        duration_secs: f64,
        min_frames: usize,
        output_fps: f64,
    ) -> Self {
        Self {
            output_dir: output_dir.into(),
            duration_secs,
            min_frames,
            output_fps: output_fps.max(1.0),
            session: Mutex::new(Session::default()),
            last_artifact: Mutex::new(None),
        }
    }

    pub fn status(&self) -> TimelapseStatus {
        let session = self.session.lock().unwrap();
        let elapsed = session
            .started_at
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        TimelapseStatus {
            collected: session.frames.len(),
            elapsed_secs: elapsed,
            assembly_in_secs: (self.duration_secs > 0.0)
                .then(|| (self.duration_secs - elapsed).max(0.0)),
        }
    }

    pub fn last_artifact(&self) -> Option<PathBuf> {
        self.last_artifact.lock().unwrap().clone()
    }

    /// Closes out a session: assembles if it collected enough frames, then
    /// re-arms for the next one.
    fn finish_session(&self, session: &mut Session) {
        let frames = std::mem::take(&mut session.frames);
        session.started_at = None;

        // Guards min_frames of 0: an empty session never assembles
        if frames.is_empty() {
            return;
        }
        if frames.len() < self.min_frames {
            debug!(
                collected = frames.len(),
                min = self.min_frames,
                "timelapse session too short, discarding"
            );
            return;
        }
        match self.assemble(frames) {
            Ok(path) => {
                *self.last_artifact.lock().unwrap() = Some(path);
            }
            Err(e) => warn!("timelapse not assembled: {e}"),
        }
    }

    fn assemble(&self, mut frames: Vec<Frame>) -> Result<PathBuf, VideoError> {
        // Queue order is acceptance order already; the sort is the stated
        // guarantee that the artifact is chronological
        frames.sort_by_key(|f| f.meta.sequence);

        fs::create_dir_all(&self.output_dir)?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = self.output_dir.join(format!("timelapse_{stamp}.avi"));

        let first = &frames[0];
        let mut writer = MjpegAviWriter::create(
            &path,
            first.width(),
            first.height(),
            self.output_fps,
            TIMELAPSE_JPEG_QUALITY,
        )?;
        let result = frames
            .iter()
            .try_for_each(|frame| writer.write_frame(frame))
            .and_then(|()| writer.finish());
        if let Err(e) = result {
            drop(writer);
            let _ = fs::remove_file(&path);
            return Err(e);
        }

        info!(
            path = %path.display(),
            frames = frames.len(),
            fps = self.output_fps,
            "timelapse assembled"
        );
        Ok(path)
    }
}

impl FrameSink for TimelapseSink {
    fn on_start(&self) {
        let mut session = self.session.lock().unwrap();
        session.frames.clear();
        session.started_at = Some(Instant::now());
    }

    fn on_frame(&self, frame: Frame, _ctx: &SinkContext) {
        let mut session = self.session.lock().unwrap();
        session.frames.push(frame);

        let expired = self.duration_secs > 0.0
            && session
                .started_at
                .is_some_and(|at| at.elapsed().as_secs_f64() >= self.duration_secs);
        if expired {
            self.finish_session(&mut session);
            session.started_at = Some(Instant::now());
        }
    }

    fn on_stop(&self) {
        self.finish_session(&mut self.session.lock().unwrap());
    }
}

impl OutputModule<TimelapseSink> {
    /// Session status plus the gate's view of the next collection slot.
    pub fn timelapse_status(&self) -> (TimelapseStatus, f64) {
        (self.sink().status(), self.seconds_until_next_accept())
    }
}
