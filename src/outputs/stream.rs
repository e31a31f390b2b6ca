//! Live-view sink.
//!
//! Keeps only the most recent frame, JPEG-encoded, in a lock-free slot. Any
//! number of viewers pull from the slot through a [`StreamCursor`] at the
//! module rate; a slow viewer skips frames instead of building a backlog.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tracing::warn;

use super::{FrameConsumer, FrameSink, OutputModule, SinkContext};
use crate::capture::frame::Frame;
use crate::video::encode_jpeg;

/// How many frame arrivals the delivered-rate estimate looks back over.
const RATE_WINDOW: usize = 30;

/// Sleep slice while a cursor waits, so stop is noticed promptly.
const CURSOR_POLL: Duration = Duration::from_millis(50);

pub struct StreamSink {
    jpeg_quality: u8,
    latest: ArcSwapOption<Bytes>,
    /// Arrival times of recent frames, for the delivered-rate estimate
    arrivals: Mutex<VecDeque<Instant>>,
}

impl StreamSink {
    pub fn new(jpeg_quality: u8) -> Self {
        Self {
            jpeg_quality,
            latest: ArcSwapOption::empty(),
            arrivals: Mutex::new(VecDeque::with_capacity(RATE_WINDOW)),
        }
    }

    /// The most recent JPEG, if any frame has arrived this run.
    pub fn latest_jpeg(&self) -> Option<Bytes> {
        self.latest.load_full().map(|arc| (*arc).clone())
    }

    /// Measured delivery rate over the recent window, in frames per second.
    /// Zero until at least two frames have arrived.
    pub fn delivered_fps(&self) -> f64 {
        let arrivals = self.arrivals.lock().unwrap();
        match (arrivals.front(), arrivals.back()) {
            (Some(first), Some(last)) if arrivals.len() >= 2 => {
                let span = last.duration_since(*first).as_secs_f64();
                if span > 0.0 {
                    (arrivals.len() - 1) as f64 / span
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }
}

impl FrameSink for StreamSink {
    fn on_start(&self) {
        // A viewer connecting to a fresh run should not see last run's image
        self.latest.store(None);
        self.arrivals.lock().unwrap().clear();
    }

    fn on_frame(&self, frame: Frame, _ctx: &SinkContext) {
        let jpeg = match encode_jpeg(&frame, self.jpeg_quality) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                warn!("stream frame not encodable, skipping: {e}");
                return;
            }
        };
        self.latest.store(Some(Arc::new(jpeg)));

        let mut arrivals = self.arrivals.lock().unwrap();
        if arrivals.len() == RATE_WINDOW {
            arrivals.pop_front();
        }
        arrivals.push_back(Instant::now());
    }
}

/// One viewer's pull handle over a stream module.
///
/// Paces itself from the module interval, so every viewer gets frames at the
/// module rate regardless of how fast the camera runs.
pub struct StreamCursor {
    module: Arc<OutputModule<StreamSink>>,
    next_due: Option<Instant>,
}

impl StreamCursor {
    pub fn new(module: Arc<OutputModule<StreamSink>>) -> Self {
        Self {
            module,
            next_due: None,
        }
    }

    /// Blocks until the next frame is due and returns the current JPEG.
    /// `None` once the module stops; the first call waits for the first
    /// frame of the run to exist.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        if let Some(due) = self.next_due {
            while Instant::now() < due {
                if !self.module.is_running() {
                    return None;
                }
                let remaining = due.saturating_duration_since(Instant::now());
                std::thread::sleep(remaining.min(CURSOR_POLL));
            }
        }

        loop {
            if !self.module.is_running() {
                return None;
            }
            if let Some(jpeg) = self.module.sink().latest_jpeg() {
                let interval = Duration::from_secs_f64(self.module.interval_secs());
                self.next_due = Some(Instant::now() + interval);
                return Some(jpeg);
            }
            std::thread::sleep(CURSOR_POLL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::frame::PixelFormat;

    fn rgb_frame(seq: u64) -> Frame {
        Frame::new(
            Bytes::from(vec![100u8; 4 * 4 * 3]),
            seq,
            4,
            4,
            PixelFormat::Rgb24,
        )
    }

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pred() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn latest_jpeg_tracks_newest_frame() {
        let sink = StreamSink::new(85);
        assert!(sink.latest_jpeg().is_none());
        let ctx = SinkContext { module_fps: 10.0 };
        sink.on_frame(rgb_frame(1), &ctx);
        let first = sink.latest_jpeg().unwrap();
        assert_eq!(&first[..2], &[0xFF, 0xD8], "not a JPEG");

        sink.on_frame(rgb_frame(2), &ctx);
        assert!(sink.latest_jpeg().is_some());
    }

    #[test]
    fn restart_clears_stale_image() {
        let sink = StreamSink::new(85);
        sink.on_frame(rgb_frame(1), &SinkContext { module_fps: 10.0 });
        assert!(sink.latest_jpeg().is_some());
        sink.on_start();
        assert!(sink.latest_jpeg().is_none());
        assert_eq!(sink.delivered_fps(), 0.0);
    }

    #[test]
    fn mjpeg_input_passes_straight_to_cache() {
        let sink = StreamSink::new(85);
        let jpeg = Bytes::from(vec![0xFFu8, 0xD8, 0xFF, 0xD9]);
        let frame = Frame::new(jpeg.clone(), 1, 4, 4, PixelFormat::Mjpeg);
        sink.on_frame(frame, &SinkContext { module_fps: 10.0 });
        assert_eq!(sink.latest_jpeg().unwrap(), jpeg);
    }

    #[test]
    fn cursor_delivers_then_ends_on_stop() {
        let module = Arc::new(OutputModule::new("stream", StreamSink::new(85), 16, 50.0));
        module.start();
        for seq in 0..3 {
            module.offer(rgb_frame(seq));
        }
        wait_for(|| module.sink().latest_jpeg().is_some());

        let mut cursor = StreamCursor::new(Arc::clone(&module));
        let frame = cursor.next_frame();
        assert!(frame.is_some());

        module.stop();
        assert!(cursor.next_frame().is_none());
    }

    #[test]
    fn delivered_fps_reflects_arrival_spacing() {
        let sink = StreamSink::new(85);
        let ctx = SinkContext { module_fps: 10.0 };
        for seq in 0..5 {
            sink.on_frame(rgb_frame(seq), &ctx);
            std::thread::sleep(Duration::from_millis(20));
        }
        let fps = sink.delivered_fps();
        assert!(fps > 10.0 && fps < 200.0, "implausible rate {fps}");
    }
}
