//! Output module framework.
//!
//! One [`OutputModule`] per consumer of captured frames. The module owns the
//! shared machinery - bounded queue, rate gate, processing-strategy slot,
//! start/stop lifecycle, worker thread - and delegates what happens to each
//! drained frame to an injected [`FrameSink`].
//!
//! The producer-to-module handoff is always non-blocking: a full queue drops
//! the frame, never stalls capture.

pub mod storage;
pub mod stream;
pub mod timelapse;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::capture::frame::Frame;
use crate::processing::ProcessingStrategy;

/// How long a worker blocks waiting for the next frame before re-checking
/// its running flag.
const QUEUE_WAIT: Duration = Duration::from_secs(1);

/// Bounded wait for a worker to acknowledge shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum OutputError {
    /// Non-positive rates are rejected; the previous rate stays in effect.
    #[error("invalid rate {0}: must be positive")]
    InvalidRate(f64),
}

/// Sink-specific behavior injected into an [`OutputModule`].
///
/// Methods take `&self`; sinks use interior mutability so their state stays
/// queryable from control threads while the worker drives them.
pub trait FrameSink: Send + Sync + 'static {
    /// Called inside `start()`, before the worker exists.
    fn on_start(&self) {}

    /// One processed frame, in acceptance order.
    fn on_frame(&self, frame: Frame, ctx: &SinkContext);

    /// Called inside `stop()`, after the worker has exited.
    fn on_stop(&self) {}
}

/// Module state a sink may need while handling a frame.
pub struct SinkContext {
    /// The module's configured rate at this moment.
    pub module_fps: f64,
}

/// What the camera needs to know about a registered consumer.
pub trait FrameConsumer: Send + Sync {
    fn name(&self) -> &str;
    fn is_running(&self) -> bool;
    /// Rate-gate admission check; admitting has the side effect of
    /// advancing the gate clock.
    fn accepts_frame_now(&self) -> bool;
    /// Non-blocking enqueue; false means the frame was dropped.
    fn offer(&self, frame: Frame) -> bool;
    /// Capture rate this consumer needs right now (0 while stopped).
    fn required_capture_fps(&self) -> f64;
}

/// Frame-rate admission gate.
struct RateGate {
    interval: Duration,
    last_accepted: Option<Instant>,
}

impl RateGate {
    fn new(fps: f64) -> Self {
        Self {
            interval: Duration::from_secs_f64(1.0 / fps),
            last_accepted: None,
        }
    }

    fn admit(&mut self, now: Instant) -> bool {
        let due = match self.last_accepted {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };
        if due {
            self.last_accepted = Some(now);
        }
        due
    }

    fn fps(&self) -> f64 {
        1.0 / self.interval.as_secs_f64()
    }

    fn until_next(&self, now: Instant) -> Duration {
        match self.last_accepted {
            None => Duration::ZERO,
            Some(last) => self.interval.saturating_sub(now.duration_since(last)),
        }
    }

    fn reset(&mut self) {
        self.last_accepted = None;
    }
}

/// Per-module frame counters.
#[derive(Default)]
pub struct ModuleStats {
    accepted: AtomicU64,
    dropped: AtomicU64,
    processed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleStatsSnapshot {
    pub accepted: u64,
    pub dropped: u64,
    pub processed: u64,
}

impl ModuleStats {
    fn snapshot(&self) -> ModuleStatsSnapshot {
        ModuleStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
        }
    }
}

struct Lifecycle {
    worker: Option<JoinHandle<()>>,
    done_rx: Option<flume::Receiver<()>>,
}

/// Rate-limited, queue-backed frame consumer with a pluggable sink.
pub struct OutputModule<S: FrameSink> {
    name: String,
    sink: Arc<S>,
    queue_capacity: usize,
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
    /// Kept outside `lifecycle` so the producer's `offer` never waits on a
    /// stop-in-progress join.
    queue_tx: Mutex<Option<flume::Sender<Frame>>>,
    gate: Arc<Mutex<RateGate>>,
    strategy: Arc<ArcSwap<ProcessingStrategy>>,
    stats: Arc<ModuleStats>,
}

impl<S: FrameSink> OutputModule<S> {
    pub fn new(name: impl Into<String>, sink: S, queue_capacity: usize, fps: f64) -> Self {
        let name = name.into();
        let fps = if fps > 0.0 {
            fps
        } else {
            warn!(module = %name, fps, "invalid initial rate, using 1 fps");
            1.0
        };
        Self {
            name,
            sink: Arc::new(sink),
            queue_capacity,
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle {
                worker: None,
                done_rx: None,
            }),
            queue_tx: Mutex::new(None),
            gate: Arc::new(Mutex::new(RateGate::new(fps))),
            strategy: Arc::new(ArcSwap::from_pointee(ProcessingStrategy::Identity)),
            stats: Arc::new(ModuleStats::default()),
        }
    }

    /// Starts the worker. Idempotent: false if already running.
    pub fn start(&self) -> bool {
        let mut lc = self.lifecycle.lock().unwrap();
        if self.running.load(Ordering::Acquire) {
            return false;
        }

        // Fresh queue each run; anything stale from the last run is gone
        let (tx, rx) = flume::bounded::<Frame>(self.queue_capacity);
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        self.gate.lock().unwrap().reset();
        self.sink.on_start();
        self.running.store(true, Ordering::Release);

        let sink = Arc::clone(&self.sink);
        let running = Arc::clone(&self.running);
        let strategy = Arc::clone(&self.strategy);
        let gate = Arc::clone(&self.gate);
        let stats = Arc::clone(&self.stats);
        let name = self.name.clone();
        let worker = std::thread::Builder::new()
            .name(format!("wellcam-{name}"))
            .spawn(move || {
                worker_loop(rx, sink, running, strategy, gate, stats, &name);
                let _ = done_tx.send(());
            })
            .expect("failed to spawn output worker");

        *self.queue_tx.lock().unwrap() = Some(tx);
        lc.worker = Some(worker);
        lc.done_rx = Some(done_rx);
        info!(module = %self.name, "output module started");
        true
    }

    /// Stops the worker with a bounded join. Idempotent: false if stopped.
    pub fn stop(&self) -> bool {
        let mut lc = self.lifecycle.lock().unwrap();
        if !self.running.load(Ordering::Acquire) {
            return false;
        }
        self.running.store(false, Ordering::Release);

        // Dropping the sender wakes the worker immediately; the running flag
        // makes it skip whatever was still queued.
        *self.queue_tx.lock().unwrap() = None;
        let done_rx = lc.done_rx.take();
        let worker = lc.worker.take();

        let exited = match done_rx {
            Some(rx) => rx.recv_timeout(JOIN_TIMEOUT).is_ok(),
            None => true,
        };
        match worker {
            Some(handle) if exited => {
                let _ = handle.join();
            }
            Some(_) => {
                warn!(module = %self.name, "worker did not exit within {JOIN_TIMEOUT:?}, detaching");
            }
            None => {}
        }

        self.sink.on_stop();
        info!(module = %self.name, "output module stopped");
        true
    }

    /// Sets the module rate in frames per second.
    pub fn set_fps(&self, fps: f64) -> Result<(), OutputError> {
        if !(fps > 0.0) {
            warn!(module = %self.name, fps, "rejecting invalid rate");
            return Err(OutputError::InvalidRate(fps));
        }
        self.gate.lock().unwrap().interval = Duration::from_secs_f64(1.0 / fps);
        info!(module = %self.name, fps, "module rate updated");
        Ok(())
    }

    /// Sets the module rate as an interval in seconds between frames.
    pub fn set_interval(&self, secs: f64) -> Result<(), OutputError> {
        if !(secs > 0.0) {
            warn!(module = %self.name, secs, "rejecting invalid interval");
            return Err(OutputError::InvalidRate(secs));
        }
        self.gate.lock().unwrap().interval = Duration::from_secs_f64(secs);
        info!(module = %self.name, secs, "module interval updated");
        Ok(())
    }

    pub fn fps(&self) -> f64 {
        self.gate.lock().unwrap().fps()
    }

    pub fn interval_secs(&self) -> f64 {
        self.gate.lock().unwrap().interval.as_secs_f64()
    }

    /// Seconds until the gate would admit the next frame.
    pub fn seconds_until_next_accept(&self) -> f64 {
        self.gate
            .lock()
            .unwrap()
            .until_next(Instant::now())
            .as_secs_f64()
    }

    /// Swaps the transform applied to every drained frame.
    pub fn set_strategy(&self, strategy: ProcessingStrategy) {
        info!(module = %self.name, strategy = strategy.name(), "processing strategy set");
        self.strategy.store(Arc::new(strategy));
    }

    pub fn strategy(&self) -> ProcessingStrategy {
        **self.strategy.load()
    }

    pub fn stats(&self) -> ModuleStatsSnapshot {
        self.stats.snapshot()
    }

    /// Sink-specific state (current file, cached frame, session status).
    pub fn sink(&self) -> &Arc<S> {
        &self.sink
    }
}

impl<S: FrameSink> FrameConsumer for OutputModule<S> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn accepts_frame_now(&self) -> bool {
        self.gate.lock().unwrap().admit(Instant::now())
    }

    fn offer(&self, frame: Frame) -> bool {
        if !self.is_running() {
            return false;
        }
        let guard = self.queue_tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        match tx.try_send(frame) {
            Ok(()) => {
                self.stats.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(flume::TrySendError::Full(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(module = %self.name, "queue full, frame dropped");
                false
            }
            Err(flume::TrySendError::Disconnected(_)) => false,
        }
    }

    fn required_capture_fps(&self) -> f64 {
        if self.is_running() {
            self.gate.lock().unwrap().fps()
        } else {
            0.0
        }
    }
}

impl<S: FrameSink> Drop for OutputModule<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop<S: FrameSink>(
    rx: flume::Receiver<Frame>,
    sink: Arc<S>,
    running: Arc<AtomicBool>,
    strategy: Arc<ArcSwap<ProcessingStrategy>>,
    gate: Arc<Mutex<RateGate>>,
    stats: Arc<ModuleStats>,
    name: &str,
) {
    debug!(module = %name, "worker running");
    loop {
        match rx.recv_timeout(QUEUE_WAIT) {
            Ok(frame) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
                let processed = strategy.load().process(&frame);
                let ctx = SinkContext {
                    module_fps: gate.lock().unwrap().fps(),
                };
                sink.on_frame(processed, &ctx);
                stats.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(flume::RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(module = %name, "worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::capture::frame::PixelFormat;

    /// Sink that records how many frames reached it.
    #[derive(Default)]
    struct CountingSink {
        frames: AtomicU64,
        stops: AtomicU64,
    }

    impl FrameSink for CountingSink {
        fn on_frame(&self, _frame: Frame, _ctx: &SinkContext) {
            self.frames.fetch_add(1, Ordering::Relaxed);
        }

        fn on_stop(&self) {
            self.stops.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn test_frame(seq: u64) -> Frame {
        Frame::new(Bytes::from(vec![0u8; 12]), seq, 2, 2, PixelFormat::Rgb24)
    }

    fn wait_for(pred: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !pred() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn start_stop_idempotence() {
        let module = OutputModule::new("test", CountingSink::default(), 4, 10.0);
        assert!(module.start());
        assert!(!module.start());
        assert!(module.stop());
        assert!(!module.stop());
        assert_eq!(module.sink().stops.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn stopped_module_accepts_nothing() {
        let module = OutputModule::new("test", CountingSink::default(), 4, 10.0);
        assert!(!module.offer(test_frame(1)));
        assert_eq!(module.stats().accepted, 0);
        assert_eq!(module.required_capture_fps(), 0.0);
    }

    #[test]
    fn frames_flow_to_sink_while_running() {
        let module = OutputModule::new("test", CountingSink::default(), 8, 100.0);
        module.start();
        for seq in 0..5 {
            assert!(module.offer(test_frame(seq)));
        }
        wait_for(|| module.sink().frames.load(Ordering::Relaxed) == 5);
        module.stop();
        assert_eq!(module.stats().accepted, 5);
        assert_eq!(module.stats().processed, 5);
    }

    #[test]
    fn full_queue_drops_without_blocking() {
        // Sink that never returns keeps the queue from draining
        struct StuckSink(Arc<AtomicBool>);
        impl FrameSink for StuckSink {
            fn on_frame(&self, _frame: Frame, _ctx: &SinkContext) {
                while self.0.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }

        let stuck = Arc::new(AtomicBool::new(true));
        let module = OutputModule::new("test", StuckSink(Arc::clone(&stuck)), 2, 100.0);
        module.start();

        // One frame wedged in the sink, two fill the queue, the rest drop
        for seq in 0..6 {
            module.offer(test_frame(seq));
            std::thread::sleep(Duration::from_millis(10));
        }
        let stats = module.stats();
        assert!(stats.dropped >= 1, "expected drops, got {stats:?}");
        assert!(stats.accepted <= 4);

        stuck.store(false, Ordering::Release);
        module.stop();
    }

    #[test]
    fn invalid_rate_keeps_previous_value() {
        let module = OutputModule::new("test", CountingSink::default(), 4, 10.0);
        assert!(matches!(
            module.set_fps(0.0),
            Err(OutputError::InvalidRate(_))
        ));
        assert!(matches!(
            module.set_interval(-1.0),
            Err(OutputError::InvalidRate(_))
        ));
        assert!((module.fps() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn fps_and_interval_are_mutually_derived() {
        let module = OutputModule::new("test", CountingSink::default(), 4, 10.0);
        module.set_interval(0.2).unwrap();
        assert!((module.fps() - 5.0).abs() < 1e-9);
        module.set_fps(4.0).unwrap();
        assert!((module.interval_secs() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn rate_gate_admits_at_configured_pace() {
        // 5 fps gate fed at ~30 fps for one second accepts about 5 frames
        let module = OutputModule::new("test", CountingSink::default(), 32, 5.0);
        module.start();
        let mut admitted = 0;
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(1) {
            if module.accepts_frame_now() {
                admitted += 1;
                module.offer(test_frame(admitted));
            }
            std::thread::sleep(Duration::from_millis(33));
        }
        module.stop();
        assert!(
            (4..=6).contains(&admitted),
            "expected ~5 admissions, got {admitted}"
        );
    }

    #[test]
    fn gate_resets_on_start() {
        let module = OutputModule::new("test", CountingSink::default(), 4, 0.5);
        module.start();
        assert!(module.accepts_frame_now());
        assert!(!module.accepts_frame_now());
        module.stop();
        // A 2s interval gate would still be closed; the restart reopens it
        module.start();
        assert!(module.accepts_frame_now());
        module.stop();
    }

    #[test]
    fn required_fps_tracks_running_state() {
        let module = OutputModule::new("test", CountingSink::default(), 4, 12.5);
        assert_eq!(module.required_capture_fps(), 0.0);
        module.start();
        assert!((module.required_capture_fps() - 12.5).abs() < 1e-9);
        module.stop();
        assert_eq!(module.required_capture_fps(), 0.0);
    }

    #[test]
    fn strategy_applies_to_drained_frames() {
        struct CaptureSink(Mutex<Vec<Frame>>);
        impl FrameSink for CaptureSink {
            fn on_frame(&self, frame: Frame, _ctx: &SinkContext) {
                self.0.lock().unwrap().push(frame);
            }
        }

        let module = OutputModule::new("test", CaptureSink(Mutex::new(Vec::new())), 4, 100.0);
        module.set_strategy(ProcessingStrategy::Invert);
        module.start();
        module.offer(Frame::new(
            Bytes::from(vec![0u8; 12]),
            1,
            2,
            2,
            PixelFormat::Rgb24,
        ));
        wait_for(|| !module.sink().0.lock().unwrap().is_empty());
        module.stop();
        let seen = module.sink().0.lock().unwrap();
        assert!(seen[0].data.iter().all(|&b| b == 255));
    }
}
