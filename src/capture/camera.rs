//! The frame source: owns the hardware session and the single capture
//! thread, and distributes captured frames to registered output modules.
//!
//! The capture thread never blocks on a consumer. Each tick it sleeps the
//! remainder of the rate-derived interval, captures one frame, and offers a
//! clone to every registered module whose own gate admits one. Control
//! operations reach the thread over a command channel, so rate and control
//! changes apply to the live session without a restart; only a resolution
//! change tears the session down.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::backend::{CameraBackend, CameraSession, CaptureError};
use super::frame::Frame;
use crate::negotiator::negotiated_fps;
use crate::outputs::FrameConsumer;
use crate::{CaptureSettings, SettingsUpdate};

/// Floor applied when a caller asks for a non-positive capture rate.
/// Clamped rather than rejected so the loop can never stall.
const MIN_CAPTURE_FPS: f64 = 1.0;

/// Bounded wait for the capture thread to acknowledge shutdown.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Cap on a single rate sleep, so very low rates still notice commands.
const MAX_RATE_SLEEP: Duration = Duration::from_secs(1);

/// Pause after a transient capture failure before retrying.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(100);

/// Bounded wait for a snapshot reply from the loop. Must exceed
/// `MAX_RATE_SLEEP`, since that is how long a command can sit unseen.
const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(3);

enum Command {
    Stop,
    SetRate(f64),
    ApplyControls(CaptureSettings),
    Snapshot(flume::Sender<Result<Frame, CaptureError>>),
}

struct Lifecycle {
    thread: Option<JoinHandle<()>>,
    cmd_tx: Option<flume::Sender<Command>>,
    done_rx: Option<flume::Receiver<()>>,
}

pub struct Camera {
    backend: Arc<dyn CameraBackend>,
    settings: Mutex<CaptureSettings>,
    consumers: Arc<Mutex<Vec<Arc<dyn FrameConsumer>>>>,
    /// f64 bits of the current target rate; read by the loop every tick
    target_fps_bits: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    lifecycle: Mutex<Lifecycle>,
}

impl Camera {
    pub fn new(backend: Arc<dyn CameraBackend>, settings: CaptureSettings) -> Self {
        let idle = settings.idle_fps.max(f64::MIN_POSITIVE);
        Self {
            backend,
            settings: Mutex::new(settings),
            consumers: Arc::new(Mutex::new(Vec::new())),
            target_fps_bits: Arc::new(AtomicU64::new(idle.to_bits())),
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(Lifecycle {
                thread: None,
                cmd_tx: None,
                done_rx: None,
            }),
        }
    }

    /// Opens the hardware session and launches the capture thread.
    /// `Ok(false)` if already running.
    pub fn start(&self) -> Result<bool, CaptureError> {
        let mut lc = self.lifecycle.lock().unwrap();
        if self.running.load(Ordering::Acquire) {
            return Ok(false);
        }

        let settings = self.settings.lock().unwrap().clone();
        let mut session = self.backend.open(&settings)?;
        if let Err(e) = session.apply_controls(&settings) {
            warn!("initial controls not applied: {e}");
        }
        let fps = self.target_fps();
        if let Err(e) = session.set_frame_rate(fps) {
            warn!("initial frame rate not applied: {e}");
        }

        let (cmd_tx, cmd_rx) = flume::unbounded::<Command>();
        let (done_tx, done_rx) = flume::bounded::<()>(1);
        self.running.store(true, Ordering::Release);

        let running = Arc::clone(&self.running);
        let target = Arc::clone(&self.target_fps_bits);
        let consumers = Arc::clone(&self.consumers);
        let thread = std::thread::Builder::new()
            .name("wellcam-capture".into())
            .spawn(move || {
                capture_loop(session, cmd_rx, running, target, consumers);
                let _ = done_tx.send(());
            })
            .expect("failed to spawn capture thread");

        lc.thread = Some(thread);
        lc.cmd_tx = Some(cmd_tx);
        lc.done_rx = Some(done_rx);
        info!(
            width = settings.width,
            height = settings.height,
            fps,
            "camera started"
        );
        Ok(true)
    }

    /// Stops the capture thread and releases the session. False if the
    /// camera was not running; thread state left behind by a session-lost
    /// self-stop is still reclaimed.
    pub fn stop(&self) -> bool {
        let mut lc = self.lifecycle.lock().unwrap();
        let was_running = self.running.swap(false, Ordering::AcqRel);

        if let Some(tx) = lc.cmd_tx.take() {
            let _ = tx.send(Command::Stop);
        }
        let exited = match lc.done_rx.take() {
            Some(rx) => rx.recv_timeout(JOIN_TIMEOUT).is_ok(),
            None => true,
        };
        match lc.thread.take() {
            Some(handle) if exited => {
                let _ = handle.join();
            }
            Some(_) => warn!("capture thread did not exit within {JOIN_TIMEOUT:?}, detaching"),
            None => {}
        }
        if was_running {
            info!("camera stopped");
        }
        was_running
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Applies a partial settings update. A resolution change restarts the
    /// session (brief capture gap); everything else is applied live.
    pub fn update_settings(&self, update: SettingsUpdate) -> Result<bool, CaptureError> {
        let (changed, restart, snapshot) = {
            let mut settings = self.settings.lock().unwrap();
            let (changed, restart) = update.apply_to(&mut settings);
            (changed, restart, settings.clone())
        };

        if restart && self.is_running() {
            info!(
                width = snapshot.width,
                height = snapshot.height,
                "resolution changed, restarting camera"
            );
            self.stop();
            self.start()?;
            return Ok(true);
        }

        if changed && self.is_running() {
            debug!("applying camera controls to live session");
            self.send(Command::ApplyControls(snapshot));
        }
        Ok(changed)
    }

    /// Updates the target capture rate. Non-positive input is clamped to a
    /// safe minimum rather than rejected, so the loop never stalls.
    pub fn update_capture_rate(&self, fps: f64) {
        let fps = if fps > 0.0 {
            fps
        } else {
            warn!(fps, "invalid capture rate, clamping to {MIN_CAPTURE_FPS}");
            MIN_CAPTURE_FPS
        };
        let previous = self.target_fps();
        self.target_fps_bits.store(fps.to_bits(), Ordering::Relaxed);
        if (previous - fps).abs() > f64::EPSILON && self.is_running() {
            info!(from = previous, to = fps, "capture rate updated");
            self.send(Command::SetRate(fps));
        }
    }

    /// Recomputes the negotiated rate from registered consumers and pushes
    /// it into the capture loop. Call after every module start/stop.
    pub fn refresh_capture_rate(&self) -> f64 {
        let demands: Vec<f64> = self
            .consumers
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.required_capture_fps())
            .collect();
        let idle = self.settings.lock().unwrap().idle_fps;
        let fps = negotiated_fps(demands, idle);
        self.update_capture_rate(fps);
        fps
    }

    /// Captures a single frame outside the distribution path, e.g. for a
    /// still artifact. While the camera runs the frame comes from the live
    /// session, between paced captures; otherwise a one-shot session is
    /// opened and torn down.
    pub fn capture_still(&self) -> Result<Frame, CaptureError> {
        if self.is_running() {
            let (reply_tx, reply_rx) = flume::bounded(1);
            self.send(Command::Snapshot(reply_tx));
            return reply_rx
                .recv_timeout(SNAPSHOT_TIMEOUT)
                .map_err(|_| CaptureError::Transient("capture thread not responding".into()))?;
        }

        let settings = self.settings.lock().unwrap().clone();
        let mut session = self.backend.open(&settings)?;
        session.capture()
    }

    pub fn target_fps(&self) -> f64 {
        f64::from_bits(self.target_fps_bits.load(Ordering::Relaxed))
    }

    pub fn settings(&self) -> CaptureSettings {
        self.settings.lock().unwrap().clone()
    }

    /// Registers a consumer. False if already registered.
    pub fn add_consumer(&self, consumer: Arc<dyn FrameConsumer>) -> bool {
        let mut consumers = self.consumers.lock().unwrap();
        if consumers.iter().any(|c| Arc::ptr_eq(c, &consumer)) {
            return false;
        }
        debug!(module = consumer.name(), "consumer registered");
        consumers.push(consumer);
        true
    }

    /// Unregisters a consumer. False if it was not registered.
    pub fn remove_consumer(&self, consumer: &Arc<dyn FrameConsumer>) -> bool {
        let mut consumers = self.consumers.lock().unwrap();
        let before = consumers.len();
        consumers.retain(|c| !Arc::ptr_eq(c, consumer));
        before != consumers.len()
    }

    fn send(&self, command: Command) {
        let lc = self.lifecycle.lock().unwrap();
        if let Some(tx) = lc.cmd_tx.as_ref() {
            let _ = tx.send(command);
        }
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut session: Box<dyn CameraSession>,
    cmd_rx: flume::Receiver<Command>,
    running: Arc<AtomicBool>,
    target_fps_bits: Arc<AtomicU64>,
    consumers: Arc<Mutex<Vec<Arc<dyn FrameConsumer>>>>,
) {
    debug!("capture loop running");
    let mut last_frame: Option<Instant> = None;

    'outer: while running.load(Ordering::Acquire) {
        let fps = f64::from_bits(target_fps_bits.load(Ordering::Relaxed)).max(f64::MIN_POSITIVE);
        let interval = Duration::from_secs_f64(1.0 / fps);

        // Sleep out the remainder of the interval. The command channel is
        // the sleeper, so stop and setting changes wake us immediately.
        loop {
            let remaining = match last_frame {
                None => Duration::ZERO,
                Some(at) => interval.saturating_sub(at.elapsed()),
            };
            if remaining.is_zero() {
                break;
            }
            match cmd_rx.recv_timeout(remaining.min(MAX_RATE_SLEEP)) {
                Ok(Command::Stop) | Err(flume::RecvTimeoutError::Disconnected) => break 'outer,
                Ok(Command::SetRate(fps)) => {
                    if let Err(e) = session.set_frame_rate(fps) {
                        warn!("frame rate not applied to session: {e}");
                    }
                    continue 'outer; // re-derive the interval
                }
                Ok(Command::ApplyControls(settings)) => {
                    if let Err(e) = session.apply_controls(&settings) {
                        warn!("controls not applied to session: {e}");
                    }
                }
                Ok(Command::Snapshot(reply)) => {
                    let _ = reply.send(session.capture());
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
            }
        }

        match session.capture() {
            Ok(frame) => {
                last_frame = Some(Instant::now());
                let targets: Vec<_> = consumers.lock().unwrap().clone();
                for consumer in targets {
                    if consumer.is_running() && consumer.accepts_frame_now() {
                        if !consumer.offer(frame.clone()) {
                            debug!(module = consumer.name(), "consumer refused frame");
                        }
                    }
                }
            }
            Err(CaptureError::SessionLost(msg)) => {
                error!("capture session lost, stopping: {msg}");
                break;
            }
            Err(e) => {
                warn!("capture failed, retrying: {e}");
                match cmd_rx.recv_timeout(TRANSIENT_BACKOFF) {
                    Ok(Command::Stop) | Err(flume::RecvTimeoutError::Disconnected) => break,
                    _ => {}
                }
            }
        }
    }

    running.store(false, Ordering::Release);
    debug!("capture loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::SyntheticBackend;
    use crate::outputs::{FrameSink, OutputModule, SinkContext};
    use crate::Frame;

    #[derive(Default)]
    struct NullSink;
    impl FrameSink for NullSink {
        fn on_frame(&self, _frame: Frame, _ctx: &SinkContext) {}
    }

    fn fast_settings() -> CaptureSettings {
        CaptureSettings {
            width: 16,
            height: 16,
            idle_fps: 2.0,
            ..Default::default()
        }
    }

    fn module(fps: f64) -> Arc<OutputModule<NullSink>> {
        Arc::new(OutputModule::new("sink", NullSink, 64, fps))
    }

    #[test]
    fn start_is_idempotent() {
        let camera = Camera::new(Arc::new(SyntheticBackend::new()), fast_settings());
        assert!(camera.start().unwrap());
        assert!(!camera.start().unwrap());
        assert!(camera.stop());
        assert!(!camera.stop());
    }

    #[test]
    fn unavailable_hardware_fails_start() {
        let backend = Arc::new(SyntheticBackend::new());
        backend.set_unavailable(true);
        let camera = Camera::new(backend, fast_settings());
        assert!(matches!(
            camera.start(),
            Err(CaptureError::HardwareUnavailable(_))
        ));
        assert!(!camera.is_running());
    }

    #[test]
    fn consumer_registration_is_idempotent() {
        let camera = Camera::new(Arc::new(SyntheticBackend::new()), fast_settings());
        let m = module(5.0);
        let consumer: Arc<dyn FrameConsumer> = m;
        assert!(camera.add_consumer(Arc::clone(&consumer)));
        assert!(!camera.add_consumer(Arc::clone(&consumer)));
        assert!(camera.remove_consumer(&consumer));
        assert!(!camera.remove_consumer(&consumer));
    }

    #[test]
    fn negotiation_tracks_running_consumers() {
        let camera = Camera::new(Arc::new(SyntheticBackend::new()), fast_settings());
        let fast = module(25.0);
        let slow = module(0.2);
        camera.add_consumer(Arc::clone(&fast) as Arc<dyn FrameConsumer>);
        camera.add_consumer(Arc::clone(&slow) as Arc<dyn FrameConsumer>);

        // Nothing running: idle rate
        assert_eq!(camera.refresh_capture_rate(), 2.0);

        slow.start();
        assert_eq!(camera.refresh_capture_rate(), 0.2);

        fast.start();
        assert_eq!(camera.refresh_capture_rate(), 25.0);

        fast.stop();
        assert_eq!(camera.refresh_capture_rate(), 0.2);
        slow.stop();
    }

    #[test]
    fn invalid_rate_clamped_not_rejected() {
        let camera = Camera::new(Arc::new(SyntheticBackend::new()), fast_settings());
        camera.update_capture_rate(-3.0);
        assert_eq!(camera.target_fps(), MIN_CAPTURE_FPS);
    }

    #[test]
    fn running_camera_feeds_running_consumer_only() {
        let camera = Camera::new(Arc::new(SyntheticBackend::new()), fast_settings());
        let active = module(50.0);
        let idle = module(50.0);
        camera.add_consumer(Arc::clone(&active) as Arc<dyn FrameConsumer>);
        camera.add_consumer(Arc::clone(&idle) as Arc<dyn FrameConsumer>);

        active.start();
        camera.update_capture_rate(50.0);
        camera.start().unwrap();
        std::thread::sleep(Duration::from_millis(300));
        camera.stop();
        active.stop();

        assert!(active.stats().accepted > 0, "running module saw no frames");
        assert_eq!(idle.stats().accepted, 0, "stopped module accepted frames");
    }

    fn wait_until(pred: impl Fn() -> bool) {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while !pred() {
            assert!(
                std::time::Instant::now() < deadline,
                "condition not reached in time"
            );
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn session_loss_leaves_camera_restartable() {
        let backend = Arc::new(SyntheticBackend::new());
        backend.fail_capture_after(2);
        let camera = Camera::new(Arc::clone(&backend) as Arc<dyn CameraBackend>, fast_settings());
        camera.update_capture_rate(50.0);
        camera.start().unwrap();
        wait_until(|| !camera.is_running());

        // Already self-stopped, but the dead thread is still reclaimed
        assert!(!camera.stop());
        assert!(camera.start().unwrap());
        assert_eq!(backend.sessions_opened(), 2);
        camera.stop();
    }

    #[test]
    fn still_capture_works_stopped_and_running() {
        let backend = Arc::new(SyntheticBackend::new());
        let camera = Camera::new(Arc::clone(&backend) as Arc<dyn CameraBackend>, fast_settings());

        // Stopped: a one-shot session serves the still
        let still = camera.capture_still().unwrap();
        assert_eq!((still.width(), still.height()), (16, 16));
        assert_eq!(backend.sessions_opened(), 1);

        // Running: the live session serves it, no reopen
        camera.start().unwrap();
        assert_eq!(backend.sessions_opened(), 2);
        let still = camera.capture_still().unwrap();
        assert!(!still.data.is_empty());
        assert_eq!(backend.sessions_opened(), 2);
        camera.stop();
    }

    #[test]
    fn control_update_does_not_reopen_session() {
        let backend = Arc::new(SyntheticBackend::new());
        let camera = Camera::new(Arc::clone(&backend) as Arc<dyn CameraBackend>, fast_settings());
        camera.start().unwrap();
        assert_eq!(backend.sessions_opened(), 1);

        camera
            .update_settings(SettingsUpdate {
                brightness: Some(0.4),
                ..Default::default()
            })
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(backend.sessions_opened(), 1);
        assert_eq!(camera.settings().brightness, 0.4);

        camera
            .update_settings(SettingsUpdate {
                resolution: Some((32, 32)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(backend.sessions_opened(), 2);
        assert!(camera.is_running());
        camera.stop();
    }
}
