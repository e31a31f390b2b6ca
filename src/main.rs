//! Wellcam service binary: one camera, three frame consumers.

use std::sync::Arc;

use color_eyre::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wellcam::capture::Camera;
use wellcam::outputs::{FrameConsumer, OutputModule};
use wellcam::{Config, StorageSink, StreamSink, TimelapseSink};

#[cfg(feature = "v4l2")]
fn backend() -> Arc<dyn wellcam::capture::CameraBackend> {
    Arc::new(wellcam::capture::V4l2Backend::new(
        "/dev/video0",
        wellcam::PixelFormat::Mjpeg,
    ))
}

#[cfg(not(feature = "v4l2"))]
fn backend() -> Arc<dyn wellcam::capture::CameraBackend> {
    Arc::new(wellcam::SyntheticBackend::new())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "wellcam=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("wellcam launching");

    let config = Config::default();
    let camera = Arc::new(Camera::new(backend(), config.capture.clone()));

    let stream = Arc::new(OutputModule::new(
        "stream",
        StreamSink::new(config.stream.jpeg_quality),
        config.stream.queue_capacity,
        config.stream.fps,
    ));
    let storage = Arc::new(OutputModule::new(
        "storage",
        StorageSink::new(&config.storage.output_dir),
        config.storage.queue_capacity,
        config.storage.fps,
    ));
    let timelapse = Arc::new(OutputModule::new(
        "timelapse",
        TimelapseSink::new(
            &config.timelapse.output_dir,
            config.timelapse.duration_secs,
            config.timelapse.min_frames,
            config.timelapse.output_fps,
        ),
        config.timelapse.queue_capacity,
        1.0 / config.timelapse.interval_secs,
    ));

    camera.add_consumer(Arc::clone(&stream) as Arc<dyn FrameConsumer>);
    camera.add_consumer(Arc::clone(&storage) as Arc<dyn FrameConsumer>);
    camera.add_consumer(Arc::clone(&timelapse) as Arc<dyn FrameConsumer>);

    // Live view runs from launch; recording and timelapse start on demand
    stream.start();
    camera.refresh_capture_rate();
    camera.start()?;

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    stream.stop();
    storage.stop();
    timelapse.stop();
    camera.refresh_capture_rate();
    camera.stop();
    Ok(())
}
