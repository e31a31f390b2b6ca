//! V4L2 camera backend (feature `v4l2`).

use bytes::Bytes;
use tracing::{info, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::backend::{CameraBackend, CameraSession, CaptureError};
use super::decoder;
use super::frame::{Frame, PixelFormat};
use crate::CaptureSettings;

const CID_BRIGHTNESS: u32 = 0x0098_0900;
const CID_CONTRAST: u32 = 0x0098_0901;
const CID_SATURATION: u32 = 0x0098_0902;
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

const ENODEV: i32 = 19;

/// Backend over a V4L2 device node.
pub struct V4l2Backend {
    path: String,
    format: PixelFormat,
    buffer_count: u32,
}

impl V4l2Backend {
    pub fn new(path: impl Into<String>, format: PixelFormat) -> Self {
        Self {
            path: path.into(),
            format,
            buffer_count: 4,
        }
    }
}

impl CameraBackend for V4l2Backend {
    fn open(&self, settings: &CaptureSettings) -> Result<Box<dyn CameraSession>, CaptureError> {
        let device = Device::with_path(&self.path)
            .map_err(|e| CaptureError::HardwareUnavailable(format!("{}: {e}", self.path)))?;

        let caps = device
            .query_caps()
            .map_err(|e| CaptureError::HardwareUnavailable(e.to_string()))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(CaptureError::HardwareUnavailable(
                "device doesn't support video capture".into(),
            ));
        }

        let mut fmt = device
            .format()
            .map_err(|e| CaptureError::HardwareUnavailable(e.to_string()))?;
        fmt.width = settings.width;
        fmt.height = settings.height;
        fmt.fourcc = match self.format {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Yuyv4 => FourCC::new(b"YUYV"),
            PixelFormat::Rgb24 => FourCC::new(b"RGB3"),
        };
        device
            .set_format(&fmt)
            .map_err(|e| CaptureError::HardwareUnavailable(format!("set_format: {e}")))?;

        let stream = MmapStream::with_buffers(&device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| CaptureError::HardwareUnavailable(format!("mmap stream: {e}")))?;

        let mut session = V4l2Session {
            device: Box::new(device),
            stream,
            width: settings.width,
            height: settings.height,
            format: self.format,
            sequence: 0,
        };
        session.apply_controls(settings)?;
        Ok(Box::new(session))
    }
}

struct V4l2Session {
    device: Box<Device>,
    stream: MmapStream<'static>,
    width: u32,
    height: u32,
    format: PixelFormat,
    sequence: u64,
}

impl V4l2Session {
    /// Scales a normalized control value into the driver's reported range.
    fn set_scaled_control(&self, id: u32, normalized: f64) -> Result<(), CaptureError> {
        let descriptions = self
            .device
            .query_controls()
            .map_err(|e| CaptureError::Transient(format!("query_controls: {e}")))?;
        let Some(desc) = descriptions.iter().find(|d| d.id == id) else {
            return Ok(()); // driver doesn't expose this control
        };
        let span = (desc.maximum - desc.minimum) as f64;
        let raw = desc.minimum + (normalized.clamp(0.0, 1.0) * span).round() as i64;
        self.device
            .set_control(Control {
                id,
                value: Value::Integer(raw),
            })
            .map_err(|e| CaptureError::Transient(format!("set_control {id:#x}: {e}")))
    }
}

impl CameraSession for V4l2Session {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        let (buf, _meta) = self.stream.next().map_err(|e| {
            // A vanished device node means the session is gone for good
            if e.raw_os_error() == Some(ENODEV) {
                CaptureError::SessionLost(e.to_string())
            } else {
                CaptureError::Transient(e.to_string())
            }
        })?;

        let rgb = decoder::decode_to_rgb(buf, self.format)?;
        self.sequence += 1;
        Ok(Frame::new(
            Bytes::from(rgb),
            self.sequence,
            self.width,
            self.height,
            PixelFormat::Rgb24,
        ))
    }

    fn apply_controls(&mut self, settings: &CaptureSettings) -> Result<(), CaptureError> {
        // Normalize our ranges (-1..=1 and 0..=4) into 0..=1 for scaling
        self.set_scaled_control(CID_BRIGHTNESS, (settings.brightness as f64 + 1.0) / 2.0)?;
        self.set_scaled_control(CID_CONTRAST, settings.contrast as f64 / 4.0)?;
        self.set_scaled_control(CID_SATURATION, settings.saturation as f64 / 4.0)?;
        if settings.exposure_us > 0 {
            // V4L2 exposure-absolute is in 100us units
            let value = (settings.exposure_us / 100).max(1) as i64;
            if let Err(e) = self.device.set_control(Control {
                id: CID_EXPOSURE_ABSOLUTE,
                value: Value::Integer(value),
            }) {
                warn!("manual exposure not applied: {e}");
            }
        }
        Ok(())
    }

    fn set_frame_rate(&mut self, fps: f64) -> Result<(), CaptureError> {
        let fps = fps.round().max(1.0) as u32;
        self.device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|e| CaptureError::Transient(format!("set_params: {e}")))?;
        info!("Applied {fps} fps to V4L2 session");
        Ok(())
    }
}

