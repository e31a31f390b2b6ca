//! Video artifact sink.
//!
//! Output modules treat the encoder as an opaque sink: frames in, one file
//! out. The shipped implementation is an MJPEG-in-AVI writer, which needs no
//! system libraries; anything heavier plugs in behind [`VideoEncoder`].

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use thiserror::Error;

use crate::capture::frame::{Frame, PixelFormat};

#[derive(Error, Debug)]
pub enum VideoError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("jpeg encode error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("cannot encode {0:?} frames")]
    UnsupportedFormat(PixelFormat),

    #[error("frame is {got_w}x{got_h}, artifact is {want_w}x{want_h}")]
    DimensionMismatch {
        got_w: u32,
        got_h: u32,
        want_w: u32,
        want_h: u32,
    },
}

/// An open video artifact accepting frames until finalized.
pub trait VideoEncoder: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), VideoError>;

    /// Finalizes headers and flushes. The artifact is not valid until this
    /// has run.
    fn finish(&mut self) -> Result<(), VideoError>;

    fn frames_written(&self) -> u64;

    fn path(&self) -> &Path;
}

/// JPEG-encodes a frame's pixel data. MJPEG frames pass through unchanged.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Bytes, VideoError> {
    match frame.format() {
        PixelFormat::Mjpeg => Ok(frame.data.clone()),
        PixelFormat::Rgb24 => {
            let mut buf = Vec::new();
            image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality).encode(
                &frame.data,
                frame.width(),
                frame.height(),
                image::ExtendedColorType::Rgb8,
            )?;
            Ok(Bytes::from(buf))
        }
        other => Err(VideoError::UnsupportedFormat(other)),
    }
}

/// Writes one frame as a timestamped JPEG still under `dir` and returns
/// the artifact path (`still_{YYYYmmdd_HHMMSS}.jpg`).
pub fn save_still(
    frame: &Frame,
    dir: impl AsRef<Path>,
    quality: u8,
) -> Result<PathBuf, VideoError> {
    let jpeg = encode_jpeg(frame, quality)?;
    std::fs::create_dir_all(dir.as_ref())?;
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = dir.as_ref().join(format!("still_{stamp}.jpg"));
    std::fs::write(&path, &jpeg)?;
    Ok(path)
}

// Fixed header layout offsets, patched on finish
const OFF_RIFF_SIZE: u64 = 4;
const OFF_TOTAL_FRAMES: u64 = 48;
const OFF_SUGGESTED_BUF: u64 = 60;
const OFF_STREAM_LENGTH: u64 = 140;
const OFF_MOVI_SIZE: u64 = 216;
const MOVI_DATA_START: u64 = 224;

/// Minimal RIFF/AVI container around JPEG frames.
pub struct MjpegAviWriter {
    file: BufWriter<File>,
    path: PathBuf,
    width: u32,
    height: u32,
    quality: u8,
    /// (offset relative to 'movi' fourcc, chunk size) per frame, for idx1
    index: Vec<(u32, u32)>,
    frames: u64,
    next_offset: u32,
    max_chunk: u32,
    finished: bool,
}

impl MjpegAviWriter {
    pub fn create(
        path: impl Into<PathBuf>,
        width: u32,
        height: u32,
        fps: f64,
        quality: u8,
    ) -> Result<Self, VideoError> {
        let path = path.into();
        let file = File::create(&path)?;
        let mut writer = Self {
            file: BufWriter::new(file),
            path,
            width,
            height,
            quality,
            index: Vec::new(),
            frames: 0,
            next_offset: 4,
            max_chunk: 0,
            finished: false,
        };
        writer.write_headers(fps.max(0.001))?;
        Ok(writer)
    }

    fn write_headers(&mut self, fps: f64) -> Result<(), VideoError> {
        let f = &mut self.file;
        f.write_all(b"RIFF")?;
        w32(f, 0)?; // riff size, patched
        f.write_all(b"AVI ")?;

        f.write_all(b"LIST")?;
        w32(f, 192)?;
        f.write_all(b"hdrl")?;

        // avih: main AVI header
        f.write_all(b"avih")?;
        w32(f, 56)?;
        w32(f, (1_000_000.0 / fps) as u32)?; // dwMicroSecPerFrame
        w32(f, 0)?; // dwMaxBytesPerSec
        w32(f, 0)?; // dwPaddingGranularity
        w32(f, 0x10)?; // dwFlags: AVIF_HASINDEX
        w32(f, 0)?; // dwTotalFrames, patched
        w32(f, 0)?; // dwInitialFrames
        w32(f, 1)?; // dwStreams
        w32(f, 0)?; // dwSuggestedBufferSize, patched
        w32(f, self.width)?;
        w32(f, self.height)?;
        for _ in 0..4 {
            w32(f, 0)?; // dwReserved
        }

        f.write_all(b"LIST")?;
        w32(f, 116)?;
        f.write_all(b"strl")?;

        // strh: stream header
        f.write_all(b"strh")?;
        w32(f, 56)?;
        f.write_all(b"vids")?;
        f.write_all(b"MJPG")?;
        w32(f, 0)?; // dwFlags
        w16(f, 0)?; // wPriority
        w16(f, 0)?; // wLanguage
        w32(f, 0)?; // dwInitialFrames
        w32(f, 1000)?; // dwScale
        w32(f, (fps * 1000.0).round() as u32)?; // dwRate
        w32(f, 0)?; // dwStart
        w32(f, 0)?; // dwLength, patched
        w32(f, 0)?; // dwSuggestedBufferSize
        w32(f, u32::MAX)?; // dwQuality: default
        w32(f, 0)?; // dwSampleSize
        w16(f, 0)?; // rcFrame
        w16(f, 0)?;
        w16(f, self.width as u16)?;
        w16(f, self.height as u16)?;

        // strf: BITMAPINFOHEADER
        f.write_all(b"strf")?;
        w32(f, 40)?;
        w32(f, 40)?; // biSize
        w32(f, self.width)?;
        w32(f, self.height)?;
        w16(f, 1)?; // biPlanes
        w16(f, 24)?; // biBitCount
        f.write_all(b"MJPG")?; // biCompression
        w32(f, self.width * self.height * 3)?; // biSizeImage
        for _ in 0..4 {
            w32(f, 0)?; // resolution + palette fields
        }

        f.write_all(b"LIST")?;
        w32(f, 0)?; // movi size, patched
        f.write_all(b"movi")?;
        debug_assert_eq!(self.file.stream_position()?, MOVI_DATA_START);
        Ok(())
    }
}

impl VideoEncoder for MjpegAviWriter {
    fn write_frame(&mut self, frame: &Frame) -> Result<(), VideoError> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(VideoError::DimensionMismatch {
                got_w: frame.width(),
                got_h: frame.height(),
                want_w: self.width,
                want_h: self.height,
            });
        }

        let jpeg = encode_jpeg(frame, self.quality)?;
        let size = jpeg.len() as u32;

        self.file.write_all(b"00dc")?;
        w32(&mut self.file, size)?;
        self.file.write_all(&jpeg)?;
        if size % 2 == 1 {
            self.file.write_all(&[0])?; // chunks are word-aligned
        }

        self.index.push((self.next_offset, size));
        self.frames += 1;
        self.next_offset += 8 + size + (size % 2);
        self.max_chunk = self.max_chunk.max(size);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), VideoError> {
        if self.finished {
            return Ok(());
        }

        let movi_end = self.file.stream_position()?;

        // idx1 index
        self.file.write_all(b"idx1")?;
        w32(&mut self.file, self.index.len() as u32 * 16)?;
        for (offset, size) in std::mem::take(&mut self.index).iter() {
            self.file.write_all(b"00dc")?;
            w32(&mut self.file, 0x10)?; // AVIIF_KEYFRAME
            w32(&mut self.file, *offset)?;
            w32(&mut self.file, *size)?;
        }
        let file_end = self.file.stream_position()?;
        let frames = self.frames_written() as u32;

        for (offset, value) in [
            (OFF_RIFF_SIZE, (file_end - 8) as u32),
            (OFF_TOTAL_FRAMES, frames),
            (OFF_SUGGESTED_BUF, self.max_chunk),
            (OFF_STREAM_LENGTH, frames),
            (OFF_MOVI_SIZE, (movi_end - MOVI_DATA_START + 4) as u32),
        ] {
            self.file.seek(SeekFrom::Start(offset))?;
            w32(&mut self.file, value)?;
        }
        self.file.flush()?;
        self.finished = true;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.frames
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

fn w32(f: &mut (impl Write + ?Sized), v: u32) -> std::io::Result<()> {
    f.write_all(&v.to_le_bytes())
}

fn w16(f: &mut (impl Write + ?Sized), v: u16) -> std::io::Result<()> {
    f.write_all(&v.to_le_bytes())
}

/// Reads the header's total-frame count from a finished artifact.
pub fn read_frame_count(path: &Path) -> Result<u32, VideoError> {
    use std::io::Read;
    let mut file = File::open(path)?;
    let mut header = [0u8; 52];
    file.read_exact(&mut header)?;
    Ok(u32::from_le_bytes([
        header[48], header[49], header[50], header[51],
    ]))
}
