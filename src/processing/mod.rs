//! Pluggable frame transforms.
//!
//! A closed set of named strategies applied by an output module to every
//! frame it drains, before the frame reaches sink-specific logic. Strategies
//! are stateless per call and always return a new buffer; input frames are
//! never mutated. Non-RGB frames pass through untouched.

use std::collections::BTreeMap;

use bytes::Bytes;
use once_cell::sync::Lazy;

use crate::capture::frame::{Frame, PixelFormat};

/// Name-keyed strategy table, mirroring the set exposed to the control layer.
pub static STRATEGIES: Lazy<BTreeMap<&'static str, ProcessingStrategy>> = Lazy::new(|| {
    BTreeMap::from([
        ("none", ProcessingStrategy::Identity),
        ("grayscale", ProcessingStrategy::Grayscale),
        ("invert", ProcessingStrategy::Invert),
        ("threshold", ProcessingStrategy::Threshold),
    ])
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingStrategy {
    #[default]
    Identity,
    Grayscale,
    Invert,
    /// Binary cut on luma at 128
    Threshold,
}

impl ProcessingStrategy {
    pub fn from_name(name: &str) -> Option<Self> {
        STRATEGIES.get(name).copied()
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "none",
            Self::Grayscale => "grayscale",
            Self::Invert => "invert",
            Self::Threshold => "threshold",
        }
    }

    /// Applies the transform. Identity and non-RGB inputs are returned as
    /// cheap clones of the original frame.
    pub fn process(&self, frame: &Frame) -> Frame {
        if *self == Self::Identity || frame.format() != PixelFormat::Rgb24 {
            return frame.clone();
        }

        let data = match self {
            Self::Identity => unreachable!(),
            Self::Grayscale => map_rgb(&frame.data, |r, g, b| {
                let y = luma(r, g, b);
                [y, y, y]
            }),
            Self::Invert => map_rgb(&frame.data, |r, g, b| [255 - r, 255 - g, 255 - b]),
            Self::Threshold => map_rgb(&frame.data, |r, g, b| {
                let v = if luma(r, g, b) >= 128 { 255 } else { 0 };
                [v, v, v]
            }),
        };

        frame.with_data(data, PixelFormat::Rgb24)
    }
}

fn map_rgb(data: &[u8], f: impl Fn(u8, u8, u8) -> [u8; 3]) -> Bytes {
    let mut out = Vec::with_capacity(data.len());
    for px in data.chunks_exact(3) {
        out.extend_from_slice(&f(px[0], px[1], px[2]));
    }
    Bytes::from(out)
}

/// BT.601 integer luma
fn luma(r: u8, g: u8, b: u8) -> u8 {
    ((77 * r as u32 + 150 * g as u32 + 29 * b as u32) >> 8) as u8
}
