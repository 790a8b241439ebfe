//! Per-frame transforms applied between decode and publish

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{Frame, PixelFormat};

/// Pure frame transform.
///
/// Implementations hold no mutable state and may be called concurrently from several
/// threads on independent frames. The output keeps the input's sequence and timestamp.
pub trait FrameProcessor: Send + Sync {
    fn process(&self, frame: &Frame) -> Frame;

    fn name(&self) -> &'static str;
}

/// Passes frames through untouched. Shares the sample bytes, no copy.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl FrameProcessor for Identity {
    fn process(&self, frame: &Frame) -> Frame {
        frame.clone()
    }

    fn name(&self) -> &'static str {
        "identity"
    }
}

/// Reverses pixel columns in every row (selfie view).
#[derive(Debug, Clone, Copy, Default)]
pub struct HorizontalMirror;

impl FrameProcessor for HorizontalMirror {
    fn process(&self, frame: &Frame) -> Frame {
        let c = frame.channels();
        let mut out = Vec::with_capacity(frame.data().len());
        for y in 0..frame.height() {
            for pixel in frame.row(y).chunks_exact(c).rev() {
                out.extend_from_slice(pixel);
            }
        }
        rebuild(frame, frame.format(), out)
    }

    fn name(&self) -> &'static str {
        "mirror"
    }
}

/// Reverses row order (upside-down mounted sensors).
#[derive(Debug, Clone, Copy, Default)]
pub struct VerticalFlip;

impl FrameProcessor for VerticalFlip {
    fn process(&self, frame: &Frame) -> Frame {
        let mut out = Vec::with_capacity(frame.data().len());
        for y in (0..frame.height()).rev() {
            out.extend_from_slice(frame.row(y));
        }
        rebuild(frame, frame.format(), out)
    }

    fn name(&self) -> &'static str {
        "flip"
    }
}

/// BT.601 luma, honouring the input's channel order. Output is `Gray8`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Grayscale;

impl FrameProcessor for Grayscale {
    fn process(&self, frame: &Frame) -> Frame {
        let (r, g, b) = match frame.format() {
            PixelFormat::Gray8 => return frame.clone(),
            PixelFormat::Rgb24 => (0, 1, 2),
            PixelFormat::Bgr24 => (2, 1, 0),
        };

        let out = frame
            .data()
            .chunks_exact(3)
            .map(|px| {
                let luma = 299 * u32::from(px[r]) + 587 * u32::from(px[g]) + 114 * u32::from(px[b]);
                ((luma + 500) / 1000) as u8
            })
            .collect::<Vec<u8>>();
        rebuild(frame, PixelFormat::Gray8, out)
    }

    fn name(&self) -> &'static str {
        "grayscale"
    }
}

// Every processor here preserves width and height, and `out` is sized for `format`,
// so the shape check in `derive` cannot fail.
fn rebuild(frame: &Frame, format: PixelFormat, out: Vec<u8>) -> Frame {
    let derived = frame.derive(frame.width(), frame.height(), format, out);
    debug_assert!(derived.is_ok(), "processor produced a malformed frame: {derived:?}");
    derived.unwrap_or_else(|_| frame.clone())
}

/// Processor selection for configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessorKind {
    Identity,
    #[default]
    Mirror,
    Flip,
    Grayscale,
}

impl ProcessorKind {
    pub fn build(self) -> Arc<dyn FrameProcessor> {
        match self {
            ProcessorKind::Identity => Arc::new(Identity),
            ProcessorKind::Mirror => Arc::new(HorizontalMirror),
            ProcessorKind::Flip => Arc::new(VerticalFlip),
            ProcessorKind::Grayscale => Arc::new(Grayscale),
        }
    }
}
