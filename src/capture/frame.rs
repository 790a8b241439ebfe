use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Decoded frame with zero-copy semantics
///
/// Samples are interleaved, row-major, `height × width × channels`.
/// The sample bytes are never mutated after construction; cloning shares them.
#[derive(Clone)]
pub struct Frame {
    /// Immutable sample data - can be shared across threads without copying
    data: Bytes,

    /// Frame metadata
    pub meta: Arc<FrameMetadata>,

    /// Capture timestamp for latency tracking
    pub timestamp: Instant,
}

/// Frame metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameMetadata {
    pub sequence: u64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Interleaved pixel layouts a decoded frame can carry.
///
/// Channel order is part of the tag so it survives the whole pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Rgb24,
    Bgr24,
    Gray8,
}

impl PixelFormat {
    pub const fn channels(self) -> usize {
        match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Gray8 => 1,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame dimensions must be non-zero, got {width}x{height}")]
    EmptyDimensions { width: u32, height: u32 },

    #[error("expected {expected} bytes for {width}x{height} {format:?}, got {actual}")]
    LengthMismatch {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
}

impl Frame {
    /// Build a frame from already-decoded samples, checking the buffer matches the shape.
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        Self::with_metadata(
            FrameMetadata {
                sequence: 0,
                width,
                height,
                format,
                device_timestamp: None,
            },
            Instant::now(),
            data,
        )
    }

    pub fn with_metadata(
        meta: FrameMetadata,
        timestamp: Instant,
        data: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        let data = data.into();

        if meta.width == 0 || meta.height == 0 {
            return Err(FrameError::EmptyDimensions {
                width: meta.width,
                height: meta.height,
            });
        }

        let expected = meta.width as usize * meta.height as usize * meta.format.channels();
        if data.len() != expected {
            return Err(FrameError::LengthMismatch {
                width: meta.width,
                height: meta.height,
                format: meta.format,
                expected,
                actual: data.len(),
            });
        }

        Ok(Self {
            data,
            meta: Arc::new(meta),
            timestamp,
        })
    }

    /// Same sequence and timestamp, new samples and possibly a new layout.
    ///
    /// Used by processors, which must keep the provenance of the input frame.
    pub fn derive(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        data: impl Into<Bytes>,
    ) -> Result<Self, FrameError> {
        Self::with_metadata(
            FrameMetadata {
                width,
                height,
                format,
                ..(*self.meta).clone()
            },
            self.timestamp,
            data,
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Cheap handle on the underlying bytes.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn width(&self) -> u32 {
        self.meta.width
    }

    pub fn height(&self) -> u32 {
        self.meta.height
    }

    pub fn format(&self) -> PixelFormat {
        self.meta.format
    }

    pub fn channels(&self) -> usize {
        self.meta.format.channels()
    }

    pub fn sequence(&self) -> u64 {
        self.meta.sequence
    }

    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        (
            self.meta.height as usize,
            self.meta.width as usize,
            self.channels(),
        )
    }

    /// Bytes per row
    pub fn stride(&self) -> usize {
        self.meta.width as usize * self.channels()
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let stride = self.stride();
        let start = y as usize * stride;
        &self.data[start..start + stride]
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let c = self.channels();
        let start = x as usize * c;
        &self.row(y)[start..start + c]
    }

    pub fn age(&self) -> Duration {
        self.timestamp.elapsed()
    }

    /// Byte-level equality of shape, format and samples.
    pub fn same_content(&self, other: &Frame) -> bool {
        self.meta.width == other.meta.width
            && self.meta.height == other.meta.height
            && self.meta.format == other.meta.format
            && self.data == other.data
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("sequence", &self.meta.sequence)
            .field("width", &self.meta.width)
            .field("height", &self.meta.height)
            .field("format", &self.meta.format)
            .field("len", &self.data.len())
            .finish()
    }
}
