//! User-triggered reads of the latest processed frame

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use image::{ImageResult, Rgb, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::pipeline::FrameBuffer;
use crate::{Frame, PixelFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// Nothing published yet. Expected before the first frame, not a fault.
    #[error("no frame available yet")]
    NotAvailable,

    #[error("no new frame since version {0}")]
    NoNewFrame(u64),
}

/// A "capture now" trigger
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRequest {
    pub requested_at: Instant,
}

impl SnapshotRequest {
    pub fn now() -> Self {
        Self {
            requested_at: Instant::now(),
        }
    }
}

impl Default for SnapshotRequest {
    fn default() -> Self {
        Self::now()
    }
}

/// A captured output frame and where it came from
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frame: Frame,
    /// Buffer version the frame was published under
    pub version: u64,
    /// Time from the frame's capture to the snapshot
    pub age: Duration,
}

impl Snapshot {
    /// `(height, width, channels)`
    pub fn shape(&self) -> (usize, usize, usize) {
        self.frame.shape()
    }

    /// RGB copy for encoders and viewers, whatever the frame's channel order.
    pub fn to_rgb_image(&self) -> RgbImage {
        let frame = &self.frame;
        RgbImage::from_fn(frame.width(), frame.height(), |x, y| {
            let px = frame.pixel(x, y);
            match frame.format() {
                PixelFormat::Rgb24 => Rgb([px[0], px[1], px[2]]),
                PixelFormat::Bgr24 => Rgb([px[2], px[1], px[0]]),
                PixelFormat::Gray8 => Rgb([px[0], px[0], px[0]]),
            }
        })
    }

    /// Encode to `path`; the extension picks the format.
    pub fn save(&self, path: impl AsRef<Path>) -> ImageResult<()> {
        self.to_rgb_image().save(path)
    }
}

/// Reads snapshots out of a session's [`FrameBuffer`].
///
/// Never blocks and never sees a half-written frame; the returned frame shares immutable
/// bytes, so later publishes cannot change it.
pub struct SnapshotController {
    buffer: Arc<FrameBuffer>,
    last_fresh: AtomicU64,
}

impl SnapshotController {
    pub fn new(buffer: Arc<FrameBuffer>) -> Self {
        Self {
            buffer,
            last_fresh: AtomicU64::new(0),
        }
    }

    /// Latest processed frame.
    pub fn capture(&self) -> Result<Frame, SnapshotError> {
        self.read().map(|(frame, _)| frame)
    }

    /// Capture with provenance, recording how long the trigger waited.
    pub fn fulfil(&self, request: SnapshotRequest) -> Result<Snapshot, SnapshotError> {
        let (frame, version) = self.read()?;
        metrics::histogram!("snapshot_latency_ms")
            .record(request.requested_at.elapsed().as_secs_f64() * 1000.0);

        Ok(Snapshot {
            age: frame.age(),
            frame,
            version,
        })
    }

    /// Like [`fulfil`](Self::fulfil), but each published version is handed out at most
    /// once per controller, even with concurrent callers.
    pub fn capture_fresh(&self) -> Result<Snapshot, SnapshotError> {
        let (frame, version) = self.read()?;

        let previous = self.last_fresh.fetch_max(version, Ordering::AcqRel);
        if previous >= version {
            return Err(SnapshotError::NoNewFrame(previous));
        }

        Ok(Snapshot {
            age: frame.age(),
            frame,
            version,
        })
    }

    fn read(&self) -> Result<(Frame, u64), SnapshotError> {
        match self.buffer.read_output() {
            Some(latest) => Ok(latest),
            None => {
                debug!("Snapshot requested before first frame");
                Err(SnapshotError::NotAvailable)
            }
        }
    }
}
