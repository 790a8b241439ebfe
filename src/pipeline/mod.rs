pub mod buffer;
pub mod processor;
pub mod session;
pub mod snapshot;

pub use buffer::{BufferStats, FrameBuffer, FramePair};
pub use processor::{FrameProcessor, Grayscale, HorizontalMirror, Identity, ProcessorKind, VerticalFlip};
pub use session::{ErrorReason, SessionError, SessionState, StreamSession};
pub use snapshot::{Snapshot, SnapshotController, SnapshotError, SnapshotRequest};
