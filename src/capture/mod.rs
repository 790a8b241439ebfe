pub mod decoder;
pub mod frame;

pub use decoder::{decode_frame, DecodeError, Encoding, RawFrame};
pub use frame::{Frame, FrameError, FrameMetadata, PixelFormat};
