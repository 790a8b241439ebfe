use std::time::{Duration, Instant};

use bytes::Bytes;
use jpeg_decoder::Decoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::{Frame, FrameError, FrameMetadata, PixelFormat};

/// Wire encodings a transport may hand over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Mjpeg,
    Yuyv,
    Rgb24,
    Bgr24,
    Gray8,
}

/// Opaque buffer as delivered by a transport, before decoding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub data: Bytes,
    pub encoding: Encoding,
    /// Declared dimensions. Compressed encodings carry their own and ignore these.
    pub width: u32,
    pub height: u32,
    pub sequence: u64,
    pub device_timestamp: Option<Duration>,
    /// When the transport received the buffer
    pub received_at: Instant,
}

impl RawFrame {
    pub fn new(data: impl Into<Bytes>, encoding: Encoding, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            encoding,
            width,
            height,
            sequence: 0,
            device_timestamp: None,
            received_at: Instant::now(),
        }
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("jpeg: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),

    #[error("jpeg decoded without image info")]
    MissingJpegInfo,

    #[error("unsupported jpeg pixel format {0:?}")]
    UnsupportedJpeg(jpeg_decoder::PixelFormat),

    #[error("yuyv frames need an even width, got {0}")]
    OddWidth(u32),

    #[error("{encoding:?} buffer should be {expected} bytes, got {actual}")]
    InputLength {
        encoding: Encoding,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Turn a transport buffer into a decoded [`Frame`].
///
/// Uncompressed interleaved encodings are passed through without copying and keep
/// their channel order. MJPEG and YUYV decode to `Rgb24` (or `Gray8` for grayscale JPEG).
pub fn decode_frame(raw: &RawFrame) -> Result<Frame, DecodeError> {
    let (width, height, format, data): (u32, u32, PixelFormat, Bytes) = match raw.encoding {
        Encoding::Mjpeg => {
            let mut decoder = Decoder::new(&raw.data[..]);
            let pixels = decoder.decode()?;
            let info = decoder.info().ok_or(DecodeError::MissingJpegInfo)?;
            let format = match info.pixel_format {
                jpeg_decoder::PixelFormat::RGB24 => PixelFormat::Rgb24,
                jpeg_decoder::PixelFormat::L8 => PixelFormat::Gray8,
                other => return Err(DecodeError::UnsupportedJpeg(other)),
            };
            (
                u32::from(info.width),
                u32::from(info.height),
                format,
                Bytes::from(pixels),
            )
        }
        Encoding::Yuyv => {
            let rgb = yuyv_to_rgb(&raw.data, raw.width, raw.height)?;
            (raw.width, raw.height, PixelFormat::Rgb24, Bytes::from(rgb))
        }
        Encoding::Rgb24 => (raw.width, raw.height, PixelFormat::Rgb24, raw.data.clone()),
        Encoding::Bgr24 => (raw.width, raw.height, PixelFormat::Bgr24, raw.data.clone()),
        Encoding::Gray8 => (raw.width, raw.height, PixelFormat::Gray8, raw.data.clone()),
    };

    let meta = FrameMetadata {
        sequence: raw.sequence,
        width,
        height,
        format,
        device_timestamp: raw.device_timestamp,
    };

    Ok(Frame::with_metadata(meta, raw.received_at, data)?)
}

/// BT.601 limited-range YUYV (YUY2) to interleaved RGB.
fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, DecodeError> {
    if width % 2 != 0 {
        return Err(DecodeError::OddWidth(width));
    }

    let expected = width as usize * height as usize * 2;
    if data.len() != expected {
        return Err(DecodeError::InputLength {
            encoding: Encoding::Yuyv,
            expected,
            actual: data.len(),
        });
    }

    let mut rgb = Vec::with_capacity(width as usize * height as usize * 3);
    for chunk in data.chunks_exact(4) {
        let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

#[inline]
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = i32::from(y) - 16;
    let d = i32::from(u) - 128;
    let e = i32::from(v) - 128;

    let clamp = |x: i32| x.clamp(0, 255) as u8;
    [
        clamp((298 * c + 409 * e + 128) >> 8),
        clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp((298 * c + 516 * d + 128) >> 8),
    ]
}
