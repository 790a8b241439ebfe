//! V4L2 camera transport with memory-mapped streaming

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use super::{DeviceSelector, LinkState, SubscriptionHandle, Transport, TransportError, TransportSink};
use crate::capture::{Encoding, RawFrame};
use crate::CaptureConfig;

/// Dequeue wait, so the worker notices unsubscribe promptly
const POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// Consecutive dequeue errors before the link is reported failed
const MAX_STREAM_ERRORS: u32 = 5;

pub struct V4l2Transport {
    config: CaptureConfig,
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl V4l2Transport {
    pub fn new(config: CaptureConfig) -> Self {
        Self {
            config,
            next_id: AtomicU64::new(1),
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn fourcc(&self) -> FourCC {
        match self.config.encoding {
            Encoding::Mjpeg => FourCC::new(b"MJPG"),
            Encoding::Yuyv => FourCC::new(b"YUYV"),
            Encoding::Rgb24 => FourCC::new(b"RGB3"),
            Encoding::Bgr24 => FourCC::new(b"BGR3"),
            Encoding::Gray8 => FourCC::new(b"GREY"),
        }
    }

    /// Open the device and negotiate the configured format.
    fn open(&self, path: &str) -> Result<(Device, Encoding, u32, u32), TransportError> {
        let device = Device::with_path(path)?;

        let caps = device.query_caps()?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(TransportError::Unsupported {
                device: path.to_string(),
                what: "video capture".into(),
            });
        }

        let mut fmt = device.format()?;
        fmt.width = self.config.width;
        fmt.height = self.config.height;
        fmt.fourcc = self.fourcc();
        let fmt = device.set_format(&fmt)?;

        // drivers may silently pick another format
        let encoding = match &fmt.fourcc.repr {
            b"MJPG" => Encoding::Mjpeg,
            b"YUYV" => Encoding::Yuyv,
            b"RGB3" => Encoding::Rgb24,
            b"BGR3" => Encoding::Bgr24,
            b"GREY" => Encoding::Gray8,
            other => {
                return Err(TransportError::Unsupported {
                    device: path.to_string(),
                    what: format!("negotiated format {}", String::from_utf8_lossy(other)),
                })
            }
        };
        if fmt.width != self.config.width || fmt.height != self.config.height {
            warn!(
                "Driver adjusted resolution to {}x{} (requested {}x{})",
                fmt.width, fmt.height, self.config.width, self.config.height
            );
        }

        Ok((device, encoding, fmt.width, fmt.height))
    }
}

impl Transport for V4l2Transport {
    #[instrument(skip(self, sink), fields(transport = "v4l2"))]
    fn subscribe(
        &self,
        selector: &DeviceSelector,
        sink: TransportSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let path = resolve(selector)?;
        let (device, encoding, width, height) = self.open(&path)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            device,
            encoding,
            width,
            height,
            buffer_count: self.config.buffer_count,
        };

        let worker_stop = stop.clone();
        thread::Builder::new()
            .name(format!("v4l2-{id}"))
            .spawn(move || worker.run(sink, worker_stop))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, stop);

        info!(id, path = %path, ?encoding, width, height, "V4L2 capture started");
        Ok(SubscriptionHandle::new(id))
    }

    fn unsubscribe(&self, handle: SubscriptionHandle) {
        let worker = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle.id());
        if let Some(stop) = worker {
            stop.store(true, Ordering::Release);
            info!(id = handle.id(), "V4L2 capture released");
        }
    }

    fn name(&self) -> &'static str {
        "v4l2"
    }
}

struct Worker {
    device: Device,
    encoding: Encoding,
    width: u32,
    height: u32,
    buffer_count: u32,
}

impl Worker {
    fn run(self, sink: TransportSink, stop: Arc<AtomicBool>) {
        let mut stream =
            match MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count) {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start capture stream: {}", e);
                    sink.on_state_change(LinkState::Failed(e.to_string()));
                    return;
                }
            };
        stream.set_timeout(POLL_TIMEOUT);
        info!("Capture stream started with {} buffers", self.buffer_count);

        if !sink.on_state_change(LinkState::Connected) {
            return;
        }

        let mut errors = 0u32;
        while !stop.load(Ordering::Acquire) {
            let received_at = Instant::now();
            let (buf, meta) = match stream.next() {
                Ok(next) => next,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                    debug!("No buffer within {:?}", POLL_TIMEOUT);
                    continue;
                }
                Err(e) => {
                    errors += 1;
                    warn!(errors, "Dequeue failed: {}", e);
                    if errors >= MAX_STREAM_ERRORS {
                        sink.on_state_change(LinkState::Failed(e.to_string()));
                        return;
                    }
                    continue;
                }
            };
            errors = 0;

            // MJPEG buffers are sized for the worst case; only `bytesused` is payload
            let used = (meta.bytesused as usize).min(buf.len());
            let used = if used == 0 { buf.len() } else { used };

            let frame = RawFrame {
                data: Bytes::copy_from_slice(&buf[..used]),
                encoding: self.encoding,
                width: self.width,
                height: self.height,
                sequence: u64::from(meta.sequence),
                device_timestamp: Some(
                    Duration::from_secs(meta.timestamp.sec as u64)
                        + Duration::from_micros(meta.timestamp.usec as u64),
                ),
                received_at,
            };
            if !sink.on_frame(frame) {
                return;
            }
        }

        sink.on_state_change(LinkState::Disconnected);
    }
}

/// Map a selector to a device node, probing `/dev/video*` for `Auto`.
pub fn resolve(selector: &DeviceSelector) -> Result<String, TransportError> {
    match selector {
        DeviceSelector::Path(path) => Ok(path.clone()),
        DeviceSelector::Index(index) => Ok(format!("/dev/video{index}")),
        DeviceSelector::Auto => auto_detect_device(),
    }
}

/// First capture-capable device, preferring ones that offer MJPEG or YUYV
fn auto_detect_device() -> Result<String, TransportError> {
    info!("Auto-detecting capture devices...");

    let mut fallback = None;
    for i in 0..10 {
        let path = format!("/dev/video{}", i);
        if !Path::new(&path).exists() {
            continue;
        }

        let Ok(dev) = Device::with_path(&path) else {
            continue;
        };
        let Ok(caps) = dev.query_caps() else {
            continue;
        };
        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            continue;
        }

        if let Ok(formats) = dev.enum_formats() {
            if formats
                .iter()
                .any(|fmt| fmt.fourcc == FourCC::new(b"MJPG") || fmt.fourcc == FourCC::new(b"YUYV"))
            {
                info!("Found capture device: {} - {}", path, caps.card);
                return Ok(path);
            }
        }
        fallback.get_or_insert(path);
    }

    fallback.ok_or_else(|| TransportError::DeviceNotFound("auto".into()))
}
