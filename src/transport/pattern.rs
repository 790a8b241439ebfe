//! Synthetic camera producing a moving test pattern

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument};

use super::{DeviceSelector, LinkState, SubscriptionHandle, Transport, TransportError, TransportSink};
use crate::capture::{Encoding, RawFrame};
use crate::CaptureConfig;

/// Software frame source for running the pipeline without hardware.
///
/// Left half of each frame is dark, right half bright, with a vertical bar sweeping
/// across so consecutive frames differ. Frames are BGR24 unless configured otherwise.
pub struct PatternTransport {
    width: u32,
    height: u32,
    fps: u32,
    encoding: Encoding,
    next_id: AtomicU64,
    workers: Mutex<HashMap<u64, Arc<AtomicBool>>>,
}

impl PatternTransport {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps: fps.max(1),
            encoding: Encoding::Bgr24,
            next_id: AtomicU64::new(1),
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CaptureConfig) -> Self {
        Self::new(config.width, config.height, config.fps).with_encoding(config.encoding)
    }

    /// Only uncompressed encodings are generated.
    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        if matches!(encoding, Encoding::Rgb24 | Encoding::Bgr24 | Encoding::Gray8) {
            self.encoding = encoding;
        }
        self
    }

    /// Number of live delivery threads
    pub fn active_subscriptions(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Transport for PatternTransport {
    #[instrument(skip(self, sink), fields(transport = "pattern"))]
    fn subscribe(
        &self,
        selector: &DeviceSelector,
        sink: TransportSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        if self.width == 0 || self.height == 0 {
            return Err(TransportError::Unsupported {
                device: selector.to_string(),
                what: format!("{}x{} frames", self.width, self.height),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stop = Arc::new(AtomicBool::new(false));
        let generator = Generator {
            width: self.width,
            height: self.height,
            encoding: self.encoding,
        };
        let interval = Duration::from_secs(1) / self.fps;

        let worker_stop = stop.clone();
        thread::Builder::new()
            .name(format!("pattern-{id}"))
            .spawn(move || generator.run(sink, worker_stop, interval))?;
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, stop);

        info!(
            id,
            width = self.width,
            height = self.height,
            fps = self.fps,
            "pattern source started"
        );
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
            info!(id = handle.id(), "pattern source released");
        }
    }

    fn name(&self) -> &'static str {
        "pattern"
    }
}

struct Generator {
    width: u32,
    height: u32,
    encoding: Encoding,
}

impl Generator {
    fn run(self, sink: TransportSink, stop: Arc<AtomicBool>, interval: Duration) {
        if !sink.on_state_change(LinkState::Connected) {
            return;
        }

        let mut sequence = 0u64;
        let mut next_tick = Instant::now();
        while !stop.load(Ordering::Acquire) {
            sequence += 1;
            let frame = RawFrame::new(self.render(sequence), self.encoding, self.width, self.height)
                .with_sequence(sequence);
            if !sink.on_frame(frame) {
                debug!(sequence, "receiver gone, pattern source exiting");
                return;
            }

            next_tick += interval;
            if let Some(wait) = next_tick.checked_duration_since(Instant::now()) {
                thread::sleep(wait);
            } else {
                next_tick = Instant::now();
            }
        }

        sink.on_state_change(LinkState::Disconnected);
    }

    fn render(&self, sequence: u64) -> Vec<u8> {
        let channels = match self.encoding {
            Encoding::Gray8 => 1,
            _ => 3,
        };
        let bar = (sequence % u64::from(self.width)) as u32;

        let mut data = Vec::with_capacity((self.width * self.height) as usize * channels);
        for _y in 0..self.height {
            for x in 0..self.width {
                let level: u8 = if x == bar {
                    255
                } else if x < self.width / 2 {
                    32
                } else {
                    192
                };
                match self.encoding {
                    Encoding::Gray8 => data.push(level),
                    // warm tint on the right so channel order is visible
                    Encoding::Bgr24 => data.extend_from_slice(&[level / 2, level, level]),
                    _ => data.extend_from_slice(&[level, level, level / 2]),
                }
            }
        }
        data
    }
}
