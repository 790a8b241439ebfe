//! Frame sources.
//!
//! A [`Transport`] pushes raw buffers and link-state changes into a [`TransportSink`]
//! from whatever thread it runs on. The session on the other end owns the only receiver.

pub mod pattern;
#[cfg(feature = "v4l2")]
pub mod v4l2;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::capture::RawFrame;

pub use pattern::PatternTransport;
#[cfg(feature = "v4l2")]
pub use v4l2::V4l2Transport;

/// How long a state change may wait for room in a full event channel.
const STATE_SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Which camera to open.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DeviceSelector {
    /// First usable device
    #[default]
    Auto,
    /// Device node, e.g. `/dev/video2`
    Path(String),
    /// Device index, `2` meaning `/dev/video2` on V4L2
    Index(u32),
}

impl FromStr for DeviceSelector {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(TransportError::InvalidSelector(s.to_string()));
        }
        if s.eq_ignore_ascii_case("auto") {
            return Ok(DeviceSelector::Auto);
        }
        if let Ok(index) = s.parse::<u32>() {
            return Ok(DeviceSelector::Index(index));
        }
        Ok(DeviceSelector::Path(s.to_string()))
    }
}

impl TryFrom<String> for DeviceSelector {
    type Error = TransportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DeviceSelector> for String {
    fn from(selector: DeviceSelector) -> Self {
        selector.to_string()
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelector::Auto => f.write_str("auto"),
            DeviceSelector::Path(path) => f.write_str(path),
            DeviceSelector::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Connection state reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Failed(String),
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    Frame(RawFrame),
    State(LinkState),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid device selector {0:?}")]
    InvalidSelector(String),

    #[error("no capture device matches {0}")]
    DeviceNotFound(String),

    #[error("device {device} does not support {what}")]
    Unsupported { device: String, what: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opaque token for one subscription. Not `Clone`: releasing it consumes it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Source of frames and link-state changes.
pub trait Transport: Send + Sync {
    /// Start delivering into `sink`. Delivery happens on the transport's own threads.
    fn subscribe(
        &self,
        selector: &DeviceSelector,
        sink: TransportSink,
    ) -> Result<SubscriptionHandle, TransportError>;

    /// Stop delivering for `handle`. Must return promptly.
    fn unsubscribe(&self, handle: SubscriptionHandle);

    fn name(&self) -> &'static str;
}

/// Sending half handed to a transport. Cheap to clone, usable from any thread.
#[derive(Clone)]
pub struct TransportSink {
    tx: Sender<TransportEvent>,
    /// Shared handle on the queue, used only to evict stale frames
    evict: Arc<Receiver<TransportEvent>>,
    dropped: Arc<AtomicU64>,
}

impl TransportSink {
    /// Bounded channel: when full, the oldest queued frame gives way to the new one.
    pub fn channel(capacity: usize) -> (Self, Receiver<TransportEvent>) {
        let (tx, rx) = flume::bounded(capacity.max(1));
        (
            Self {
                tx,
                evict: Arc::new(rx.clone()),
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Hand over a frame. Returns `false` once the receiving session is gone.
    ///
    /// Never blocks. If the channel is full the oldest queued frame is discarded; queued
    /// state changes keep their place. Only when nothing but state changes is queued does
    /// the new frame itself get dropped.
    pub fn on_frame(&self, frame: RawFrame) -> bool {
        if self.is_closed() {
            return false;
        }

        let mut event = TransportEvent::Frame(frame);
        loop {
            match self.tx.try_send(event) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => event = back,
                Err(TrySendError::Disconnected(_)) => return false,
            }
            if !self.evict_oldest_frame() {
                self.count_drop("only state changes queued, dropping new frame");
                return true;
            }
        }
    }

    /// Report a link-state change. Returns `false` once the receiving session is gone.
    ///
    /// State changes are never dropped for lack of room; this waits a bounded time instead.
    pub fn on_state_change(&self, state: LinkState) -> bool {
        if self.is_closed() {
            return false;
        }
        match self
            .tx
            .send_timeout(TransportEvent::State(state), STATE_SEND_TIMEOUT)
        {
            Ok(()) => true,
            Err(flume::SendTimeoutError::Timeout(event)) => {
                warn!(?event, "session not draining events, state change lost");
                true
            }
            Err(flume::SendTimeoutError::Disconnected(_)) => false,
        }
    }

    /// True once the session's receiver is gone.
    pub fn is_closed(&self) -> bool {
        // the eviction handle is the one receiver left
        self.tx.receiver_count() <= 1
    }

    /// Frames dropped because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Remove the oldest queued frame, keeping everything else in order.
    /// Returns `false` if the queue holds only state changes.
    fn evict_oldest_frame(&self) -> bool {
        let mut queued: Vec<TransportEvent> = self.evict.drain().collect();
        // the session caught up in the meantime
        if queued.is_empty() {
            return true;
        }
        let oldest = queued
            .iter()
            .position(|event| matches!(event, TransportEvent::Frame(_)));
        if let Some(index) = oldest {
            queued.remove(index);
            self.count_drop("event channel full, dropping oldest frame");
        }

        for event in queued {
            match event {
                TransportEvent::State(_) => {
                    if let Err(e) = self.tx.send_timeout(event, STATE_SEND_TIMEOUT) {
                        warn!(event = ?e.into_inner(), "could not requeue state change");
                    }
                }
                TransportEvent::Frame(_) => {
                    if self.tx.try_send(event).is_err() {
                        self.count_drop("could not requeue frame");
                    }
                }
            }
        }
        oldest.is_some()
    }

    fn count_drop(&self, why: &'static str) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::counter!("events_dropped").increment(1);
        debug!(dropped, "{}", why);
    }
}
