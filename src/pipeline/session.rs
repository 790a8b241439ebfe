//! Stream lifecycle and the per-frame delivery loop

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use flume::{Receiver, RecvError};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};

use crate::capture::{decode_frame, DecodeError, RawFrame};
use crate::pipeline::{FrameBuffer, FrameProcessor, SnapshotController};
use crate::transport::{
    DeviceSelector, LinkState, SubscriptionHandle, Transport, TransportError, TransportEvent,
    TransportSink,
};
use crate::SessionConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Stopped,
    Error(ErrorReason),
}

impl SessionState {
    /// `Stopped` and `Error` never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error(_))
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Connecting => f.write_str("connecting"),
            SessionState::Active => f.write_str("active"),
            SessionState::Stopped => f.write_str("stopped"),
            SessionState::Error(reason) => write!(f, "error: {reason}"),
        }
    }
}

/// Why a session ended in `Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ErrorReason {
    #[error("no frame within the miss budget")]
    Timeout,

    #[error("transport disconnected before streaming")]
    Disconnected,

    #[error("undecodable frames exhausted the miss budget: {0}")]
    DecodeFailure(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session already started (state: {0})")]
    AlreadyStarted(SessionState),

    #[error("sessions must be started from within a Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One streaming attempt: `Idle → Connecting → Active → Stopped | Error`.
///
/// Frames from the transport are decoded, run through the processor and published into
/// the session's [`FrameBuffer`]. Terminal states stick; build a new session to retry.
/// Dropping the session stops it.
pub struct StreamSession {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    processor: Arc<dyn FrameProcessor>,
    buffer: Arc<FrameBuffer>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    shutdown: Notify,
    published: AtomicU64,
}

/// What a miss was, for picking the error reason once the budget runs out
enum Miss {
    Timeout,
    Decode(DecodeError),
}

/// Why the delivery loop exited
enum End {
    /// `stop()` or another path already set a terminal state
    Shutdown,
    LinkLost,
    Failed(ErrorReason),
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        processor: Arc<dyn FrameProcessor>,
        buffer: Arc<FrameBuffer>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                transport,
                processor,
                buffer,
                config,
                state,
                subscription: Mutex::new(None),
                shutdown: Notify::new(),
                published: AtomicU64::new(0),
            }),
        }
    }

    /// Fresh buffer, processor chosen by `config.processor`.
    pub fn from_config(transport: Arc<dyn Transport>, config: SessionConfig) -> Self {
        let processor = config.processor();
        Self::new(transport, processor, Arc::new(FrameBuffer::new()), config)
    }

    /// Subscribe to the transport and spawn the delivery loop.
    ///
    /// Only valid from `Idle`. A failed subscription leaves the session in
    /// `Error(Transport)` and is also returned.
    #[instrument(skip(self), fields(transport = self.inner.transport.name()))]
    pub fn start(&self, selector: &DeviceSelector) -> Result<(), SessionError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let began = self
            .inner
            .update(|state| matches!(state, SessionState::Idle).then_some(SessionState::Connecting));
        if !began {
            return Err(SessionError::AlreadyStarted(self.state()));
        }

        let (sink, events) = TransportSink::channel(self.inner.config.channel_capacity);
        let handle = match self.inner.transport.subscribe(selector, sink) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Subscribe failed: {}", e);
                self.inner
                    .update(|_| Some(SessionState::Error(ErrorReason::Transport(e.to_string()))));
                return Err(e.into());
            }
        };
        *self.inner.lock_subscription() = Some(handle);

        // stop() may have run while we were subscribing
        if self.state().is_terminal() {
            self.inner.release();
            return Ok(());
        }

        runtime.spawn(self.inner.clone().run(events));
        Ok(())
    }

    /// Stop streaming and release the transport subscription.
    ///
    /// Safe in any state and idempotent; does not wait for the delivery loop.
    pub fn stop(&self) {
        let stopped = self.inner.update(|_| Some(SessionState::Stopped));
        self.inner.shutdown.notify_one();
        self.inner.release();

        if stopped {
            info!("Session stopped");
        } else {
            debug!(state = %self.state(), "stop on finished session ignored");
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    /// Receiver that sees every state change
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the session reaches `Stopped` or `Error`.
    pub async fn wait_until_finished(&self) -> SessionState {
        self.wait_for(SessionState::is_terminal).await
    }

    /// Resolves with the first state (current one included) matching `predicate`.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&SessionState) -> bool) -> SessionState {
        let mut rx = self.inner.state.subscribe();
        let state = match rx.wait_for(|state| predicate(state)).await {
            Ok(state) => state.clone(),
            // sender lives in `inner`, which we hold
            Err(_) => self.state(),
        };
        state
    }

    pub fn buffer(&self) -> Arc<FrameBuffer> {
        self.inner.buffer.clone()
    }

    /// Snapshot reader over this session's buffer
    pub fn snapshots(&self) -> SnapshotController {
        SnapshotController::new(self.inner.buffer.clone())
    }

    pub fn frames_published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        if !self.state().is_terminal() {
            self.stop();
        }
    }
}

impl Inner {
    /// Apply a transition computed from the current state. All transitions go through
    /// here, under the watch channel's lock, so concurrent callers are serialized.
    fn update(&self, next: impl FnOnce(&SessionState) -> Option<SessionState>) -> bool {
        let mut change = None;
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            match next(state) {
                Some(to) if to != *state => {
                    change = Some((std::mem::replace(state, to.clone()), to));
                    true
                }
                _ => false,
            }
        });

        match change {
            Some((from, to)) => {
                info!(%from, %to, "Session state changed");
                true
            }
            None => false,
        }
    }

    fn current(&self) -> SessionState {
        self.state.borrow().clone()
    }

    fn lock_subscription(&self) -> std::sync::MutexGuard<'_, Option<SubscriptionHandle>> {
        self.subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the subscription back to the transport, at most once.
    fn release(&self) {
        let handle = self.lock_subscription().take();
        if let Some(handle) = handle {
            debug!(id = handle.id(), "Releasing transport subscription");
            self.transport.unsubscribe(handle);
        }
    }

    async fn run(self: Arc<Self>, events: Receiver<TransportEvent>) {
        let timeout = self.config.frame_timeout();
        let budget = self.config.miss_budget.max(1);
        let mut misses = 0u32;

        info!(?timeout, budget, processor = self.processor.name(), "Delivery loop started");

        let end = loop {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.notified() => break End::Shutdown,
                received = tokio::time::timeout(timeout, events.recv_async()) => received,
            };

            let miss = match received {
                Err(_elapsed) => Some(Miss::Timeout),
                // every sender dropped: the transport is gone
                Ok(Err(RecvError::Disconnected)) => break End::LinkLost,
                Ok(Ok(TransportEvent::Frame(raw))) => match self.deliver(&raw) {
                    Ok(()) => {
                        misses = 0;
                        None
                    }
                    Err(e) => Some(Miss::Decode(e)),
                },
                Ok(Ok(TransportEvent::State(LinkState::Connected))) => {
                    self.update(|state| {
                        matches!(state, SessionState::Connecting).then_some(SessionState::Active)
                    });
                    None
                }
                Ok(Ok(TransportEvent::State(LinkState::Disconnected))) => break End::LinkLost,
                Ok(Ok(TransportEvent::State(LinkState::Failed(reason)))) => {
                    warn!("Transport failed: {}", reason);
                    break End::Failed(ErrorReason::Transport(reason));
                }
            };

            if let Some(miss) = miss {
                misses += 1;
                metrics::counter!("frames_missed").increment(1);
                let reason = match miss {
                    Miss::Timeout => {
                        warn!(misses, budget, "No frame within {:?}", timeout);
                        ErrorReason::Timeout
                    }
                    Miss::Decode(e) => {
                        warn!(misses, budget, "Skipping undecodable frame: {}", e);
                        ErrorReason::DecodeFailure(e.to_string())
                    }
                };
                if misses >= budget {
                    break End::Failed(reason);
                }
            }

            if self.current().is_terminal() {
                break End::Shutdown;
            }
        };

        // observers of the terminal state can rely on the subscription being gone
        self.release();
        match end {
            End::Shutdown => {}
            End::LinkLost => self.link_lost(),
            End::Failed(reason) => {
                self.update(|_| Some(SessionState::Error(reason)));
            }
        }

        info!(
            state = %self.current(),
            published = self.published.load(Ordering::Relaxed),
            "Delivery loop finished"
        );
    }

    /// Decode, process and publish one frame.
    fn deliver(&self, raw: &RawFrame) -> Result<(), DecodeError> {
        let input = decode_frame(raw)?;

        self.update(|state| matches!(state, SessionState::Connecting).then_some(SessionState::Active));
        if self.current() != SessionState::Active {
            return Ok(());
        }

        let started = Instant::now();
        let output = self.processor.process(&input);
        metrics::histogram!("process_time_us").record(started.elapsed().as_micros() as f64);

        let sequence = input.sequence();
        let version = self.buffer.publish(input, output);
        self.published.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("frames_published").increment(1);
        debug!(version, sequence, "Frame published");
        Ok(())
    }

    /// Orderly end while streaming, failure while still connecting.
    fn link_lost(&self) {
        self.update(|state| match state {
            SessionState::Active => Some(SessionState::Stopped),
            _ => Some(SessionState::Error(ErrorReason::Disconnected)),
        });
    }
}
