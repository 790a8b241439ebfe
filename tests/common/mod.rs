#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use irsnap::capture::{Encoding, RawFrame};
use irsnap::transport::{
    DeviceSelector, LinkState, SubscriptionHandle, Transport, TransportError, TransportSink,
};

/// One thing the scripted transport does, in order
pub enum Step {
    Frame(RawFrame),
    State(LinkState),
    Sleep(Duration),
    /// Block until the test sends on the paired channel
    Gate(flume::Receiver<()>),
    /// Keep the sink alive without sending anything more
    Hold,
}

/// Mock transport replaying a script on its own thread
pub struct ScriptedTransport {
    script: Mutex<Option<Vec<Step>>>,
    held: Arc<Mutex<Vec<TransportSink>>>,
    pub subscribed: AtomicUsize,
    pub released: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(Some(script)),
            held: Arc::new(Mutex::new(Vec::new())),
            subscribed: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        })
    }

    /// Never sends, never disconnects
    pub fn silent() -> Arc<Self> {
        Self::new(vec![Step::Hold])
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl Transport for ScriptedTransport {
    fn subscribe(
        &self,
        _selector: &DeviceSelector,
        sink: TransportSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let id = self.subscribed.fetch_add(1, Ordering::SeqCst) as u64 + 1;
        let script = self.script.lock().unwrap().take().unwrap_or_default();
        let held = self.held.clone();

        thread::spawn(move || {
            for step in script {
                match step {
                    Step::Frame(frame) => {
                        sink.on_frame(frame);
                    }
                    Step::State(state) => {
                        sink.on_state_change(state);
                    }
                    Step::Sleep(duration) => thread::sleep(duration),
                    Step::Gate(gate) => {
                        let _ = gate.recv();
                    }
                    Step::Hold => {
                        held.lock().unwrap().push(sink);
                        return;
                    }
                }
            }
        });

        Ok(SubscriptionHandle::new(id))
    }

    fn unsubscribe(&self, _handle: SubscriptionHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
        self.held.lock().unwrap().clear();
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Transport whose devices never open
pub struct FailingTransport;

impl Transport for FailingTransport {
    fn subscribe(
        &self,
        selector: &DeviceSelector,
        _sink: TransportSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        Err(TransportError::DeviceNotFound(selector.to_string()))
    }

    fn unsubscribe(&self, _handle: SubscriptionHandle) {}

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Transport whose `subscribe` blocks until the test opens the gate
pub struct GatedTransport {
    entered: flume::Sender<()>,
    gate: flume::Receiver<()>,
    pub released: AtomicUsize,
}

impl GatedTransport {
    /// Returns the transport, a receiver signalled once `subscribe` is entered, and the
    /// sender that lets `subscribe` return.
    pub fn new() -> (Arc<Self>, flume::Receiver<()>, flume::Sender<()>) {
        let (entered_tx, entered_rx) = flume::bounded(1);
        let (open_tx, open_rx) = flume::bounded(1);
        let transport = Arc::new(Self {
            entered: entered_tx,
            gate: open_rx,
            released: AtomicUsize::new(0),
        });
        (transport, entered_rx, open_tx)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

impl Transport for GatedTransport {
    fn subscribe(
        &self,
        _selector: &DeviceSelector,
        _sink: TransportSink,
    ) -> Result<SubscriptionHandle, TransportError> {
        let _ = self.entered.send(());
        let _ = self.gate.recv();
        Ok(SubscriptionHandle::new(1))
    }

    fn unsubscribe(&self, _handle: SubscriptionHandle) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

/// 2x1 BGR frame: left pixel `[n, 0, 0]`, right pixel `[0, 0, n]`
pub fn bgr_frame(n: u8) -> RawFrame {
    RawFrame::new(vec![n, 0, 0, 0, 0, n], Encoding::Bgr24, 2, 1).with_sequence(u64::from(n))
}

pub fn garbage_jpeg() -> RawFrame {
    RawFrame::new(vec![0xff, 0xd8, 0x00, 0x01], Encoding::Mjpeg, 2, 1)
}
