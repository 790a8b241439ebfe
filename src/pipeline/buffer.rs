//! Single-slot, latest-frame-wins hand-off between the delivery loop and readers

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use tracing::trace;

use crate::Frame;

/// One publish: the input frame, what the processor made of it, and the version stamp.
///
/// The slot swaps whole `FramePair`s, so fields read from one pair always belong together.
#[derive(Debug)]
pub struct FramePair {
    pub input: Frame,
    pub output: Frame,
    pub version: u64,
    consumed: AtomicBool,
}

/// Holds at most one input/output pair.
///
/// Writers never wait on readers: a publish is an atomic pointer swap, and a frame nobody
/// read before the next publish is counted as overwritten.
pub struct FrameBuffer {
    slot: ArcSwapOption<FramePair>,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    published: AtomicU64,
    reads: AtomicU64,
    overwritten: AtomicU64,
}

/// Counter snapshot for monitoring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub published: u64,
    pub reads: u64,
    /// Pairs replaced before any reader saw them
    pub overwritten: u64,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            slot: ArcSwapOption::empty(),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Replace both held frames and bump the version. Returns the new version.
    pub fn publish(&self, input: Frame, output: Frame) -> u64 {
        let mut version = 0;
        let previous = self.slot.rcu(|current| {
            version = current.as_ref().map_or(1, |pair| pair.version + 1);
            Some(Arc::new(FramePair {
                input: input.clone(),
                output: output.clone(),
                version,
                consumed: AtomicBool::new(false),
            }))
        });

        self.stats.published.fetch_add(1, Ordering::Relaxed);
        if let Some(previous) = previous {
            if !previous.consumed.load(Ordering::Relaxed) {
                self.stats.overwritten.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("frames_overwritten").increment(1);
            }
        }

        trace!(version, sequence = input.sequence(), "published frame pair");
        version
    }

    /// The whole latest pair, if anything was published yet.
    pub fn read_pair(&self) -> Option<Arc<FramePair>> {
        let pair = self.slot.load_full()?;
        pair.consumed.store(true, Ordering::Relaxed);
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Some(pair)
    }

    /// Latest processed frame with the version it was published under.
    pub fn read_output(&self) -> Option<(Frame, u64)> {
        self.read_pair().map(|pair| (pair.output.clone(), pair.version))
    }

    /// Latest raw input frame with the version it was published under.
    pub fn read_input(&self) -> Option<(Frame, u64)> {
        self.read_pair().map(|pair| (pair.input.clone(), pair.version))
    }

    /// Current version, `0` before the first publish.
    pub fn version(&self) -> u64 {
        let guard = self.slot.load();
        match &*guard {
            Some(pair) => pair.version,
            None => 0,
        }
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            published: self.stats.published.load(Ordering::Relaxed),
            reads: self.stats.reads.load(Ordering::Relaxed),
            overwritten: self.stats.overwritten.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
