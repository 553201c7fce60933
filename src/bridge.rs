//! Single-slot frame hand-off between the host paint thread and the pull thread.
//!
//! The producer never blocks beyond the short critical section: an
//! unconsumed frame is overwritten (latest-frame-wins). Only the consumer
//! waits, bounded by its timeout, and is woken early when the bridge stops.

use crate::{Error, Result};
use log::{debug, trace};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Bytes per pixel of the packed BGRA layout
pub const BYTES_PER_PIXEL: usize = 4;

/// Size in bytes of a `width` x `height` BGRA frame, `None` on overflow
pub fn frame_size(width: u32, height: u32) -> Option<usize> {
    (width as usize)
        .checked_mul(height as usize)?
        .checked_mul(BYTES_PER_PIXEL)
}

/// A frame copied out of the slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Position in the consumed stream, starting at 0 per session
    pub sequence: u64,
}

impl Frame {
    /// Hex SHA-256 of the pixel data
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(&self.data))
    }
}

/// Result of [`FrameBridge::publish`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Published over a frame nobody consumed
    Overwrote,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    NotRunning,
    NoBuffer,
    GeometryMismatch,
}

/// Result of [`FrameBridge::consume`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consumed {
    Frame(Frame),
    Timeout,
    Stopped,
}

/// Counters for transient delivery events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub overwritten: u64,
    pub dropped: u64,
    pub consumed: u64,
}

#[derive(Debug, Default)]
struct Slot {
    buffer: Option<Vec<u8>>,
    width: u32,
    height: u32,
    ready: bool,
    running: bool,
    sequence: u64,
}

/// The mutex/condvar guarded frame slot.
///
/// `running` is kept both inside the lock (so stopping wakes a blocked
/// consumer atomically) and in an atomic mirror the redraw loop polls.
#[derive(Debug, Default)]
pub struct FrameBridge {
    slot: Mutex<Slot>,
    cond: Condvar,
    running: AtomicBool,
    published: AtomicU64,
    overwritten: AtomicU64,
    dropped: AtomicU64,
    consumed: AtomicU64,
}

impl FrameBridge {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        // Slot updates are single assignments; a poisoned guard is still consistent
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate the slot buffer for the negotiated geometry and reset the
    /// sequence counter.
    pub fn allocate(&self, width: u32, height: u32) -> Result<usize> {
        let bytes = frame_size(width, height).ok_or_else(|| {
            Error::Config(format!("invalid geometry {}x{}", width, height))
        })?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(bytes)
            .map_err(|_| Error::Allocation { bytes })?;
        buffer.resize(bytes, 0);

        let mut slot = self.lock();
        slot.buffer = Some(buffer);
        slot.width = width;
        slot.height = height;
        slot.ready = false;
        slot.sequence = 0;
        debug!("Allocated {} byte frame slot for {}x{}", bytes, width, height);
        Ok(bytes)
    }

    /// Free the slot buffer
    pub fn release(&self) {
        let mut slot = self.lock();
        slot.buffer = None;
        slot.ready = false;
    }

    pub fn is_allocated(&self) -> bool {
        self.lock().buffer.is_some()
    }

    pub fn geometry(&self) -> (u32, u32) {
        let slot = self.lock();
        (slot.width, slot.height)
    }

    /// Set the running flag under the lock and wake any waiting consumer
    pub fn set_running(&self, running: bool) {
        let mut slot = self.lock();
        slot.running = running;
        self.running.store(running, Ordering::Relaxed);
        if !running {
            slot.ready = false;
        }
        self.cond.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Whether a frame is waiting to be consumed
    pub fn is_ready(&self) -> bool {
        self.lock().ready
    }

    /// Copy a painted frame into the slot. Never blocks on the consumer.
    pub fn publish(&self, pixels: &[u8], width: u32, height: u32) -> PublishOutcome {
        if !self.is_running() {
            return self.drop_frame(DropReason::NotRunning);
        }

        let mut slot = self.lock();
        if !slot.running {
            drop(slot);
            return self.drop_frame(DropReason::NotRunning);
        }
        let expected = frame_size(width, height).unwrap_or(usize::MAX);
        if (width, height) != (slot.width, slot.height) || pixels.len() < expected {
            trace!(
                "Paint size mismatch: got {}x{} ({} bytes), expected {}x{}",
                width,
                height,
                pixels.len(),
                slot.width,
                slot.height
            );
            drop(slot);
            return self.drop_frame(DropReason::GeometryMismatch);
        }
        if slot.buffer.is_none() {
            drop(slot);
            return self.drop_frame(DropReason::NoBuffer);
        }
        let was_ready = slot.ready;
        if let Some(buffer) = slot.buffer.as_mut() {
            let len = buffer.len();
            buffer.copy_from_slice(&pixels[..len]);
        }
        slot.ready = true;
        self.cond.notify_one();
        drop(slot);

        self.published.fetch_add(1, Ordering::Relaxed);
        if was_ready {
            self.overwritten.fetch_add(1, Ordering::Relaxed);
            PublishOutcome::Overwrote
        } else {
            PublishOutcome::Published
        }
    }

    fn drop_frame(&self, reason: DropReason) -> PublishOutcome {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        PublishOutcome::Dropped(reason)
    }

    /// Wait up to `timeout` for a frame.
    ///
    /// Returns `Stopped` as soon as the bridge stops, `Timeout` without
    /// consuming anything when the wait elapses.
    pub fn consume(&self, timeout: Duration) -> Consumed {
        let slot = self.lock();
        let (mut slot, result) = self
            .cond
            .wait_timeout_while(slot, timeout, |s| s.running && !s.ready)
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if !slot.running {
            return Consumed::Stopped;
        }
        if result.timed_out() && !slot.ready {
            return Consumed::Timeout;
        }
        let Some(buffer) = slot.buffer.as_ref() else {
            return Consumed::Stopped;
        };

        let frame = Frame {
            data: buffer.clone(),
            width: slot.width,
            height: slot.height,
            sequence: slot.sequence,
        };
        slot.sequence += 1;
        slot.ready = false;
        drop(slot);

        self.consumed.fetch_add(1, Ordering::Relaxed);
        Consumed::Frame(frame)
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.published.load(Ordering::Relaxed),
            overwritten: self.overwritten.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            consumed: self.consumed.load(Ordering::Relaxed),
        }
    }
}
