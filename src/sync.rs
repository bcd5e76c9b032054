use std::sync::atomic::{fence, AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nalgebra::{Quaternion, Vector3};

use crate::error::{Error, Result};
use crate::transform::Pose;

struct Slot<T> {
    item: Option<T>,
    closed: bool,
}

/// Bounded single-slot queue. A push into an occupied slot replaces the
/// pending item and counts it as dropped.
pub struct FrameSlot<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    dropped: AtomicUsize,
}

impl<T> Default for FrameSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameSlot<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                item: None,
                closed: false,
            }),
            ready: Condvar::new(),
            dropped: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slot<T>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offers an item.
    ///
    /// # Returns
    ///
    /// `false` if the slot is closed and the item was discarded.
    pub fn push(&self, item: T) -> bool {
        let mut slot = self.lock();
        if slot.closed {
            return false;
        }
        if slot.item.replace(item).is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        true
    }

    /// Blocks until an item is available. `None` once closed and drained.
    pub fn take(&self) -> Option<T> {
        let mut slot = self.lock();
        loop {
            if let Some(item) = slot.item.take() {
                return Some(item);
            }
            if slot.closed {
                return None;
            }
            slot = self
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`Self::take`] but gives up after `timeout`.
    pub fn take_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = self.lock();
        let (mut slot, _) = self
            .ready
            .wait_timeout_while(slot, timeout, |slot| slot.item.is_none() && !slot.closed)
            .unwrap_or_else(PoisonError::into_inner);
        slot.item.take()
    }

    pub fn try_take(&self) -> Option<T> {
        self.lock().item.take()
    }

    /// Discards the pending item, if any.
    pub fn clear(&self) -> bool {
        let cleared = self.lock().item.take().is_some();
        if cleared {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        cleared
    }

    /// Refuses further pushes and wakes the consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of items replaced or cleared before being taken.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Lock-free single-writer cell holding the latest pose and its timestamp.
///
/// A sequence lock: odd sequence numbers mark a write in progress, readers
/// retry until they observe the same even number before and after reading.
#[derive(Default)]
pub struct PoseCell {
    sequence: AtomicU64,
    /// tx, ty, tz, qi, qj, qk, qw as f32 bits.
    values: [AtomicU32; 7],
    timestamp: AtomicU64,
    published: AtomicBool,
}

impl PoseCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a pose. Must only be called from one thread at a time.
    pub fn publish(&self, pose: &Pose, timestamp: f64) {
        let translation = pose.translation();
        let rotation = pose.quaternion();
        let values = [
            translation[0],
            translation[1],
            translation[2],
            rotation.i,
            rotation.j,
            rotation.k,
            rotation.w,
        ];

        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        for (cell, value) in self.values.iter().zip(values) {
            cell.store(value.to_bits(), Ordering::Relaxed);
        }
        self.timestamp.store(timestamp.to_bits(), Ordering::Relaxed);
        self.published.store(true, Ordering::Relaxed);
        self.sequence
            .store(sequence.wrapping_add(2), Ordering::Release);
    }

    /// Forgets the published pose.
    pub fn clear(&self) {
        let sequence = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(sequence.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.published.store(false, Ordering::Relaxed);
        self.sequence
            .store(sequence.wrapping_add(2), Ordering::Release);
    }

    /// Latest pose and timestamp, `None` if nothing was published.
    pub fn latest(&self) -> Option<(Pose, f64)> {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }
            let published = self.published.load(Ordering::Relaxed);
            let values: Vec<f32> = self
                .values
                .iter()
                .map(|cell| f32::from_bits(cell.load(Ordering::Relaxed)))
                .collect();
            let timestamp = f64::from_bits(self.timestamp.load(Ordering::Relaxed));
            fence(Ordering::Acquire);
            if self.sequence.load(Ordering::Relaxed) != before {
                continue;
            }

            if !published {
                return None;
            }
            let pose = Pose::new(
                &Vector3::new(values[0], values[1], values[2]),
                &Quaternion::new(values[6], values[3], values[4], values[5]),
            );
            return Some((pose, timestamp));
        }
    }
}

/// Shared cancellation flag.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    canceled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// `Err(Error::Canceled)` once canceled.
    pub fn check(&self) -> Result<()> {
        if self.is_canceled() {
            Err(Error::Canceled)
        } else {
            Ok(())
        }
    }
}
