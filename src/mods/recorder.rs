//! src/mods/recorder.rs
//! Fixed-capacity sample ring written by the audio callback and read by the searchers.

use std::sync::atomic::{ AtomicU64, AtomicUsize, Ordering };

/// Single-producer / single-consumer circular recorder.
///
/// The producer appends with [`record`](Self::record); the consumer reads by
/// global sample index. Samples are stored as `f64` bit patterns so neither
/// side ever takes a lock. `total` is published with release ordering after
/// the slot is written, so every index below [`latest`](Self::latest) is
/// visible to the reader.
pub struct CircularRecorder {
    slots: Box<[AtomicU64]>,
    total: AtomicUsize,
}

impl CircularRecorder {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "recorder capacity must be non-zero");
        let slots = (0..capacity).map(|_| AtomicU64::new(0f64.to_bits())).collect();
        Self { slots, total: AtomicUsize::new(0) }
    }

    /// Append one sample, overwriting the oldest once full. Producer only.
    #[inline]
    pub fn record(&self, sample: f64) {
        let n = self.total.load(Ordering::Relaxed);
        self.slots[n % self.slots.len()].store(sample.to_bits(), Ordering::Relaxed);
        self.total.store(n + 1, Ordering::Release);
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Count of samples recorded so far.
    #[inline]
    pub fn latest(&self) -> usize {
        self.total.load(Ordering::Acquire)
    }

    /// Whether `index` is still held, i.e. in `[latest - capacity, latest)`.
    pub fn is_fresh(&self, index: usize) -> bool {
        let latest = self.latest();
        index < latest && index + self.capacity() >= latest
    }

    /// Sample at global `index`. Freshness is the caller's job; a stale index
    /// silently returns whatever overwrote it.
    #[inline]
    pub fn get(&self, index: usize) -> f64 {
        f64::from_bits(self.slots[index % self.slots.len()].load(Ordering::Relaxed))
    }
}
