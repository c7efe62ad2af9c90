use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use thiserror::Error;

/// Default map size exponent, matching afl-fuzz's `MAP_SIZE_POW2`.
pub const DEFAULT_MAP_SIZE_POW2: u32 = 16;

/// Largest map size exponent accepted. Location ids are pushed as 32-bit
/// integers by the injected code, so anything bigger could not be addressed.
pub const MAX_MAP_SIZE_POW2: u32 = 24;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CoverageError {
    #[error("Map size exponent {0} is outside of 1..={MAX_MAP_SIZE_POW2}")]
    InvalidSize(u32),
    /// The map was invalidated by the surrogate monitor. Instrumented code
    /// must abandon the current iteration.
    #[error("Coverage map is unavailable")]
    Unavailable,
}

/// The edge-coverage map shared between instrumented code, the protocol layer
/// and the native peer.
///
/// Each slot is an 8-bit counter that wraps on overflow. Next to the slots the
/// map owns the previous-location register, so one recorded tuple is
/// `location ^ previous` and the register then becomes `location >> 1`. The
/// register is never reset: its evolution across a process lifetime makes the
/// signal path sensitive.
///
/// Availability is an advisory sentinel rather than a lock. The surrogate
/// monitor flips it off when the monitored child dies, which makes the next
/// [`CoverageMap::record`] fail fast, and the main task's death handler flips
/// it back on. The backing storage is never reallocated.
#[derive(Debug)]
pub struct CoverageMap {
    slots: Box<[AtomicU8]>,
    prev_location: AtomicU32,
    available: AtomicBool,
}

impl CoverageMap {
    /// Creates a zeroed map with `1 << size_pow2` slots.
    pub fn new(size_pow2: u32) -> Result<Self, CoverageError> {
        if size_pow2 == 0 || size_pow2 > MAX_MAP_SIZE_POW2 {
            return Err(CoverageError::InvalidSize(size_pow2));
        }
        let slots = (0..1usize << size_pow2)
            .map(|_| AtomicU8::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Ok(Self {
            slots,
            prev_location: AtomicU32::new(0),
            available: AtomicBool::new(true),
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Records one edge ending at `location` and returns the tuple index that
    /// was bumped.
    ///
    /// This is the same operation the rewritten bytecode performs inline. The
    /// update is not atomic as a whole: concurrent recorders may lose counts,
    /// which is acceptable for a coverage signal.
    #[inline]
    pub fn record(&self, location: u32) -> Result<usize, CoverageError> {
        if !self.available.load(Ordering::Acquire) {
            return Err(CoverageError::Unavailable);
        }
        let mask = (self.slots.len() - 1) as u32;
        let prev = self.prev_location.load(Ordering::Relaxed);
        let index = ((location ^ prev) & mask) as usize;
        self.slots[index].fetch_add(1, Ordering::Relaxed);
        self.prev_location.store((location & mask) >> 1, Ordering::Relaxed);
        Ok(index)
    }

    pub fn prev_location(&self) -> u32 {
        self.prev_location.load(Ordering::Relaxed)
    }

    pub fn get(&self, index: usize) -> Option<u8> {
        self.slots.get(index).map(|slot| slot.load(Ordering::Relaxed))
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.available.store(false, Ordering::Release);
    }

    pub fn restore(&self) {
        self.available.store(true, Ordering::Release);
    }

    /// Copies the current slot values, e.g. for a peer without shared memory.
    pub fn snapshot(&self) -> Vec<u8> {
        self.slots
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    /// Number of slots that have been hit at least once.
    pub fn count_nonzero(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.load(Ordering::Relaxed) != 0)
            .count()
    }
}
