//! Hybrid clock contract and the default monotonic implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::types::HybridTime;

/// Source of hybrid timestamps for one node.
///
/// `observe` folds a remotely assigned timestamp into the local clock so that
/// subsequent reads never run behind a value this node has already seen.
pub trait Clock: Send + Sync {
    fn now(&self) -> HybridTime;
    fn observe(&self, ht: HybridTime);
}

/// Monotonic hybrid clock backed by the system clock.
///
/// Reads advance the logical component when the physical clock has not moved
/// (or has moved backwards), so two consecutive `now` calls never return the
/// same value.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    pub fn new() -> Self {
        Self::default()
    }

    fn physical_now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros()
            .min(u128::from(HybridTime::MAX_PHYSICAL_MICROS)) as u64
    }
}

impl Clock for HybridClock {
    fn now(&self) -> HybridTime {
        let physical = HybridTime::from_micros(Self::physical_now()).raw();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let next = physical.max(prev.saturating_add(1));
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return HybridTime::from_raw(next),
                Err(observed) => prev = observed,
            }
        }
    }

    fn observe(&self, ht: HybridTime) {
        if ht.is_valid() && ht != HybridTime::MAX {
            self.last.fetch_max(ht.raw(), Ordering::AcqRel);
        }
    }
}
