//! C8 — a shared "latest message timestamp" cell, updated by the
//! dispatcher and read by any number of subscribers without locking.
//!
//! Grounded in `DLTTimeValue`, whose docstring explains why a raw
//! shared scalar beats routing the value through a queue or pipe: the
//! value is overwritten far more often than it's read, and readers
//! only ever want the latest value, never a history. A `Mutex<f64>`
//! would work too, but the atomic bit-pattern trick is the direct Rust
//! equivalent of that same "skip the synchronization machinery for a
//! single scalar" tradeoff.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner(AtomicU64);

/// A clonable handle to a shared timestamp cell (spec §4.8).
#[derive(Clone, Debug, Default)]
pub struct TimeCell(Arc<Inner>);

impl TimeCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, seconds_since_epoch: f64) {
        self.0 .0.store(seconds_since_epoch.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0 .0.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_round_trips_through_bit_pattern() {
        let cell = TimeCell::new();
        assert_eq!(cell.get(), 0.0);
        cell.set(1_700_000_000.123456);
        assert_eq!(cell.get(), 1_700_000_000.123456);
    }

    #[test]
    fn clones_share_the_same_underlying_value() {
        let cell = TimeCell::new();
        let clone = cell.clone();
        cell.set(42.0);
        assert_eq!(clone.get(), 42.0);
    }
}
