//! Lock-free idle detection
//!
//! One `u32` counter per session and a reserved sentinel value. Every
//! successful send or receive bumps the counter ([`IdleGauge::touch`], the
//! hot path, one atomic add). The keepalive timer swaps the sentinel in on
//! each tick: finding the sentinel already there means no activity happened
//! since the previous tick.
//!
//! The precision is deliberately coarse: activity landing right around a
//! tick boundary can be credited to either interval, so idleness is only
//! detected within plus or minus one tick. Tests pin this trade-off down.

use std::sync::atomic::{AtomicU32, Ordering};

const SENTINEL: u32 = u32::MAX;

/// Activity counter with sentinel-swap idle detection.
#[derive(Debug)]
pub struct IdleGauge {
    counter: AtomicU32,
}

impl IdleGauge {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(0),
        }
    }

    /// Record one unit of activity. Never leaves the counter at the
    /// sentinel value.
    pub fn touch(&self) {
        let prev = self.counter.fetch_add(1, Ordering::AcqRel);
        if prev == SENTINEL - 1 {
            // Landed exactly on the sentinel; step past it.
            self.counter.fetch_add(1, Ordering::AcqRel);
        }
    }

    /// One keepalive tick. Returns true when no [`IdleGauge::touch`] has
    /// happened since the previous tick.
    pub fn tick(&self) -> bool {
        self.counter.swap(SENTINEL, Ordering::AcqRel) == SENTINEL
    }
}

impl Default for IdleGauge {
    fn default() -> Self {
        Self::new()
    }
}
