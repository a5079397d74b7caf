// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

const MAX_WAIT_UNITS: usize = 7;

/// Exponential busy-wait pacing for retry loops.
///
/// Each call to [`BusyBreaker::spin`] keeps the CPU busy twice as long as the
/// previous one, saturating at `2^MAX_WAIT_UNITS` spin hints. A restarting
/// transaction uses this between attempts so that the thread that currently
/// owns the contended metadata gets a chance to finish.
#[derive(Default)]
pub struct BusyBreaker {
    unit: AtomicUsize,
}

impl BusyBreaker {
    /// Keeps the CPU busy for the current backoff unit, then widens it.
    pub fn spin(&self) {
        let unit = self.unit.load(Ordering::Acquire);
        for _ in 0..(1usize << unit) {
            core::hint::spin_loop();
        }
        if unit < MAX_WAIT_UNITS {
            self.unit.store(unit + 1, Ordering::Release);
        }
    }

    /// Resets the backoff to the shortest unit.
    pub fn reset(&self) {
        self.unit.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::{BusyBreaker, MAX_WAIT_UNITS};
    use std::sync::atomic::Ordering;

    #[test]
    fn test_breaker_saturates() {
        let breaker = BusyBreaker::default();
        for _ in 0..(MAX_WAIT_UNITS * 3) {
            breaker.spin();
        }
        assert_eq!(breaker.unit.load(Ordering::Acquire), MAX_WAIT_UNITS);

        breaker.reset();
        assert_eq!(breaker.unit.load(Ordering::Acquire), 0);
    }
}
