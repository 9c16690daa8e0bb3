// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicUsize, Ordering};
use crate::park::parker::{Parker, UnparkToken};
use crate::park::Park;
use std::sync::Mutex;

/// Tracks idle execution contexts so that work submission can wake one.
#[derive(Debug)]
pub(crate) struct ParkingLot<P> {
    /// Number of parked contexts
    num_parked: AtomicUsize,
    unpark_tokens: Mutex<Vec<UnparkToken<P>>>,
}

// === impl ParkingLot ===

impl<P: Park + Send + Sync> ParkingLot<P> {
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            num_parked: AtomicUsize::new(0),
            unpark_tokens: Mutex::new(Vec::with_capacity(capacity)),
        }
    }

    pub(crate) fn num_parked(&self) -> usize {
        self.num_parked.load(Ordering::Acquire)
    }

    /// Parks the calling execution context until unparked through
    /// [`unpark_one`](Self::unpark_one) or [`unpark_all`](Self::unpark_all).
    ///
    /// `wake_now` is re-evaluated after the caller's token is published; when
    /// it reports `true` the park degrades to a state reset, so a submission
    /// racing the idle transition is never slept through.
    pub(crate) fn park(&self, parker: Parker<P>, wake_now: impl FnOnce() -> bool) {
        self.transition_to_parked();

        let token = parker.clone().into_unpark();
        self.unpark_tokens.lock().expect("parking lot poisoned").push(token.clone());

        if wake_now() {
            token.unpark();
        }
        parker.park();

        self.transition_from_parked();
    }

    /// Unparks a single execution context. Returns `true` when a target was
    /// unparked and `false` otherwise.
    ///
    /// The order in which parked targets are woken is not defined.
    pub(crate) fn unpark_one(&self) -> bool {
        let token = self.unpark_tokens.lock().expect("parking lot poisoned").pop();
        if let Some(token) = token {
            token.unpark();
            true
        } else {
            false
        }
    }

    /// Unparks every currently registered context, returning how many
    /// targets were woken.
    pub(crate) fn unpark_all(&self) -> usize {
        let tokens = {
            let mut lock = self.unpark_tokens.lock().expect("parking lot poisoned");
            core::mem::take(&mut *lock)
        };
        let unparked = tokens.len();
        for token in tokens {
            token.unpark();
        }
        unparked
    }

    fn transition_to_parked(&self) {
        let prev = self.num_parked.fetch_add(1, Ordering::Release);
        assert_ne!(prev, usize::MAX);
    }

    fn transition_from_parked(&self) {
        let prev = self.num_parked.fetch_sub(1, Ordering::Release);
        assert_ne!(prev, 0);
    }
}

#[cfg(test)]
#[cfg(not(loom))]
mod tests {
    use super::*;
    use crate::park::StdPark;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn parking_lot_basically_works() {
        static UNPARKED: AtomicUsize = AtomicUsize::new(0);

        let lot: Arc<ParkingLot<StdPark>> = Arc::new(ParkingLot::with_capacity(4));

        let joins: Vec<_> = (0..4)
            .map(|_| {
                let lot = lot.clone();
                thread::spawn(move || {
                    lot.park(Parker::new(StdPark::for_current()), || false);
                    UNPARKED.fetch_add(1, Ordering::Release);
                })
            })
            .collect();

        for _ in 0..4 {
            while !lot.unpark_one() {
                core::hint::spin_loop();
            }
        }

        for join in joins {
            join.join().unwrap();
        }

        assert_eq!(UNPARKED.load(Ordering::Acquire), 4);
    }

    #[test]
    fn racing_submission_is_not_slept_through() {
        let lot: Arc<ParkingLot<StdPark>> = Arc::new(ParkingLot::with_capacity(1));

        // `wake_now` observing work after the token is published must make
        // the park return immediately even though nobody calls unpark
        lot.park(Parker::new(StdPark::for_current()), || true);
    }
}
