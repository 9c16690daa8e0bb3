// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use crate::park::{Park, StdPark};
use core::fmt;
use static_assertions::assert_impl_all;
use std::time::Instant;

const STATE_EMPTY: usize = 0;
const STATE_PARKED: usize = 1;
const STATE_NOTIFIED: usize = 2;

/// Parks the thread that owns it; notifications arriving before the park are
/// consumed by the next park instead of being lost.
pub(crate) struct Parker<P>(Arc<Inner<P>>);

/// Handle through which any thread can wake the parker's owner.
pub(crate) struct UnparkToken<P>(Parker<P>);
assert_impl_all!(UnparkToken<StdPark>: Send, Sync);

struct Inner<P> {
    state: AtomicUsize,
    park_impl: P,
}

// === impl Parker ===

impl<P> fmt::Debug for Parker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parker")
            .field("state", &self.0.describe_state())
            .finish_non_exhaustive()
    }
}

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<P: Park> Parker<P> {
    pub(crate) fn new(park_impl: P) -> Self {
        Self(Arc::new(Inner {
            state: AtomicUsize::new(STATE_EMPTY),
            park_impl,
        }))
    }

    /// Parks until notified. Consumes a pending notification immediately.
    #[inline]
    pub(crate) fn park(&self) {
        self.0.park();
    }

    /// Parks until notified or until `deadline` passes, whichever happens
    /// first. Returns `true` when a notification was consumed and `false`
    /// when the deadline elapsed.
    #[inline]
    pub(crate) fn park_deadline(&self, deadline: Instant) -> bool {
        self.0.park_deadline(deadline)
    }

    /// Converts this `Parker` into an [`UnparkToken`] that wakes its owner.
    #[inline]
    pub(crate) fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self)
    }
}

// === impl UnparkToken ===

impl<P> fmt::Debug for UnparkToken<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnparkToken").field("parker", &self.0).finish()
    }
}

impl<P> Clone for UnparkToken<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<P: Park> UnparkToken<P> {
    /// Wakes the owning thread. If the owner is not currently parked the
    /// notification is latched and consumed by its next park.
    #[inline]
    pub(crate) fn unpark(&self) {
        self.0.0.unpark();
    }
}

// === impl Inner ===

impl<P> Inner<P> {
    fn describe_state(&self) -> &'static str {
        match self.state.load(Ordering::Acquire) {
            STATE_EMPTY => "<empty>",
            STATE_PARKED => "<parked>",
            STATE_NOTIFIED => "<notified>",
            _ => "<unknown>",
        }
    }
}

impl<P: Park> Inner<P> {
    /// Consumes a pending notification, returning `true` if there was one.
    fn consume_notification(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_NOTIFIED,
                STATE_EMPTY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Publishes the parked state, or consumes a notification that raced in.
    /// Returns `false` when a notification was consumed and the caller
    /// should not block.
    fn publish_parked(&self) -> bool {
        match self.state.compare_exchange(
            STATE_EMPTY,
            STATE_PARKED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(STATE_NOTIFIED) => {
                // We must read here, even though we know it will be
                // `NOTIFIED`: the swap synchronizes with the unpark that set
                // it, so writes made before that unpark are visible after we
                // return.
                let old = self.state.swap(STATE_EMPTY, Ordering::SeqCst);
                debug_assert_eq!(old, STATE_NOTIFIED, "park state changed unexpectedly");
                false
            }
            Err(actual) => panic!("inconsistent park state; actual = {actual}"),
        }
    }

    fn park(&self) {
        tracing::trace!(state = self.describe_state(), "parking execution context...");

        if self.consume_notification() {
            return;
        }
        if !self.publish_parked() {
            return;
        }

        loop {
            self.park_impl.park();

            if self.consume_notification() {
                return;
            }

            tracing::trace!("spurious wakeup, going back to sleep...");
        }
    }

    fn park_deadline(&self, deadline: Instant) -> bool {
        tracing::trace!(
            state = self.describe_state(),
            "parking execution context until {deadline:?}...",
        );

        if self.consume_notification() {
            return true;
        }
        if !self.publish_parked() {
            return true;
        }

        loop {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                // deadline elapsed; retract the parked state unless a
                // notification snuck in at the wire
                return match self.state.compare_exchange(
                    STATE_PARKED,
                    STATE_EMPTY,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                ) {
                    Ok(_) => false,
                    Err(_) => {
                        let old = self.state.swap(STATE_EMPTY, Ordering::SeqCst);
                        debug_assert_eq!(old, STATE_NOTIFIED);
                        true
                    }
                };
            };

            self.park_impl.park_timeout(remaining);

            if self.consume_notification() {
                return true;
            }
        }
    }

    fn unpark(&self) {
        match self.state.swap(STATE_NOTIFIED, Ordering::SeqCst) {
            STATE_PARKED => self.park_impl.unpark(),
            STATE_EMPTY | STATE_NOTIFIED => {
                // owner is awake; the latched notification is consumed by
                // its next park
            }
            actual => panic!("inconsistent state in unpark; actual = {actual}"),
        }
    }
}

#[cfg(test)]
#[cfg(not(loom))]
mod tests {
    use super::*;
    use crate::loom::thread;
    use core::time::Duration;
    use std::sync::mpsc;

    #[test]
    fn parking_basically_works() {
        // Thread A constructs the Parker, sends an UnparkToken for it over a
        // channel, and parks itself. Thread B receives the token and wakes A.
        let (tx, rx) = mpsc::channel();

        let a = thread::spawn(move || {
            let parker = Parker::new(StdPark::for_current());
            tx.send(parker.clone().into_unpark()).unwrap();
            parker.park();
        });

        let b = thread::spawn(move || {
            let unpark = rx.recv().unwrap();
            unpark.unpark();
        });

        a.join().unwrap();
        b.join().unwrap();
    }

    #[test]
    fn notification_before_park_is_consumed() {
        let parker = Parker::new(StdPark::for_current());
        parker.clone().into_unpark().unpark();
        // must not block
        parker.park();
    }

    #[test]
    fn deadline_park_times_out() {
        let parker = Parker::new(StdPark::for_current());
        let start = Instant::now();
        let notified = parker.park_deadline(Instant::now() + Duration::from_millis(20));
        assert!(!notified);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn deadline_park_wakes_early_when_notified() {
        let parker = Parker::new(StdPark::for_current());
        let token = parker.clone().into_unpark();

        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            token.unpark();
        });

        let notified = parker.park_deadline(Instant::now() + Duration::from_secs(5));
        assert!(notified);
        waker.join().unwrap();
    }
}
