// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![expect(
    impl_trait_overcaptures,
    reason = "mycelium_bitfield is not updated to edition 2024 yet"
)]

use crate::loom::sync::atomic::{AtomicU32, Ordering};
use core::fmt;

/// Task state. The task stores its state in an atomic `u32` with the
/// following layout:
///
/// ```text
/// | 31         3 | 2              2 | 1     0 |
/// |   (unused)   | unpark pending   |  phase  |
/// ```
///
/// The acquire/release pairing on the word is what establishes that writes
/// made before a park commit happen-before reads made after the matching
/// unpark.
pub(crate) struct State {
    val: AtomicU32,
}

mycelium_bitfield::bitfield! {
    /// A snapshot of a task's current state.
    #[derive(PartialEq, Eq)]
    pub(crate) struct Snapshot<u32> {
        /// Scheduling phase of the task.
        pub(crate) const PHASE: Phase;
        /// If set, an unpark arrived while the task was leased or parking;
        /// the park path converts its intended PARKED into RUNNABLE instead.
        pub(crate) const UNPARK_PENDING: bool;
    }
}

/// Pool-visible phase of a parkable task.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum Phase {
    /// Eligible to be claimed by a worker.
    Runnable = 0b00,
    /// A worker owns the task for the duration of one slice.
    Leased = 0b01,
    /// The slice has signalled suspension; the park commit is pending.
    Parking = 0b10,
    /// Waiting for an unpark.
    Parked = 0b11,
}

/// Outcome of [`State::commit_park`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitAction {
    /// The task is parked; it will run again once unparked.
    Parked,
    /// An unpark raced the commit. The task is runnable again and the caller
    /// must resubmit it so no slice is skipped.
    WasUnparked,
}

/// Outcome of [`State::unpark`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UnparkAction {
    /// The task moved from parked to runnable; the caller must resubmit it.
    Resubmit,
    /// The task is mid-slice or mid-park; the wakeup was latched and the
    /// park path will observe it.
    Latched,
    /// The task was already runnable; the wakeup dissolves.
    NoOp,
}

// === impl State ===

impl State {
    /// Returns a task's initial state: runnable, no pending wakeup.
    pub(crate) fn new() -> Self {
        Self {
            val: AtomicU32::new(0),
        }
    }

    pub(crate) fn load(&self, ordering: Ordering) -> Snapshot {
        Snapshot(self.val.load(ordering))
    }

    /// RUNNABLE → LEASED. Returns `false` if another worker won the claim or
    /// the task is not currently runnable.
    pub(crate) fn claim(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::PHASE) != Phase::Runnable {
                return false;
            }
            s.set(Snapshot::PHASE, Phase::Leased);
            true
        })
    }

    /// PARKED → LEASED, used by the inline-resume path to take a parked task
    /// directly onto the calling thread.
    pub(crate) fn claim_parked(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::PHASE) != Phase::Parked {
                return false;
            }
            s.set(Snapshot::PHASE, Phase::Leased);
            true
        })
    }

    /// LEASED → PARKING. Called by the suspension primitive on the executing
    /// slice; a latched wakeup is preserved.
    pub(crate) fn signal_park(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::PHASE), Phase::Leased);
            s.set(Snapshot::PHASE, Phase::Parking);
        });
    }

    /// Finalizes a park at the slice boundary.
    ///
    /// The commit succeeds only if no wakeup arrived since the lease began;
    /// otherwise the task goes straight back to RUNNABLE and the caller
    /// resubmits it. This is the lost-wakeup guard: a wake racing ahead of
    /// the corresponding sleep defeats the commit instead of evaporating.
    pub(crate) fn commit_park(&self) -> CommitAction {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::PHASE), Phase::Parking);
            if s.get(Snapshot::UNPARK_PENDING) {
                s.set(Snapshot::PHASE, Phase::Runnable);
                s.set(Snapshot::UNPARK_PENDING, false);
                CommitAction::WasUnparked
            } else {
                s.set(Snapshot::PHASE, Phase::Parked);
                CommitAction::Parked
            }
        })
    }

    /// Finalizes a yield: the task never parks and goes straight back to the
    /// run queue.
    pub(crate) fn commit_yield(&self) {
        self.transition(|s| {
            debug_assert_eq!(s.get(Snapshot::PHASE), Phase::Parking);
            s.set(Snapshot::PHASE, Phase::Runnable);
            s.set(Snapshot::UNPARK_PENDING, false);
        });
    }

    /// LEASED → RUNNABLE at the end of a terminal slice. A wakeup latched
    /// during the final slice is discarded along with the task.
    pub(crate) fn release(&self) {
        self.transition(|s| {
            s.set(Snapshot::PHASE, Phase::Runnable);
            s.set(Snapshot::UNPARK_PENDING, false);
        });
    }

    /// Delivers a wakeup, whatever phase the task is in.
    pub(crate) fn unpark(&self) -> UnparkAction {
        self.transition(|s| match s.get(Snapshot::PHASE) {
            Phase::Parked => {
                s.set(Snapshot::PHASE, Phase::Runnable);
                UnparkAction::Resubmit
            }
            Phase::Leased | Phase::Parking => {
                s.set(Snapshot::UNPARK_PENDING, true);
                UnparkAction::Latched
            }
            Phase::Runnable => UnparkAction::NoOp,
        })
    }

    /// PARKED → RUNNABLE, and nothing else: returns `true` iff this call was
    /// the wake. Unlike [`unpark`](Self::unpark) a failed attempt leaves no
    /// latch behind.
    pub(crate) fn try_unpark(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::PHASE) != Phase::Parked {
                return false;
            }
            s.set(Snapshot::PHASE, Phase::Runnable);
            true
        })
    }

    /// Runs `transition` against the current state and commits the modified
    /// snapshot with a CAS, retrying from the fresh state on contention.
    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = self.load(Ordering::Acquire);
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current.0 == next.0 {
                return res;
            }

            match self.val.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot(actual),
            }
        }
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load(Ordering::Relaxed).fmt(f)
    }
}

// === impl Snapshot ===

impl Snapshot {
    pub(crate) fn phase(&self) -> Phase {
        self.get(Self::PHASE)
    }
}

// === impl Phase ===

impl mycelium_bitfield::FromBits<u32> for Phase {
    type Error = core::convert::Infallible;

    /// The number of bits required to represent a value of this type.
    const BITS: u32 = 2;

    #[inline]
    fn try_from_bits(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            b if b == Self::Runnable as u32 => Ok(Self::Runnable),
            b if b == Self::Leased as u32 => Ok(Self::Leased),
            b if b == Self::Parking as u32 => Ok(Self::Parking),
            b if b == Self::Parked as u32 => Ok(Self::Parked),
            _ => {
                // this should never happen unless the bitpacking code is broken
                unreachable!("invalid task phase {bits:#b}")
            }
        }
    }

    #[inline]
    fn into_bits(self) -> u32 {
        self as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;

    #[test]
    fn claim_is_exclusive() {
        loom::model(|| {
            let state = State::new();
            assert!(state.claim());
            assert!(!state.claim());
            assert_eq!(state.load(Ordering::Acquire).phase(), Phase::Leased);
        });
    }

    #[test]
    fn park_round_trip() {
        loom::model(|| {
            let state = State::new();
            assert!(state.claim());
            state.signal_park();
            assert_eq!(state.commit_park(), CommitAction::Parked);
            assert_eq!(state.unpark(), UnparkAction::Resubmit);
            // the timeout arriving later is a harmless no-op
            assert_eq!(state.unpark(), UnparkAction::NoOp);
            assert!(state.claim());
        });
    }

    #[test]
    fn unpark_during_lease_is_latched() {
        loom::model(|| {
            let state = State::new();
            assert!(state.claim());
            assert_eq!(state.unpark(), UnparkAction::Latched);
            assert!(state.load(Ordering::Acquire).get(Snapshot::UNPARK_PENDING));
            state.signal_park();
            assert_eq!(state.commit_park(), CommitAction::WasUnparked);
            assert_eq!(state.load(Ordering::Acquire).phase(), Phase::Runnable);
            assert!(!state.load(Ordering::Acquire).get(Snapshot::UNPARK_PENDING));
        });
    }

    #[test]
    fn try_unpark_only_wakes_parked_tasks() {
        loom::model(|| {
            let state = State::new();
            assert!(!state.try_unpark());
            assert!(state.claim());
            assert!(!state.try_unpark());
            state.signal_park();
            assert!(!state.try_unpark());
            assert_eq!(state.commit_park(), CommitAction::Parked);
            assert!(state.try_unpark());
            assert!(!state.try_unpark());
        });
    }

    #[test]
    fn racing_unpark_resumes_exactly_once() {
        loom::model(|| {
            let state = Arc::new(State::new());
            assert!(state.claim());
            state.signal_park();

            let remote = {
                let state = state.clone();
                loom::thread::spawn(move || state.unpark())
            };

            let commit = state.commit_park();
            let unpark = remote.join().unwrap();

            // exactly one side is responsible for the resubmission; a wake
            // that linearizes after the start of the park never gets lost
            let resumptions = usize::from(commit == CommitAction::WasUnparked)
                + usize::from(unpark == UnparkAction::Resubmit);
            assert_eq!(resumptions, 1);
            assert_eq!(state.load(Ordering::Acquire).phase(), Phase::Runnable);
        });
    }

    #[test]
    fn inline_claim_takes_a_parked_task() {
        loom::model(|| {
            let state = State::new();
            assert!(!state.claim_parked());
            assert!(state.claim());
            state.signal_park();
            assert_eq!(state.commit_park(), CommitAction::Parked);
            assert!(state.claim_parked());
            assert!(!state.claim_parked());
            assert_eq!(state.load(Ordering::Acquire).phase(), Phase::Leased);
        });
    }
}
