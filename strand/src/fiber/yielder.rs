// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::continuation::{ContinuationStack, Frame, Suspended};
use crate::fiber::{FiberRef, ParkKind, PendingPark, SLEEP_FRAME, Shared};
use crate::task::Blocker;
use core::cell::RefCell;
use core::time::Duration;
use std::time::Instant;

/// The suspension capability of an executing slice.
///
/// A `Yielder` is lent to the computation for the duration of one slice; it
/// is the only way to suspend, which is what makes "park outside a fiber"
/// unrepresentable for instrumented code. It also fronts the fiber's
/// [`ContinuationStack`] for the generated prologues and epilogues.
///
/// Every suspension primitive returns `Err(`[`Suspended`]`)` when it
/// actually suspends; the caller must save its frame and propagate the
/// signal outward. On the resumed slice the re-executed primitive returns
/// `Ok(())` and execution continues normally.
pub struct Yielder<'slice> {
    stack: RefCell<&'slice mut ContinuationStack>,
    shared: &'slice Shared,
}

// === impl Yielder ===

impl<'slice> Yielder<'slice> {
    pub(crate) fn new(stack: &'slice mut ContinuationStack, shared: &'slice Shared) -> Self {
        Self {
            stack: RefCell::new(stack),
            shared,
        }
    }

    /// Instrumented-function prologue; see [`ContinuationStack::enter`].
    pub fn enter(&self, owner: &'static str, words: usize, refs: usize) -> u32 {
        self.stack.borrow_mut().enter(owner, words, refs)
    }

    /// Records the resume index and live locals of the current frame while
    /// the suspension signal unwinds; see [`ContinuationStack::save`].
    pub fn save<R>(&self, resume_at: u32, store: impl FnOnce(&mut Frame) -> R) -> R {
        store(self.stack.borrow_mut().save(resume_at))
    }

    /// Hands back the saved locals of the current frame in a resume arm; see
    /// [`ContinuationStack::restore`].
    pub fn restore<R>(&self, load: impl FnOnce(&mut Frame) -> R) -> R {
        load(self.stack.borrow_mut().restore())
    }

    /// Instrumented-function epilogue; see [`ContinuationStack::leave`].
    pub fn leave(&self) {
        self.stack.borrow_mut().leave();
    }

    /// The fiber this slice belongs to.
    pub fn fiber(&self) -> FiberRef {
        self.shared
            .task()
            .fiber()
            .expect("executing fiber has no self-reference")
    }

    /// Parks the fiber, optionally recording what it waits on.
    pub fn park(&self, blocker: Option<Blocker>) -> Result<(), Suspended> {
        self.park_inner(blocker, None, None, ParkKind::Park)
    }

    /// Parks the fiber until unparked or until `deadline` passes. Timeouts
    /// are expressed as absolute monotonic deadlines so that re-parking
    /// after a spurious wake recomputes the remaining time correctly.
    pub fn park_deadline(
        &self,
        blocker: Option<Blocker>,
        deadline: Instant,
    ) -> Result<(), Suspended> {
        self.park_inner(blocker, Some(deadline), None, ParkKind::Park)
    }

    /// [`park_deadline`](Self::park_deadline) with a relative timeout.
    pub fn park_timeout(
        &self,
        blocker: Option<Blocker>,
        timeout: Duration,
    ) -> Result<(), Suspended> {
        self.park_inner(blocker, Some(Instant::now() + timeout), None, ParkKind::Park)
    }

    /// Parks with a one-shot action that runs after the park has atomically
    /// committed — the hook synchronization primitives use to publish the
    /// fiber to a wait queue only once it is safely parked, closing the
    /// lost-wakeup window between "decides to wait" and "can be woken".
    ///
    /// When a racing unpark defeats the commit the action is dropped
    /// unexecuted: the fiber was never parked and the waker has already been
    /// consumed.
    pub fn park_with(
        &self,
        blocker: Option<Blocker>,
        post_park: impl FnOnce() + Send + 'static,
        deadline: Option<Instant>,
    ) -> Result<(), Suspended> {
        self.park_inner(blocker, deadline, Some(Box::new(post_park)), ParkKind::Park)
    }

    /// Relinquishes the worker without waiting on anything; the fiber goes
    /// straight back to the run queue.
    pub fn yield_now(&self) -> Result<(), Suspended> {
        self.park_inner(None, None, None, ParkKind::Yield)
    }

    /// Suspends the fiber for at least `duration`.
    ///
    /// Implemented as a loop around deadline parking: the deadline is
    /// captured once from the monotonic clock and carried in the sleep
    /// frame, and every spurious wake recomputes the remaining time and
    /// parks again.
    pub fn sleep(&self, duration: Duration) -> Result<(), Suspended> {
        const RESUME_SLEEP: u32 = 1;

        let deadline = match self.enter(SLEEP_FRAME, 0, 1) {
            0 => Instant::now() + duration,
            RESUME_SLEEP => {
                let deadline = self.restore(|frame| frame.take_obj::<Instant>(0));
                // the loop below may find the deadline already behind us and
                // never re-park, so the replay ends here either way
                self.stack.borrow_mut().finish_replay();
                deadline
            }
            resume => unreachable!("corrupt resume index {resume} in sleep frame"),
        };

        while Instant::now() < deadline {
            if let Err(signal) = self.park_inner(None, Some(deadline), None, ParkKind::Park) {
                self.save(RESUME_SLEEP, |frame| frame.put_obj(0, deadline));
                return Err(signal);
            }
        }
        self.leave();
        Ok(())
    }

    fn park_inner(
        &self,
        blocker: Option<Blocker>,
        deadline: Option<Instant>,
        post_park: Option<Box<dyn FnOnce() + Send>>,
        kind: ParkKind,
    ) -> Result<(), Suspended> {
        {
            let mut stack = self.stack.borrow_mut();
            if stack.at_resume_point() {
                // this call site is what the fiber parked in last slice;
                // consume the replay and continue past it
                stack.finish_replay();
                tracing::trace!("resumed at former suspension point");
                return Ok(());
            }
            assert!(
                !stack.is_replaying(),
                "suspension signalled while replaying captured frames"
            );
            assert!(
                stack.depth() > 0,
                "suspension signalled outside any instrumented frame"
            );
        }

        if let Some(blocker) = blocker {
            self.shared.task().set_blocker(blocker);
        }
        *self.shared.pending.lock().expect("pending park poisoned") = Some(PendingPark {
            kind,
            deadline,
            post_park,
        });
        self.shared.task().state().signal_park();
        tracing::trace!(?kind, ?deadline, "suspension signalled");
        Err(Suspended::new())
    }
}
