// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The pool-submittable unit that mediates a fiber's state transitions with
//! the scheduler.

pub(crate) mod state;

use crate::fiber::{FiberRef, Runnable};
use crate::pool::Pool;
use crate::task::state::{State, UnparkAction};
use core::any::Any;
use core::fmt;
use once_cell::sync::OnceCell;
use std::sync::{Arc, Mutex, Weak};

/// An opaque object identifying what a fiber is waiting on.
///
/// Purely informational for diagnostics, plus an identity handle for
/// targeted wake-ups: [`FiberRef::run_inline`] only claims a fiber whose
/// blocker is pointer-identical to the one the caller expects.
pub type Blocker = Arc<dyn Any + Send + Sync>;

/// Binds one fiber to the worker pool.
///
/// The task owns the atomic state word whose lost-wakeup-safe transitions
/// are described in [`state`]; it holds only a weak reference back to its
/// fiber so a stale timeout or unpark can never revive a fiber the rest of
/// the program has dropped.
pub(crate) struct Task {
    state: State,
    blocker: Mutex<Option<Blocker>>,
    fiber: OnceCell<Weak<dyn Runnable>>,
    pool: Pool,
}

// === impl Task ===

impl Task {
    pub(crate) fn new(pool: Pool) -> Self {
        Self {
            state: State::new(),
            blocker: Mutex::new(None),
            fiber: OnceCell::new(),
            pool,
        }
    }

    /// Installs the back-reference to the owning fiber. Called exactly once
    /// during fiber construction.
    pub(crate) fn bind(&self, fiber: Weak<dyn Runnable>) {
        self.fiber
            .set(fiber)
            .unwrap_or_else(|_| unreachable!("task already bound to a fiber"));
    }

    pub(crate) fn state(&self) -> &State {
        &self.state
    }

    pub(crate) fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Upgrades the weak fiber back-reference, if the fiber is still alive.
    pub(crate) fn fiber(&self) -> Option<FiberRef> {
        let weak = self.fiber.get()?;
        Some(FiberRef(weak.upgrade()?))
    }

    /// Delivers a wakeup. A parked task becomes runnable and is resubmitted;
    /// a wakeup racing a running or parking slice is latched so the park
    /// path converts its intended PARKED into RUNNABLE; anything else is a
    /// no-op.
    pub(crate) fn unpark(&self) {
        match self.state.unpark() {
            UnparkAction::Resubmit => {
                tracing::trace!(task = ?self, "unparked, resubmitting");
                if let Some(fiber) = self.fiber() {
                    self.pool.resubmit(fiber);
                }
            }
            UnparkAction::Latched => {
                tracing::trace!(task = ?self, "unpark latched");
            }
            UnparkAction::NoOp => {}
        }
    }

    /// Returns `true` iff this call moved the task from PARKED to RUNNABLE.
    /// Used by synchronization primitives that must know whether they were
    /// the wake. A failed attempt leaves no latch behind.
    pub(crate) fn try_unpark(&self) -> bool {
        if self.state.try_unpark() {
            if let Some(fiber) = self.fiber() {
                self.pool.resubmit(fiber);
            }
            true
        } else {
            false
        }
    }

    pub(crate) fn set_blocker(&self, blocker: Blocker) {
        *self.blocker.lock().expect("blocker mutex poisoned") = Some(blocker);
    }

    pub(crate) fn take_blocker(&self) -> Option<Blocker> {
        self.blocker.lock().expect("blocker mutex poisoned").take()
    }

    pub(crate) fn blocker(&self) -> Option<Blocker> {
        self.blocker.lock().expect("blocker mutex poisoned").clone()
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
