// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::any::Any;
use core::fmt;

/// Error returned when constructing a fiber fails.
#[derive(Debug)]
pub enum SpawnError {
    /// The computation type has not been processed by the instrumentation
    /// toolchain and therefore cannot cooperate with capture and replay.
    Uninstrumented(&'static str),
    /// The target pool has been shut down.
    Shutdown,
}

impl fmt::Display for SpawnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpawnError::Uninstrumented(ty) => {
                write!(f, "computation `{ty}` is not instrumented")
            }
            SpawnError::Shutdown => f.write_str("pool was shut down"),
        }
    }
}

impl core::error::Error for SpawnError {}

/// Error returned by [`Fiber::join`] and [`Fiber::join_timeout`].
///
/// [`Fiber::join`]: crate::fiber::Fiber::join
/// [`Fiber::join_timeout`]: crate::fiber::Fiber::join_timeout
pub enum JoinError {
    /// The fiber's computation panicked; the payload is carried to the joiner.
    Panicked(Box<dyn Any + Send + 'static>),
    /// The fiber was interrupted while suspended and terminated at its next
    /// resume point.
    Interrupted,
    /// The join deadline elapsed before the fiber terminated. The fiber
    /// itself is unaffected and may still be joined later.
    Timeout,
    /// The fiber's output was already taken by an earlier join.
    AlreadyJoined,
}

impl JoinError {
    /// Returns `true` if the join failed because the deadline elapsed.
    pub fn is_timeout(&self) -> bool {
        matches!(self, JoinError::Timeout)
    }

    /// Returns `true` if the fiber terminated through an interrupt.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, JoinError::Interrupted)
    }

    /// Returns `true` if the fiber's computation panicked.
    pub fn is_panic(&self) -> bool {
        matches!(self, JoinError::Panicked(_))
    }

    /// Consumes the error, returning the panic payload.
    ///
    /// # Panics
    ///
    /// Panics if this error does not carry a panic payload; check with
    /// [`JoinError::is_panic`] first.
    pub fn into_panic(self) -> Box<dyn Any + Send + 'static> {
        match self {
            JoinError::Panicked(payload) => payload,
            other => panic!("`JoinError::into_panic` called on {other}"),
        }
    }
}

impl fmt::Debug for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => f.write_str("Panicked(..)"),
            JoinError::Interrupted => f.write_str("Interrupted"),
            JoinError::Timeout => f.write_str("Timeout"),
            JoinError::AlreadyJoined => f.write_str("AlreadyJoined"),
        }
    }
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(_) => f.write_str("fiber panicked"),
            JoinError::Interrupted => f.write_str("fiber was interrupted"),
            JoinError::Timeout => f.write_str("join deadline elapsed"),
            JoinError::AlreadyJoined => f.write_str("fiber output already taken"),
        }
    }
}

impl core::error::Error for JoinError {}

/// The calling thread is not executing a fiber slice.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NotInFiber(pub(crate) ());

impl fmt::Display for NotInFiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("not in a fiber")
    }
}

impl core::error::Error for NotInFiber {}

/// Error returned by [`Fiber::try_snapshot`].
///
/// [`Fiber::try_snapshot`]: crate::fiber::Fiber::try_snapshot
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SnapshotError {
    /// The fiber is currently executing a slice; a running fiber has live
    /// state on a worker stack and cannot be captured.
    Running,
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::Running => f.write_str("fiber is running"),
        }
    }
}

impl core::error::Error for SnapshotError {}
