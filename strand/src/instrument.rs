// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The interface consumed from the instrumentation toolchain.
//!
//! A computation may only suspend if every function between the slice entry
//! and the suspension primitive cooperates with the continuation protocol.
//! The toolchain that guarantees this is an external collaborator; this
//! module is the registry it feeds: which frame owners are instrumented,
//! and which are waived (known-safe without instrumentation).
//!
//! Frame owners are identified by tag. By convention a computation's own
//! frames use `core::any::type_name` of the computation type (registered
//! automatically at fiber construction when the type carries the
//! [`Suspendable::INSTRUMENTED`] marker); standalone suspendable helpers
//! register their tags explicitly.
//!
//! Verification is off by default. When enabled, every park walks the
//! captured frames and fails fast on the first owner that is neither
//! registered nor waived — the runtime analogue of finding an
//! uninstrumented class on a suspendable path.
//!
//! [`Suspendable::INSTRUMENTED`]: crate::fiber::Suspendable::INSTRUMENTED

use crate::continuation::Frame;
use once_cell::sync::Lazy;
use std::collections::HashSet;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

static VERIFY: AtomicBool = AtomicBool::new(false);

static REGISTRY: Lazy<RwLock<Registry>> = Lazy::new(|| {
    let mut registry = Registry {
        instrumented: HashSet::new(),
        waived: HashSet::new(),
    };
    // the runtime's own suspendable frames
    registry.waived.insert(crate::fiber::SLEEP_FRAME);
    RwLock::new(registry)
});

struct Registry {
    instrumented: HashSet<&'static str>,
    waived: HashSet<&'static str>,
}

/// Marks a frame owner as instrumented.
pub fn register(owner: &'static str) {
    REGISTRY
        .write()
        .expect("instrumentation registry poisoned")
        .instrumented
        .insert(owner);
}

/// Adds a frame owner to the waiver list: it may appear on a suspendable
/// path without being instrumented.
pub fn waive(owner: &'static str) {
    REGISTRY
        .write()
        .expect("instrumentation registry poisoned")
        .waived
        .insert(owner);
}

/// `true` if the owner has been registered as instrumented.
pub fn is_instrumented(owner: &str) -> bool {
    REGISTRY
        .read()
        .expect("instrumentation registry poisoned")
        .instrumented
        .contains(owner)
}

/// `true` if the owner is on the waiver list.
pub fn is_waived(owner: &str) -> bool {
    REGISTRY
        .read()
        .expect("instrumentation registry poisoned")
        .waived
        .contains(owner)
}

/// Enables or disables the park-time frame walk.
pub fn set_verification(enabled: bool) {
    VERIFY.store(enabled, Ordering::Release);
}

pub(crate) fn verification_enabled() -> bool {
    VERIFY.load(Ordering::Acquire)
}

/// Walks the captured frames of a parking fiber and fails fast on the first
/// owner that is neither instrumented nor waived.
///
/// # Panics
///
/// Panics on the first offending frame; an uninstrumented function on a
/// suspendable path is a fatal misconfiguration, not a user error.
pub(crate) fn verify_frames<'stack>(frames: impl Iterator<Item = &'stack Frame>) {
    let registry = REGISTRY.read().expect("instrumentation registry poisoned");
    for frame in frames {
        let owner = frame.owner();
        assert!(
            registry.instrumented.contains(owner) || registry.waived.contains(owner),
            "uninstrumented frame `{owner}` on a suspendable path"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_and_waivers() {
        register("strand::tests::registered");
        waive("strand::tests::waived");

        assert!(is_instrumented("strand::tests::registered"));
        assert!(!is_instrumented("strand::tests::waived"));
        assert!(is_waived("strand::tests::waived"));
        assert!(!is_waived("strand::tests::registered"));
        assert!(!is_instrumented("strand::tests::unknown"));
    }

    #[test]
    fn runtime_sleep_frame_is_pre_waived() {
        assert!(is_waived(crate::fiber::SLEEP_FRAME));
    }

    #[test]
    #[should_panic(expected = "uninstrumented frame")]
    fn unregistered_owner_fails_verification() {
        let mut stack = crate::continuation::ContinuationStack::with_capacity(1);
        stack.enter("strand::instrument::tests::never_registered", 0, 0);
        verify_frames(stack.frames());
    }
}
