// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fiber-local state and the worker context switch.
//!
//! Every thread carries an *active view*: two keyed maps, one for plain
//! fiber-locals and one for inheritable ones. [`FiberLocal`] and
//! [`FiberInheritable`] always read and write the active view of the calling
//! thread, so user code is oblivious to where the view came from.
//!
//! On slice entry the worker's active view is swapped with the fiber's saved
//! view; slice exit performs the identical swap back. The swap is symmetric
//! in both directions, which is what makes a lookup inside a slice
//! transparently address fiber state while the worker's own thread-locals
//! are untouched by the fiber's existence.

use crate::fiber::FiberRef;
use core::any::Any;
use core::cell::RefCell;
use core::fmt;
use core::mem;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static ACTIVE: RefCell<LocalViews> = RefCell::new(LocalViews::empty());
    static CURRENT_FIBER: RefCell<Option<FiberRef>> = const { RefCell::new(None) };
}

/// A key into fiber-local storage, analogous to `std::thread::LocalKey`.
///
/// Values are lazily initialized per fiber (or per plain thread, outside of
/// any slice) on first access.
pub struct FiberLocal<T: Send + 'static> {
    key: u64,
    init: fn() -> T,
}

/// A fiber-local key whose value is snapshotted into fibers constructed
/// while it is set, mirroring inheritable thread-local semantics.
pub struct FiberInheritable<T: Send + Clone + 'static> {
    key: u64,
    init: fn() -> T,
}

/// Clonable type-erased storage for inheritable values.
trait InheritedValue: Any + Send {
    fn clone_boxed(&self) -> Box<dyn InheritedValue>;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send + Clone> InheritedValue for T {
    fn clone_boxed(&self) -> Box<dyn InheritedValue> {
        Box::new(self.clone())
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// The two keyed maps making up one thread's (or one suspended fiber's) view
/// of fiber-local storage.
pub(crate) struct LocalViews {
    plain: HashMap<u64, Box<dyn Any + Send>>,
    inherited: HashMap<u64, Box<dyn InheritedValue>>,
}

// === impl LocalViews ===

impl LocalViews {
    fn empty() -> Self {
        Self {
            plain: HashMap::new(),
            inherited: HashMap::new(),
        }
    }

    /// The initial view of a new fiber: no plain locals, and the inheritable
    /// snapshot taken from the constructing context.
    pub(crate) fn inheriting(inherited: InheritedSnapshot) -> Self {
        Self {
            plain: HashMap::new(),
            inherited: inherited.0,
        }
    }
}

impl fmt::Debug for LocalViews {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalViews")
            .field("plain", &self.plain.len())
            .field("inherited", &self.inherited.len())
            .finish()
    }
}

/// A clone of the constructing context's inheritable view, taken at fiber
/// construction time.
pub(crate) struct InheritedSnapshot(HashMap<u64, Box<dyn InheritedValue>>);

/// Clones the calling context's inheritable view.
pub(crate) fn snapshot_inheritable() -> InheritedSnapshot {
    ACTIVE.with(|active| {
        let views = active.borrow();
        InheritedSnapshot(
            views
                .inherited
                .iter()
                .map(|(key, value)| (*key, value.clone_boxed()))
                .collect(),
        )
    })
}

/// The fiber currently executing a slice on this thread, if any.
pub(crate) fn current_fiber() -> Option<FiberRef> {
    CURRENT_FIBER.with(|current| current.borrow().clone())
}

// === impl FiberLocal ===

impl<T: Send + 'static> FiberLocal<T> {
    pub fn new(init: fn() -> T) -> Self {
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            init,
        }
    }

    /// Runs `f` with the value in the calling context's view, initializing
    /// it first if absent.
    ///
    /// # Panics
    ///
    /// Panics if the slot holds a value of a different type, which can only
    /// happen when two keys collide — i.e. never, short of memory
    /// corruption.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        ACTIVE.with(|active| {
            let mut views = active.borrow_mut();
            let slot = views
                .plain
                .entry(self.key)
                .or_insert_with(|| Box::new((self.init)()));
            f(slot
                .downcast_mut::<T>()
                .expect("fiber-local slot holds a value of a different type"))
        })
    }

    pub fn set(&self, value: T) {
        ACTIVE.with(|active| {
            active.borrow_mut().plain.insert(self.key, Box::new(value));
        });
    }

    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(|value| value.clone())
    }
}

// === impl FiberInheritable ===

impl<T: Send + Clone + 'static> FiberInheritable<T> {
    pub fn new(init: fn() -> T) -> Self {
        Self {
            key: NEXT_KEY.fetch_add(1, Ordering::Relaxed),
            init,
        }
    }

    /// Runs `f` with the inheritable value in the calling context's view,
    /// initializing it first if absent.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        ACTIVE.with(|active| {
            let mut views = active.borrow_mut();
            let slot = views
                .inherited
                .entry(self.key)
                .or_insert_with(|| Box::new((self.init)()));
            f(slot
                .as_any_mut()
                .downcast_mut::<T>()
                .expect("inheritable slot holds a value of a different type"))
        })
    }

    pub fn set(&self, value: T) {
        ACTIVE.with(|active| {
            active.borrow_mut().inherited.insert(self.key, Box::new(value));
        });
    }

    pub fn get(&self) -> T {
        self.with(|value| value.clone())
    }
}

// === context switch ===

/// Installs a fiber as the thread's current fiber and swaps its saved view
/// in; dropping the guard performs the identical swap back out, in
/// guaranteed-release fashion.
pub(crate) struct ContextGuard<'slice> {
    saved: &'slice Mutex<LocalViews>,
}

impl<'slice> ContextGuard<'slice> {
    /// # Panics
    ///
    /// Panics if this thread already has a current fiber; two slices on one
    /// worker is a structural impossibility and continuing would corrupt
    /// both fibers' views.
    pub(crate) fn enter(saved: &'slice Mutex<LocalViews>, fiber: FiberRef) -> Self {
        CURRENT_FIBER.with(|current| {
            let mut slot = current.borrow_mut();
            assert!(
                slot.is_none(),
                "worker already has a current fiber; refusing to install {fiber:?}"
            );
            *slot = Some(fiber);
        });

        let mut view = saved.lock().expect("fiber view poisoned");
        ACTIVE.with(|active| mem::swap(&mut *active.borrow_mut(), &mut *view));

        Self { saved }
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        let mut view = self.saved.lock().expect("fiber view poisoned");
        ACTIVE.with(|active| mem::swap(&mut *active.borrow_mut(), &mut *view));

        CURRENT_FIBER.with(|current| {
            let cleared = current.borrow_mut().take();
            debug_assert!(cleared.is_some(), "current fiber cleared twice");
        });
    }
}

#[cfg(test)]
#[cfg(not(loom))]
mod tests {
    use super::*;
    use lazy_static::lazy_static;

    lazy_static! {
        static ref COUNTER: FiberLocal<u32> = FiberLocal::new(|| 0);
        static ref TAG: FiberInheritable<String> = FiberInheritable::new(String::new);
    }

    #[test]
    fn plain_locals_are_per_thread_outside_fibers() {
        COUNTER.set(7);
        assert_eq!(COUNTER.get(), 7);

        std::thread::spawn(|| {
            // fresh view, fresh init
            assert_eq!(COUNTER.get(), 0);
        })
        .join()
        .unwrap();

        assert_eq!(COUNTER.get(), 7);
    }

    #[test]
    fn inheritable_snapshot_clones_the_view() {
        TAG.set(String::from("parent"));
        let snapshot = snapshot_inheritable();

        std::thread::spawn(move || {
            // install the snapshot as this thread's view, the way a new
            // fiber's initial view is built
            let views = Mutex::new(LocalViews::inheriting(snapshot));
            {
                let mut view = views.lock().unwrap();
                ACTIVE.with(|active| mem::swap(&mut *active.borrow_mut(), &mut *view));
            }
            assert_eq!(TAG.get(), "parent");

            // mutations stay in the snapshot
            TAG.set(String::from("child"));
            assert_eq!(TAG.get(), "child");
        })
        .join()
        .unwrap();

        assert_eq!(TAG.get(), "parent");
    }
}
