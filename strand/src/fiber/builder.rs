// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::continuation::ContinuationStack;
use crate::error::SpawnError;
use crate::fiber::{Fiber, Id, Inner, Lifecycle, Runnable, Shared, Suspendable};
use crate::instrument;
use crate::local::{self, LocalViews};
use crate::pool::Pool;
use crate::task::Task;
use core::any::type_name;
use core::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicU8};
use std::sync::{Arc, Mutex};

const DEFAULT_STACK_CAPACITY: usize = 8;

/// Constructs fibers for one pool.
pub struct Builder<'a> {
    pool: &'a Pool,
    name: Option<&'a str>,
    stack_capacity: usize,
}

// === impl Builder ===

impl<'a> Builder<'a> {
    pub fn new(pool: &'a Pool) -> Self {
        Self {
            pool,
            name: None,
            stack_capacity: DEFAULT_STACK_CAPACITY,
        }
    }

    /// Override the name of fibers built by this builder.
    ///
    /// By default, fibers are unnamed.
    pub fn name(mut self, name: &'a str) -> Self {
        self.name = Some(name);
        self
    }

    /// Override the number of continuation frames to preallocate. This is a
    /// capacity hint only; the captured stack grows as deep as the
    /// computation's instrumented call path requires.
    pub fn stack_capacity(mut self, frames: usize) -> Self {
        self.stack_capacity = frames;
        self
    }

    /// Builds a fiber in the NEW state; it will not execute until
    /// [`Fiber::start`] is called.
    ///
    /// The constructing context determines the fiber's parent link and its
    /// inheritable-local snapshot: built inside another fiber's slice, the
    /// new fiber inherits from that fiber; built on a plain thread, it
    /// inherits the thread's view.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError::Uninstrumented`] when the computation type does
    /// not carry the instrumentation marker, and [`SpawnError::Shutdown`]
    /// when the pool no longer accepts work.
    #[track_caller]
    pub fn build<C: Suspendable>(&self, computation: C) -> Result<Fiber<C>, SpawnError> {
        if !C::INSTRUMENTED {
            return Err(SpawnError::Uninstrumented(type_name::<C>()));
        }
        if self.pool.is_shutdown() {
            return Err(SpawnError::Shutdown);
        }
        instrument::register(type_name::<C>());

        let id = Id::next();
        let location = Location::caller();
        let span = tracing::trace_span!(
            "fiber",
            fiber.id = id.as_u64(),
            fiber.name = ?self.name,
            fiber.output = %type_name::<C::Output>(),
            loc.file = location.file(),
            loc.line = location.line(),
        );

        let parent = local::current_fiber();
        let task = Arc::new(Task::new(self.pool.clone()));

        let inner = Arc::new(Inner {
            shared: Shared {
                id,
                name: self.name.map(String::from),
                lifecycle: AtomicU8::new(Lifecycle::New as u8),
                interrupted: AtomicBool::new(false),
                task: Arc::clone(&task),
                parent: parent.as_ref().map(|parent| Arc::downgrade(&parent.0)),
                views: Mutex::new(LocalViews::inheriting(local::snapshot_inheritable())),
                stack: Mutex::new(ContinuationStack::with_capacity(self.stack_capacity)),
                pending: Mutex::new(None),
                joiners: Mutex::new(Vec::new()),
                handler: Mutex::new(None),
                span,
            },
            computation: Mutex::new(Some(computation)),
            result: Mutex::new(None),
        });

        let erased: Arc<dyn Runnable> = inner.clone() as Arc<dyn Runnable>;
        task.bind(Arc::downgrade(&erased));

        tracing::trace!(fiber.id = id.as_u64(), parent = ?parent, "built fiber");
        Ok(Fiber { inner })
    }

    /// Builds and immediately starts a fiber.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`build`](Self::build).
    #[track_caller]
    pub fn spawn<C: Suspendable>(&self, computation: C) -> Result<Fiber<C>, SpawnError> {
        let fiber = self.build(computation)?;
        fiber.start();
        Ok(fiber)
    }
}
