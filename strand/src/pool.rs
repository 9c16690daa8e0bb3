// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The work-stealing worker pool.
//!
//! Each worker owns a run queue; fibers made runnable from within a slice
//! land on the executing worker's queue, everything else goes through a
//! shared injector. Idle workers steal — from the injector first, then from
//! a randomly chosen victim — and park in a [`ParkingLot`] when the whole
//! pool is out of work. A fiber is bound to a pool, not to a worker: any
//! worker may run any slice of any fiber.

use crate::fiber::{FiberRef, SliceResult};
use crate::park::{Parker, ParkingLot, StdPark};
use core::cell::RefCell;
use core::fmt;
use core::mem;
use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerId>> = const { RefCell::new(None) };
}

struct WorkerId {
    core: Weak<Core>,
    index: usize,
}

/// A cheaply-cloneable handle to a worker pool.
#[derive(Clone)]
pub struct Pool {
    core: Arc<Core>,
}

struct Core {
    injector: SegQueue<FiberRef>,
    queues: Box<[Arc<SegQueue<FiberRef>>]>,
    lot: ParkingLot<StdPark>,
    stop: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct Worker {
    core: Arc<Core>,
    index: usize,
    parker: Parker<StdPark>,
    rng: fastrand::Rng,
}

// === impl Pool ===

impl Pool {
    /// Starts a pool with `workers` worker threads.
    ///
    /// # Panics
    ///
    /// Panics when `workers` is zero or a worker thread cannot be spawned.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a pool needs at least one worker");

        let queues: Box<[Arc<SegQueue<FiberRef>>]> =
            (0..workers).map(|_| Arc::new(SegQueue::new())).collect();
        let core = Arc::new(Core {
            injector: SegQueue::new(),
            queues,
            lot: ParkingLot::with_capacity(workers),
            stop: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        });

        let handles = (0..workers)
            .map(|index| {
                let core = Arc::clone(&core);
                std::thread::Builder::new()
                    .name(format!("strand-worker-{index}"))
                    .spawn(move || {
                        let mut worker = Worker::new(core, index);
                        worker.run();
                    })
                    .expect("failed to spawn worker thread")
            })
            .collect();
        *core
            .workers
            .lock()
            .expect("worker handle list poisoned") = handles;

        Self { core }
    }

    /// The number of workers in this pool.
    pub fn workers(&self) -> usize {
        self.core.queues.len()
    }

    /// A [`Builder`](crate::fiber::Builder) targeting this pool.
    pub fn fiber_builder(&self) -> crate::fiber::Builder<'_> {
        crate::fiber::Builder::new(self)
    }

    /// Stops the workers and waits for them to exit. Parked fibers are left
    /// in place; they simply never run again.
    ///
    /// Must not be called from a worker of this pool.
    pub fn shutdown(&self) {
        tracing::debug!("pool shutdown requested");
        self.core.stop.store(true, Ordering::Release);
        self.core.lot.unpark_all();

        let handles = mem::take(
            &mut *self
                .core
                .workers
                .lock()
                .expect("worker handle list poisoned"),
        );
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.core.stop.load(Ordering::Acquire)
    }

    /// Submits a newly started fiber.
    pub(crate) fn submit(&self, fiber: FiberRef) {
        tracing::trace!(fiber = ?fiber, "submitted");
        self.schedule(fiber);
    }

    /// Makes an unparked (or yield-deferred) fiber runnable again; may be
    /// called from any thread, and the next slice may run on any worker.
    pub(crate) fn resubmit(&self, fiber: FiberRef) {
        self.schedule(fiber);
    }

    fn schedule(&self, fiber: FiberRef) {
        match self.local_queue() {
            Some(queue) => queue.push(fiber),
            None => self.core.injector.push(fiber),
        }
        self.core.lot.unpark_one();
    }

    /// The executing worker's own queue, when called from a worker of this
    /// pool.
    fn local_queue(&self) -> Option<Arc<SegQueue<FiberRef>>> {
        CURRENT_WORKER.with(|current| {
            let current = current.borrow();
            let worker = current.as_ref()?;
            let core = worker.core.upgrade()?;
            if Arc::ptr_eq(&core, &self.core) {
                Some(Arc::clone(&core.queues[worker.index]))
            } else {
                None
            }
        })
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.core.queues.len())
            .field("idle", &self.core.lot.num_parked())
            .field("stopped", &self.core.stop.load(Ordering::Acquire))
            .finish()
    }
}

// === impl Worker ===

impl Worker {
    fn new(core: Arc<Core>, index: usize) -> Self {
        Self {
            core,
            index,
            parker: Parker::new(StdPark::for_current()),
            rng: fastrand::Rng::with_seed(0x9E37_79B9_7F4A_7C15 ^ index as u64),
        }
    }

    fn run(&mut self) {
        CURRENT_WORKER.with(|current| {
            *current.borrow_mut() = Some(WorkerId {
                core: Arc::downgrade(&self.core),
                index: self.index,
            });
        });

        let _span = tracing::debug_span!("worker main loop", worker = self.index).entered();

        loop {
            // drive the run queue until we're out of work
            if self.tick() {
                continue;
            }

            if self.core.stop.load(Ordering::Acquire) {
                tracing::debug!(worker = self.index, "stop signal received, shutting down");
                break;
            }

            tracing::trace!("going to sleep");
            let core = &self.core;
            core.lot.park(self.parker.clone(), || {
                core.stop.load(Ordering::Acquire)
                    || !core.injector.is_empty()
                    || core.queues.iter().any(|queue| !queue.is_empty())
            });
            tracing::trace!("woke up");
        }
    }

    /// Executes up to a budget of slices. Returns `true` when any ran.
    fn tick(&mut self) -> bool {
        const BUDGET: usize = 64;

        let mut executed = 0;
        while executed < BUDGET {
            let Some(fiber) = self.next_fiber() else { break };
            self.execute(fiber);
            executed += 1;
        }

        if executed > 0 {
            tracing::trace!(worker = self.index, executed, "worker tick");
        }
        executed > 0
    }

    fn next_fiber(&mut self) -> Option<FiberRef> {
        if let Some(fiber) = self.core.queues[self.index].pop() {
            return Some(fiber);
        }
        if let Some(fiber) = self.core.injector.pop() {
            return Some(fiber);
        }
        self.steal()
    }

    fn steal(&mut self) -> Option<FiberRef> {
        const ROUNDS: usize = 4;
        const MAX_BATCH: usize = 16;

        let num_queues = self.core.queues.len();
        if num_queues <= 1 {
            return None;
        }

        for _ in 0..ROUNDS {
            // start from a random victim so the pool doesn't gang up on
            // worker zero
            let start = self.rng.usize(..num_queues);
            for offset in 0..num_queues {
                let victim = (start + offset) % num_queues;
                if victim == self.index {
                    continue;
                }

                if let Some(first) = self.core.queues[victim].pop() {
                    // drag a batch over so the following ticks stay local
                    let mut moved = 0;
                    while moved < MAX_BATCH {
                        let Some(extra) = self.core.queues[victim].pop() else {
                            break;
                        };
                        self.core.queues[self.index].push(extra);
                        moved += 1;
                    }
                    tracing::trace!(victim, moved, "stole work");
                    return Some(first);
                }
            }
            core::hint::spin_loop();
        }

        None
    }

    fn execute(&self, fiber: FiberRef) {
        if !fiber.0.shared().task().state().claim() {
            // claimed by an inline resume, or a duplicate wakeup
            tracing::trace!(fiber = ?fiber, "stale run-queue entry");
            return;
        }

        match fiber.0.exec_slice() {
            SliceResult::Completed | SliceResult::Parked => {}
            SliceResult::Resubmit => self.core.queues[self.index].push(fiber),
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::continuation::Suspended;
    use crate::fiber::{Fiber, Yielder, instrumented};
    use std::sync::atomic::AtomicUsize;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn fibers_run_on_every_worker() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        const WORKERS: usize = 3;
        const FIBERS: usize = 64;

        let pool = Pool::new(WORKERS);
        let ran = Arc::new(AtomicUsize::new(0));

        let fibers: Vec<_> = (0..FIBERS)
            .map(|_| {
                let ran = ran.clone();
                Fiber::spawn(
                    &pool,
                    instrumented(move |y: &Yielder<'_>| -> Result<(), Suspended> {
                        let _resume = y.enter("strand::pool::tests::worker_smoke", 0, 0);
                        if let Err(signal) = y.yield_now() {
                            y.save(1, |_| ());
                            return Err(signal);
                        }
                        ran.fetch_add(1, Ordering::Relaxed);
                        y.leave();
                        Ok(())
                    }),
                )
                .unwrap()
            })
            .collect();

        for fiber in &fibers {
            fiber.join().unwrap();
        }
        assert_eq!(ran.load(Ordering::Relaxed), FIBERS);

        pool.shutdown();
    }

    #[test]
    fn shutdown_stops_all_workers() {
        let pool = Pool::new(2);
        let clone = pool.clone();
        pool.shutdown();
        assert!(clone.is_shutdown());

        // building on a stopped pool is refused
        let err = clone
            .fiber_builder()
            .build(instrumented(|_y: &Yielder<'_>| Ok(())))
            .unwrap_err();
        assert!(matches!(err, crate::error::SpawnError::Shutdown));
    }
}
