// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The timed wait service.
//!
//! One process-wide background thread holds a deadline-ordered heap of
//! `(deadline, task)` entries and, when a deadline passes, unconditionally
//! unparks the task. Cancellation is implicit: an early wakeup that already
//! made the task runnable turns the later timeout delivery into a no-op
//! through the state word's idempotence, so nothing is ever removed from the
//! heap ahead of time.
//!
//! The thread is started lazily on the first timed park and lives for the
//! rest of the process; there is no teardown.

use crate::task::Task;
use core::cmp;
use core::fmt;
use once_cell::sync::Lazy;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

static GLOBAL: Lazy<Timer> = Lazy::new(Timer::start);

/// The process-wide timer instance.
pub(crate) fn global() -> &'static Timer {
    &GLOBAL
}

pub(crate) struct Timer {
    shared: Arc<Shared>,
    next_seq: AtomicU64,
}

struct Shared {
    heap: Mutex<BinaryHeap<Entry>>,
    has_earlier: Condvar,
}

struct Entry {
    deadline: Instant,
    /// Insertion tiebreaker so entries with equal deadlines fire in
    /// registration order.
    seq: u64,
    task: Arc<Task>,
}

// === impl Timer ===

impl Timer {
    fn start() -> Self {
        let shared = Arc::new(Shared {
            heap: Mutex::new(BinaryHeap::new()),
            has_earlier: Condvar::new(),
        });

        let worker = Arc::clone(&shared);
        std::thread::Builder::new()
            .name("strand-timer".into())
            .spawn(move || worker.run())
            .expect("failed to spawn the timer thread");

        Self {
            shared,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Schedules an unconditional unpark of `task` at `deadline`.
    pub(crate) fn schedule(&self, deadline: Instant, task: Arc<Task>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let entry = Entry {
            deadline,
            seq,
            task,
        };

        let mut heap = self.shared.heap.lock().expect("timer heap poisoned");
        let preempts = heap
            .peek()
            .is_none_or(|head| entry.deadline < head.deadline);
        tracing::trace!(?deadline, seq, preempts, "registered timed wait");
        heap.push(entry);
        drop(heap);

        if preempts {
            self.shared.has_earlier.notify_one();
        }
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pending = self.shared.heap.lock().expect("timer heap poisoned").len();
        f.debug_struct("Timer").field("pending", &pending).finish()
    }
}

// === impl Shared ===

impl Shared {
    fn run(&self) {
        let mut due = Vec::new();
        let mut heap = self.heap.lock().expect("timer heap poisoned");

        loop {
            let now = Instant::now();
            while let Some(head) = heap.peek() {
                if head.deadline > now {
                    break;
                }
                due.push(heap.pop().expect("peeked entry vanished"));
            }

            if !due.is_empty() {
                // deliver outside the lock; an unpark resubmits through the
                // pool and must not contend with concurrent registration
                drop(heap);
                for entry in due.drain(..) {
                    tracing::trace!(deadline = ?entry.deadline, seq = entry.seq, "timed wait elapsed");
                    entry.task.unpark();
                }
                heap = self.heap.lock().expect("timer heap poisoned");
                continue;
            }

            let next_deadline = heap.peek().map(|head| head.deadline);
            heap = match next_deadline {
                Some(deadline) => {
                    let wait = deadline.saturating_duration_since(now);
                    self.has_earlier
                        .wait_timeout(heap, wait)
                        .expect("timer heap poisoned")
                        .0
                }
                None => self
                    .has_earlier
                    .wait(heap)
                    .expect("timer heap poisoned"),
            };
        }
    }
}

// === impl Entry ===

// `BinaryHeap` is a max-heap; order entries by reversed deadline so the
// earliest deadline surfaces first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}
