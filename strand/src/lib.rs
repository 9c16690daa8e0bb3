// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A lightweight user-space fiber runtime.
//!
//! Fibers are cooperatively-scheduled computations multiplexed onto a small
//! [`Pool`] of worker threads. A suspended fiber consumes no thread: at a
//! suspension point its instrumented call stack is captured frame by frame
//! into a heap-resident [`ContinuationStack`], and the next slice — on
//! whichever worker picks the fiber up — replays those frames until control
//! transparently re-reaches the former suspension point.
//!
//! The crate is the suspension/resumption engine only: the [`fiber`]
//! lifecycle state machine, the lost-wakeup-safe park/unpark protocol on the
//! task state word, the worker context switch that swaps [`FiberLocal`]
//! views in and out, and the timed wait service behind
//! [`Yielder::sleep`] and [`Yielder::park_timeout`]. Channels, mailboxes and
//! other synchronization constructs are expected to be built on top of the
//! [`Yielder::park_with`] / [`FiberRef::unpark`] surface.
//!
//! ```
//! use strand::{Fiber, Lifecycle, Pool, Suspended, Yielder, instrumented};
//!
//! let pool = Pool::new(2);
//!
//! let fiber = Fiber::spawn(
//!     &pool,
//!     instrumented(|y: &Yielder<'_>| -> Result<u64, Suspended> {
//!         let resume = y.enter("doc::double_step", 1, 0);
//!         let acc = match resume {
//!             0 => 21,
//!             1 => y.restore(|frame| frame.word(0)),
//!             _ => unreachable!(),
//!         };
//!         // suspend; whoever holds the handle decides when we continue
//!         if let Err(signal) = y.park(None) {
//!             y.save(1, |frame| frame.put_word(0, acc));
//!             return Err(signal);
//!         }
//!         y.leave();
//!         Ok(acc * 2)
//!     }),
//! )
//! .unwrap();
//!
//! while fiber.state() != Lifecycle::Waiting {
//!     std::thread::yield_now();
//! }
//! fiber.unpark();
//! assert_eq!(fiber.join().unwrap(), 42);
//! pool.shutdown();
//! ```

pub mod continuation;
pub mod error;
pub mod fiber;
pub mod instrument;
pub mod local;
mod loom;
mod park;
pub mod pool;
pub(crate) mod task;
mod time;

pub use continuation::{ContinuationStack, Frame, Suspended};
pub use error::{JoinError, NotInFiber, SnapshotError, SpawnError};
pub use fiber::{
    Builder, ExceptionHandler, Fiber, FiberRef, FiberSnapshot, Id, Lifecycle, Suspendable,
    Yielder, current, instrumented, set_global_exception_handler,
};
pub use local::{FiberInheritable, FiberLocal};
pub use pool::Pool;
pub use task::Blocker;
