// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Fibers: cooperatively-scheduled computations multiplexed onto a worker
//! pool.
//!
//! A [`Fiber`] runs a [`Suspendable`] computation in *slices*. Within a
//! slice the computation owns a worker thread; at a suspension point it
//! signals the unforgeable [`Suspended`] value, every instrumented frame
//! saves its locals into the fiber's [`ContinuationStack`] on the way out,
//! and the worker moves on. An unpark makes the fiber runnable again and the
//! next slice — on whichever worker picks it up — replays the captured
//! frames until control transparently re-reaches the former suspension
//! point.

mod builder;
mod yielder;

pub use builder::Builder;
pub use yielder::Yielder;

use crate::continuation::{ContinuationStack, Suspended};
use crate::error::{JoinError, NotInFiber, SnapshotError};
use crate::local::{self, ContextGuard, LocalViews};
use crate::park::{Parker, StdPark, UnparkToken};
use crate::task::state::{CommitAction, Phase};
use crate::task::{Blocker, Task};
use crate::time;
use core::any::Any;
use core::fmt;
use core::mem;
use core::time::Duration;
use once_cell::sync::Lazy;
use std::panic;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Instant;

/// Frame tag of the runtime's own sleep loop; pre-waived in the
/// instrumentation registry.
pub(crate) const SLEEP_FRAME: &str = "strand::fiber::sleep";

/// An opaque ID that uniquely identifies a fiber relative to all other
/// currently live fibers.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Self(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// High-level lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    /// Constructed, never started.
    New = 0,
    /// Started, first slice not yet entered.
    Started = 1,
    /// Exactly one worker is executing a slice.
    Running = 2,
    /// Suspended, waiting for an unpark.
    Waiting = 3,
    /// Finished, successfully or not. No further slice will ever execute.
    Terminated = 4,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Lifecycle::New,
            1 => Lifecycle::Started,
            2 => Lifecycle::Running,
            3 => Lifecycle::Waiting,
            4 => Lifecycle::Terminated,
            _ => unreachable!("corrupt lifecycle value {value}"),
        }
    }
}

/// A computation that can suspend cooperatively.
///
/// `run` is re-invoked for every slice; on a resume the fiber's
/// [`ContinuationStack`] is in replay mode and the instrumented prologue
/// (the [`Yielder::enter`] / resume-index `match`) jumps forward past
/// already-executed code instead of executing the body from the top.
///
/// Implementations are produced by the instrumentation toolchain (or written
/// by hand in its image) and advertise that with [`INSTRUMENTED`]; the fiber
/// factory refuses computations without the marker, because an
/// uninstrumented body would re-execute its side effects on every resume.
///
/// The `on_*` hooks allow specializations to observe the fiber's slice
/// boundaries; all of them default to no-ops.
///
/// [`INSTRUMENTED`]: Suspendable::INSTRUMENTED
pub trait Suspendable: Send + 'static {
    type Output: Send + 'static;

    /// Set by the instrumentation toolchain once every suspendable path in
    /// `run` cooperates with capture and replay.
    const INSTRUMENTED: bool = false;

    fn run(&mut self, yielder: &Yielder<'_>) -> Result<Self::Output, Suspended>;

    /// Called once per park, while the slice is winding down.
    fn on_parked(&mut self) {}

    /// Called at the start of every resumed slice, before replay re-enters
    /// `run`.
    fn on_resume(&mut self) {}

    /// Called after `run` returned its output, before joiners are woken.
    fn on_completion(&mut self, _output: &Self::Output) {}

    /// Called when `run` panicked, with the panic payload.
    fn on_exception(&mut self, _error: &(dyn Any + Send)) {}
}

/// Wraps a closure as an instrumented [`Suspendable`].
///
/// The caller asserts that the closure follows the continuation protocol;
/// this is the hand-written equivalent of the toolchain marking a rewritten
/// class as instrumented.
pub fn instrumented<F, T>(f: F) -> InstrumentedFn<F>
where
    F: FnMut(&Yielder<'_>) -> Result<T, Suspended> + Send + 'static,
    T: Send + 'static,
{
    InstrumentedFn(f)
}

/// See [`instrumented`].
pub struct InstrumentedFn<F>(F);

impl<F, T> Suspendable for InstrumentedFn<F>
where
    F: FnMut(&Yielder<'_>) -> Result<T, Suspended> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;
    const INSTRUMENTED: bool = true;

    fn run(&mut self, yielder: &Yielder<'_>) -> Result<T, Suspended> {
        (self.0)(yielder)
    }
}

/// Handler for errors that terminate a fiber (panics and interrupts).
///
/// Routing order: the fiber's own handler, then the process-wide handler,
/// then a structured error log. Handlers observe the error; the error is
/// additionally stored for joiners either way.
pub type ExceptionHandler = Arc<dyn Fn(&FiberRef, &JoinError) + Send + Sync>;

static GLOBAL_HANDLER: Lazy<RwLock<Option<ExceptionHandler>>> = Lazy::new(|| RwLock::new(None));

/// Installs the process-wide uncaught-exception handler.
pub fn set_global_exception_handler(handler: ExceptionHandler) {
    *GLOBAL_HANDLER
        .write()
        .expect("exception handler lock poisoned") = Some(handler);
}

fn route_uncaught(fiber: &FiberRef, error: &JoinError) {
    let per_fiber = fiber
        .0
        .shared()
        .handler
        .lock()
        .expect("exception handler lock poisoned")
        .clone();
    if let Some(handler) = per_fiber {
        handler(fiber, error);
        return;
    }
    let global = GLOBAL_HANDLER
        .read()
        .expect("exception handler lock poisoned")
        .clone();
    if let Some(handler) = global {
        handler(fiber, error);
        return;
    }
    tracing::error!(fiber = ?fiber, %error, "uncaught fiber exception");
}

/// What the executing worker should do with the task after a slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SliceResult {
    /// The fiber terminated; drop the task.
    Completed,
    /// The fiber parked; whoever unparks it resubmits it.
    Parked,
    /// The park was defeated by a racing wakeup (or was a yield); the caller
    /// must resubmit the fiber so no slice is skipped.
    Resubmit,
}

/// Object-safe surface of a fiber, independent of its output type.
pub(crate) trait Runnable: Send + Sync + 'static {
    /// Executes one slice. The caller must hold the LEASED task.
    fn exec_slice(&self) -> SliceResult;
    fn shared(&self) -> &Shared;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkKind {
    Park,
    Yield,
}

/// Park parameters handed from the suspension primitive to the slice exit.
pub(crate) struct PendingPark {
    kind: ParkKind,
    deadline: Option<Instant>,
    post_park: Option<Box<dyn FnOnce() + Send>>,
}

/// The type-erased state of one fiber.
pub(crate) struct Shared {
    id: Id,
    name: Option<String>,
    lifecycle: AtomicU8,
    interrupted: AtomicBool,
    task: Arc<Task>,
    /// Non-owning; set at construction from the constructing worker's
    /// current fiber, never afterwards. Must not keep a terminated parent
    /// alive.
    parent: Option<Weak<dyn Runnable>>,
    views: Mutex<LocalViews>,
    stack: Mutex<ContinuationStack>,
    pending: Mutex<Option<PendingPark>>,
    joiners: Mutex<Vec<UnparkToken<StdPark>>>,
    handler: Mutex<Option<ExceptionHandler>>,
    span: tracing::Span,
}

// === impl Shared ===

impl Shared {
    pub(crate) fn task(&self) -> &Arc<Task> {
        &self.task
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn store_lifecycle(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    fn cas_lifecycle(&self, from: Lifecycle, to: Lifecycle) -> bool {
        self.lifecycle
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// STARTED → RUNNING on the first slice, WAITING → RUNNING afterwards.
    /// Returns `true` when this slice is a resume.
    fn transition_to_running(&self) -> bool {
        if self.cas_lifecycle(Lifecycle::Started, Lifecycle::Running) {
            false
        } else if self.cas_lifecycle(Lifecycle::Waiting, Lifecycle::Running) {
            true
        } else {
            panic!(
                "fiber {} entered a slice in state {:?}",
                self.id,
                self.lifecycle()
            )
        }
    }

    fn wake_joiners(&self) {
        let tokens = mem::take(&mut *self.joiners.lock().expect("joiner list poisoned"));
        for token in tokens {
            token.unpark();
        }
    }
}

struct Inner<C: Suspendable> {
    shared: Shared,
    computation: Mutex<Option<C>>,
    result: Mutex<Option<Result<C::Output, JoinError>>>,
}

/// The well-known anchor frame: every slice's execution trace passes through
/// here, between the scheduler below and instrumented user code above.
#[inline(never)]
fn fiber_trampoline<C: Suspendable>(
    computation: &mut C,
    yielder: &Yielder<'_>,
) -> Result<Result<C::Output, Suspended>, Box<dyn Any + Send>> {
    panic::catch_unwind(panic::AssertUnwindSafe(|| computation.run(yielder)))
}

enum Verdict<T> {
    Done(Result<T, JoinError>),
    Park(PendingPark),
}

// === impl Inner ===

impl<C: Suspendable> Inner<C> {
    /// Terminal bookkeeping shared by completion, panic, and interrupt.
    fn finish(&self, fiber: &FiberRef, result: Result<C::Output, JoinError>) -> SliceResult {
        *self
            .computation
            .lock()
            .expect("computation lock poisoned") = None;
        if let Err(error) = &result {
            route_uncaught(fiber, error);
        }
        *self.result.lock().expect("result lock poisoned") = Some(result);
        self.shared.store_lifecycle(Lifecycle::Terminated);
        self.shared.task.state().release();
        self.shared.wake_joiners();
        tracing::trace!(fiber = ?fiber, "terminated");
        SliceResult::Completed
    }
}

impl<C: Suspendable> Runnable for Inner<C> {
    fn exec_slice(&self) -> SliceResult {
        let shared = &self.shared;
        let _span = shared.span.enter();

        let fiber = shared
            .task
            .fiber()
            .expect("executing fiber has no self-reference");

        // A wakeup can race termination; consume it without running user
        // code. No slice ever follows TERMINATED.
        if shared.lifecycle() == Lifecycle::Terminated {
            shared.task.state().release();
            return SliceResult::Completed;
        }

        let resumed = shared.transition_to_running();
        shared.task.take_blocker();

        // The interrupt is observed only here, at the resume hook,
        // preserving atomicity of non-suspending regions.
        if resumed && shared.interrupted.load(Ordering::Acquire) {
            tracing::trace!(fiber = ?fiber, "interrupt observed at resume");
            shared
                .stack
                .lock()
                .expect("continuation stack poisoned")
                .clear();
            return self.finish(&fiber, Err(JoinError::Interrupted));
        }

        let verdict = {
            let _context = ContextGuard::enter(&shared.views, fiber.clone());
            let mut computation = self.computation.lock().expect("computation lock poisoned");
            let computation = computation
                .as_mut()
                .expect("computation of a live fiber is missing");
            let mut stack = shared.stack.lock().expect("continuation stack poisoned");
            stack.begin_slice();

            if resumed {
                computation.on_resume();
            }

            let outcome = {
                let yielder = Yielder::new(&mut stack, shared);
                fiber_trampoline(computation, &yielder)
            };

            match outcome {
                Ok(Ok(output)) => {
                    assert_ne!(
                        shared.task.state().load(Ordering::Acquire).phase(),
                        Phase::Parking,
                        "suspension signal was discarded by user code"
                    );
                    debug_assert!(
                        stack.is_empty(),
                        "frames left behind by a completed fiber"
                    );
                    stack.clear();
                    computation.on_completion(&output);
                    Verdict::Done(Ok(output))
                }
                Ok(Err(_suspended)) => {
                    let pending = shared
                        .pending
                        .lock()
                        .expect("pending park poisoned")
                        .take()
                        .expect("suspension signal escaped without a park");
                    debug_assert_eq!(stack.depth(), 0, "unwound frames must all have saved");
                    if crate::instrument::verification_enabled() {
                        crate::instrument::verify_frames(stack.frames());
                    }
                    computation.on_parked();
                    Verdict::Park(pending)
                }
                Err(payload) => {
                    computation.on_exception(payload.as_ref());
                    stack.clear();
                    *shared.pending.lock().expect("pending park poisoned") = None;
                    Verdict::Done(Err(JoinError::Panicked(payload)))
                }
            }
        };

        match verdict {
            Verdict::Done(result) => self.finish(&fiber, result),
            Verdict::Park(pending) => {
                // WAITING must be visible before the commit publishes the
                // task: the next slice may start on another worker the
                // moment the park commits.
                shared.store_lifecycle(Lifecycle::Waiting);

                if let Some(deadline) = pending.deadline {
                    time::global().schedule(deadline, Arc::clone(&shared.task));
                }

                match pending.kind {
                    ParkKind::Yield => {
                        shared.task.state().commit_yield();
                        SliceResult::Resubmit
                    }
                    ParkKind::Park => match shared.task.state().commit_park() {
                        CommitAction::Parked => {
                            tracing::trace!(fiber = ?fiber, "parked");
                            if let Some(action) = pending.post_park {
                                action();
                            }
                            SliceResult::Parked
                        }
                        CommitAction::WasUnparked => {
                            tracing::trace!(fiber = ?fiber, "park defeated by racing wakeup");
                            SliceResult::Resubmit
                        }
                    },
                }
            }
        }
    }

    fn shared(&self) -> &Shared {
        &self.shared
    }
}

/// A cheaply-cloneable, type-erased handle to a fiber.
///
/// This is the surface external synchronization primitives build on:
/// wake-ups, interrupts, blocker inspection, and inline resume.
pub struct FiberRef(pub(crate) Arc<dyn Runnable>);

// === impl FiberRef ===

impl Clone for FiberRef {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl fmt::Debug for FiberRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("state", &self.state())
            .finish()
    }
}

impl FiberRef {
    pub fn id(&self) -> Id {
        self.0.shared().id
    }

    pub fn name(&self) -> Option<&str> {
        self.0.shared().name.as_deref()
    }

    pub fn state(&self) -> Lifecycle {
        self.0.shared().lifecycle()
    }

    /// The fiber inside whose slice this fiber was constructed, if it is
    /// still alive.
    pub fn parent(&self) -> Option<FiberRef> {
        Some(FiberRef(self.0.shared().parent.as_ref()?.upgrade()?))
    }

    /// Delivers a wakeup. Parked fibers become runnable; a wakeup racing the
    /// fiber's own park is latched so that no wakeup is ever lost.
    pub fn unpark(&self) {
        self.0.shared().task().unpark();
    }

    /// Returns `true` iff this call was the wake, i.e. it moved the fiber
    /// from parked to runnable.
    pub fn try_unpark(&self) -> bool {
        self.0.shared().task().try_unpark()
    }

    /// Sets the interrupted flag and wakes the fiber. The interrupt is
    /// observed at the fiber's next resume, which terminates it with
    /// [`JoinError::Interrupted`].
    pub fn interrupt(&self) {
        let shared = self.0.shared();
        shared.interrupted.store(true, Ordering::Release);
        shared.task().unpark();
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.shared().interrupted.load(Ordering::Acquire)
    }

    /// What the fiber is currently parked on, if anything.
    pub fn blocker(&self) -> Option<Blocker> {
        self.0.shared().task().blocker()
    }

    pub fn set_blocker(&self, blocker: Blocker) {
        self.0.shared().task().set_blocker(blocker);
    }

    /// Runs the fiber inline on the calling thread, provided it is parked on
    /// exactly `blocker`.
    ///
    /// Makes a small bounded number of attempts; returns `true` when the
    /// fiber's next slice ran on the caller. Used by specialized handoff
    /// protocols that want to skip the pool round-trip.
    ///
    /// # Panics
    ///
    /// Panics if called from inside a fiber slice; the calling thread's
    /// current-fiber slot is single-occupancy.
    pub fn run_inline(&self, blocker: &Blocker) -> bool {
        const ATTEMPTS: usize = 8;

        let shared = self.0.shared();
        for _ in 0..ATTEMPTS {
            let parked_on_blocker = shared
                .task()
                .blocker()
                .is_some_and(|current| Arc::ptr_eq(&current, blocker));
            if parked_on_blocker && shared.task().state().claim_parked() {
                tracing::trace!(fiber = ?self, "running inline");
                if self.0.exec_slice() == SliceResult::Resubmit {
                    shared.task().pool().resubmit(self.clone());
                }
                return true;
            }
            core::hint::spin_loop();
        }
        false
    }
}

/// A fiber handle carrying the computation's output type.
///
/// All clones refer to the same fiber; the output is taken by whichever
/// join gets there first.
pub struct Fiber<C: Suspendable> {
    inner: Arc<Inner<C>>,
}

// === impl Fiber ===

impl<C: Suspendable> Clone for Fiber<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Suspendable> fmt::Debug for Fiber<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl<C: Suspendable> Fiber<C> {
    /// Builds and starts a fiber with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`SpawnError`](crate::error::SpawnError) when the computation
    /// is not instrumented or the pool is shut down.
    #[track_caller]
    pub fn spawn(
        pool: &crate::pool::Pool,
        computation: C,
    ) -> Result<Self, crate::error::SpawnError> {
        Builder::new(pool).spawn(computation)
    }

    /// The type-erased handle to this fiber.
    pub fn as_ref(&self) -> FiberRef {
        let erased: Arc<dyn Runnable> = self.inner.clone() as Arc<dyn Runnable>;
        FiberRef(erased)
    }

    pub fn id(&self) -> Id {
        self.inner.shared.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.shared.name.as_deref()
    }

    pub fn state(&self) -> Lifecycle {
        self.inner.shared.lifecycle()
    }

    pub fn parent(&self) -> Option<FiberRef> {
        self.as_ref().parent()
    }

    /// Submits the fiber to its pool.
    ///
    /// # Panics
    ///
    /// Panics if the fiber was already started; NEW → STARTED happens
    /// exactly once.
    pub fn start(&self) -> &Self {
        assert!(
            self.inner
                .shared
                .cas_lifecycle(Lifecycle::New, Lifecycle::Started),
            "fiber {} already started",
            self.inner.shared.id
        );
        tracing::trace!(fiber = ?self.as_ref(), "starting");
        self.inner.shared.task.pool().submit(self.as_ref());
        self
    }

    pub fn unpark(&self) {
        self.as_ref().unpark();
    }

    pub fn try_unpark(&self) -> bool {
        self.as_ref().try_unpark()
    }

    pub fn interrupt(&self) {
        self.as_ref().interrupt();
    }

    pub fn is_interrupted(&self) -> bool {
        self.as_ref().is_interrupted()
    }

    pub fn blocker(&self) -> Option<Blocker> {
        self.as_ref().blocker()
    }

    /// Installs a handler consulted before the process-wide one when this
    /// fiber terminates with an error.
    pub fn set_exception_handler(&self, handler: ExceptionHandler) {
        *self
            .inner
            .shared
            .handler
            .lock()
            .expect("exception handler lock poisoned") = Some(handler);
    }

    /// Blocks the calling thread until the fiber terminates and takes its
    /// output.
    ///
    /// # Errors
    ///
    /// Returns the terminal [`JoinError`] when the fiber panicked or was
    /// interrupted, or [`JoinError::AlreadyJoined`] when the output was
    /// taken by an earlier join.
    pub fn join(&self) -> Result<C::Output, JoinError> {
        self.join_inner(None)
    }

    /// Like [`join`](Self::join) but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Additionally returns [`JoinError::Timeout`] when the deadline elapses
    /// first; the fiber itself is unaffected and can be joined again.
    pub fn join_timeout(&self, timeout: Duration) -> Result<C::Output, JoinError> {
        self.join_inner(Some(Instant::now() + timeout))
    }

    fn join_inner(&self, deadline: Option<Instant>) -> Result<C::Output, JoinError> {
        let shared = &self.inner.shared;

        if shared.lifecycle() != Lifecycle::Terminated {
            let parker = Parker::new(StdPark::for_current());
            shared
                .joiners
                .lock()
                .expect("joiner list poisoned")
                .push(parker.clone().into_unpark());

            // recheck after registration: a termination in the gap has
            // already drained the joiner list
            while shared.lifecycle() != Lifecycle::Terminated {
                match deadline {
                    Some(deadline) => {
                        if !parker.park_deadline(deadline)
                            && shared.lifecycle() != Lifecycle::Terminated
                        {
                            return Err(JoinError::Timeout);
                        }
                    }
                    None => parker.park(),
                }
            }
        }

        match self.inner.result.lock().expect("result lock poisoned").take() {
            Some(result) => result,
            None => Err(JoinError::AlreadyJoined),
        }
    }

    /// Captures an opaque descriptor of the suspended fiber.
    ///
    /// # Errors
    ///
    /// Fails structurally on a RUNNING fiber: its state lives on a worker
    /// stack and cannot be captured.
    pub fn try_snapshot(&self) -> Result<FiberSnapshot, SnapshotError> {
        let shared = &self.inner.shared;
        let lifecycle = shared.lifecycle();
        if lifecycle == Lifecycle::Running {
            return Err(SnapshotError::Running);
        }
        let captured_frames = shared
            .stack
            .lock()
            .expect("continuation stack poisoned")
            .frame_count();
        Ok(FiberSnapshot {
            id: shared.id,
            name: shared.name.clone(),
            lifecycle,
            captured_frames,
        })
    }
}

/// Opaque descriptor of a fiber that was not running when captured.
#[derive(Debug, Clone)]
pub struct FiberSnapshot {
    id: Id,
    name: Option<String>,
    lifecycle: Lifecycle,
    captured_frames: usize,
}

impl FiberSnapshot {
    pub fn id(&self) -> Id {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn captured_frames(&self) -> usize {
        self.captured_frames
    }
}

/// The fiber currently executing on the calling thread.
///
/// # Errors
///
/// Returns [`NotInFiber`] when the calling thread is not inside a fiber
/// slice — the structural error behind every "may only be called from a
/// fiber" contract.
pub fn current() -> Result<FiberRef, NotInFiber> {
    local::current_fiber().ok_or(NotInFiber(()))
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use core::any::type_name;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn trace() -> tracing::subscriber::DefaultGuard {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default()
    }

    #[track_caller]
    fn await_state(fiber: &FiberRef, expected: Lifecycle) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while fiber.state() != expected {
            assert!(
                Instant::now() < deadline,
                "fiber never reached {expected:?}, stuck in {:?}",
                fiber.state()
            );
            thread::yield_now();
        }
    }

    struct CosThenPark {
        slices: Arc<AtomicUsize>,
    }

    impl Suspendable for CosThenPark {
        type Output = f64;
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<f64, Suspended> {
            self.slices.fetch_add(1, Ordering::Relaxed);

            let resume = y.enter(type_name::<Self>(), 1, 0);
            let t = match resume {
                0 => f64::cos(0.0),
                1 => y.restore(|frame| frame.f64(0)),
                resume => unreachable!("unknown resume index {resume}"),
            };
            if let Err(signal) = y.park(None) {
                y.save(1, |frame| frame.put_f64(0, t));
                return Err(signal);
            }
            y.leave();
            Ok(t)
        }
    }

    #[test]
    fn single_park_round_trip() {
        let _trace = trace();
        let pool = Pool::new(1);

        let slices = Arc::new(AtomicUsize::new(0));
        let fiber = Fiber::spawn(
            &pool,
            CosThenPark {
                slices: slices.clone(),
            },
        )
        .unwrap();

        // slice 1 runs and parks; the result is not available yet
        await_state(&fiber.as_ref(), Lifecycle::Waiting);
        assert_eq!(slices.load(Ordering::Relaxed), 1);
        assert!(
            fiber
                .join_timeout(Duration::from_millis(10))
                .unwrap_err()
                .is_timeout()
        );

        // slice 2 replays past the park and completes
        fiber.unpark();
        let result = fiber.join().unwrap();
        assert!((result - 1.0).abs() < f64::EPSILON);
        assert_eq!(slices.load(Ordering::Relaxed), 2);
        assert_eq!(fiber.state(), Lifecycle::Terminated);

        pool.shutdown();
    }

    fn passthrough(y: &Yielder<'_>, input: &str) -> Result<String, Suspended> {
        let resume = y.enter("strand::fiber::tests::passthrough", 0, 1);
        let owned = match resume {
            0 => String::from(input),
            1 => y.restore(|frame| frame.take_obj::<String>(0)),
            resume => unreachable!("unknown resume index {resume}"),
        };
        if let Err(signal) = y.park(None) {
            y.save(1, |frame| frame.put_obj(0, owned));
            return Err(signal);
        }
        y.leave();
        Ok(owned)
    }

    struct NullThroughPark {
        slices: Arc<AtomicUsize>,
    }

    impl Suspendable for NullThroughPark {
        type Output = String;
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<String, Suspended> {
            self.slices.fetch_add(1, Ordering::Relaxed);

            let _resume = y.enter(type_name::<Self>(), 0, 0);
            let value = match passthrough(y, "a") {
                Ok(value) => value,
                Err(signal) => {
                    y.save(1, |_| ());
                    return Err(signal);
                }
            };
            assert!(!value.is_empty());
            y.leave();
            Ok(value)
        }
    }

    #[test]
    fn value_carried_through_nested_park() {
        let _trace = trace();
        let pool = Pool::new(1);

        let slices = Arc::new(AtomicUsize::new(0));
        let fiber = Fiber::spawn(
            &pool,
            NullThroughPark {
                slices: slices.clone(),
            },
        )
        .unwrap();

        await_state(&fiber.as_ref(), Lifecycle::Waiting);
        fiber.unpark();

        assert_eq!(fiber.join().unwrap(), "a");
        assert_eq!(slices.load(Ordering::Relaxed), 2);

        pool.shutdown();
    }

    struct SelfWakeWhileParking {
        slices: Arc<AtomicUsize>,
        self_ref: Arc<once_cell::sync::OnceCell<FiberRef>>,
    }

    impl Suspendable for SelfWakeWhileParking {
        type Output = ();
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<(), Suspended> {
            self.slices.fetch_add(1, Ordering::Relaxed);

            let _resume = y.enter(type_name::<Self>(), 0, 0);
            if let Err(signal) = y.park(None) {
                // the state word is now PARKING; this unpark must be latched
                // and defeat the commit rather than evaporate
                self.self_ref.get().unwrap().unpark();
                y.save(1, |_| ());
                return Err(signal);
            }
            y.leave();
            Ok(())
        }
    }

    #[test]
    fn unpark_during_parking_window_is_not_lost() {
        let _trace = trace();
        let pool = Pool::new(1);

        let slices = Arc::new(AtomicUsize::new(0));
        let self_ref = Arc::new(once_cell::sync::OnceCell::new());
        let fiber = Builder::new(&pool)
            .name("lost-wakeup")
            .build(SelfWakeWhileParking {
                slices: slices.clone(),
                self_ref: self_ref.clone(),
            })
            .unwrap();
        self_ref.set(fiber.as_ref()).ok().unwrap();

        // no external unpark after this point: the latched wakeup alone must
        // carry the fiber to completion
        fiber.start();
        fiber.join().unwrap();
        assert_eq!(slices.load(Ordering::Relaxed), 2);

        pool.shutdown();
    }

    struct TimedSleep {
        duration: Duration,
        started: Option<Instant>,
    }

    impl Suspendable for TimedSleep {
        type Output = Duration;
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<Duration, Suspended> {
            let started = *self.started.get_or_insert_with(Instant::now);

            let _resume = y.enter(type_name::<Self>(), 0, 0);
            if let Err(signal) = y.sleep(self.duration) {
                y.save(1, |_| ());
                return Err(signal);
            }
            y.leave();
            Ok(started.elapsed())
        }
    }

    #[test]
    fn sleep_takes_at_least_its_duration() {
        let _trace = trace();
        let pool = Pool::new(1);

        let fiber = Fiber::spawn(
            &pool,
            TimedSleep {
                duration: Duration::from_millis(50),
                started: None,
            },
        )
        .unwrap();

        await_state(&fiber.as_ref(), Lifecycle::Waiting);
        let elapsed = fiber.join().unwrap();
        assert!(elapsed >= Duration::from_millis(50), "woke after {elapsed:?}");

        pool.shutdown();
    }

    #[test]
    fn spurious_wakeup_reparks_until_the_deadline() {
        let _trace = trace();
        let pool = Pool::new(1);

        let fiber = Fiber::spawn(
            &pool,
            TimedSleep {
                duration: Duration::from_millis(50),
                started: None,
            },
        )
        .unwrap();

        // a spurious unpark well before the deadline; the sleep loop must
        // recompute the remaining time and park again
        thread::sleep(Duration::from_millis(20));
        fiber.unpark();

        let elapsed = fiber.join().unwrap();
        assert!(elapsed >= Duration::from_millis(50), "woke after {elapsed:?}");

        pool.shutdown();
    }

    struct ParkForever;

    impl Suspendable for ParkForever {
        type Output = ();
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<(), Suspended> {
            let _resume = y.enter(type_name::<Self>(), 0, 0);
            loop {
                if let Err(signal) = y.park(None) {
                    y.save(1, |_| ());
                    return Err(signal);
                }
            }
        }
    }

    #[test]
    fn interrupt_terminates_a_parked_fiber() {
        let _trace = trace();
        let pool = Pool::new(1);

        let fiber = Fiber::spawn(&pool, ParkForever).unwrap();
        await_state(&fiber.as_ref(), Lifecycle::Waiting);

        let reported = Arc::new(AtomicUsize::new(0));
        let observer = reported.clone();
        fiber.set_exception_handler(Arc::new(move |_fiber: &FiberRef, error: &JoinError| {
            if error.is_interrupted() {
                observer.fetch_add(1, Ordering::Relaxed);
            }
        }));

        fiber.interrupt();
        assert!(fiber.join().unwrap_err().is_interrupted());
        assert_eq!(reported.load(Ordering::Relaxed), 1);
        assert!(fiber.is_interrupted());

        pool.shutdown();
    }

    struct NotInstrumented;

    impl Suspendable for NotInstrumented {
        type Output = ();

        fn run(&mut self, _y: &Yielder<'_>) -> Result<(), Suspended> {
            Ok(())
        }
    }

    #[test]
    fn uninstrumented_computation_is_rejected_at_construction() {
        let pool = Pool::new(1);

        let err = Builder::new(&pool).build(NotInstrumented).unwrap_err();
        assert!(matches!(
            err,
            crate::error::SpawnError::Uninstrumented(name) if name.contains("NotInstrumented")
        ));

        pool.shutdown();
    }

    struct Panics;

    impl Suspendable for Panics {
        type Output = ();
        const INSTRUMENTED: bool = true;

        fn run(&mut self, _y: &Yielder<'_>) -> Result<(), Suspended> {
            panic!("boom");
        }
    }

    #[test]
    fn panic_terminates_the_fiber_and_reaches_the_joiner() {
        let _trace = trace();
        let pool = Pool::new(1);

        let fiber = Fiber::spawn(&pool, Panics).unwrap();
        let error = fiber.join().unwrap_err();
        assert!(error.is_panic());
        let payload = error.into_panic();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));

        // the worker survives the panic and keeps executing fibers
        let ok = Fiber::spawn(&pool, instrumented(|_y: &Yielder<'_>| Ok(17_u32))).unwrap();
        assert_eq!(ok.join().unwrap(), 17);

        pool.shutdown();
    }

    struct ParkOnBlocker {
        blocker: Blocker,
    }

    impl Suspendable for ParkOnBlocker {
        type Output = u32;
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<u32, Suspended> {
            let _resume = y.enter(type_name::<Self>(), 0, 0);
            if let Err(signal) = y.park(Some(self.blocker.clone())) {
                y.save(1, |_| ());
                return Err(signal);
            }
            y.leave();
            Ok(99)
        }
    }

    #[test]
    fn run_inline_claims_only_the_matching_blocker() {
        let _trace = trace();
        let pool = Pool::new(1);

        let blocker: Blocker = Arc::new("wait-queue");
        let other: Blocker = Arc::new("elsewhere");

        let fiber = Fiber::spawn(
            &pool,
            ParkOnBlocker {
                blocker: blocker.clone(),
            },
        )
        .unwrap();
        await_state(&fiber.as_ref(), Lifecycle::Waiting);
        assert!(fiber.blocker().is_some());

        // wrong blocker identity: no claim
        assert!(!fiber.as_ref().run_inline(&other));
        assert_eq!(fiber.state(), Lifecycle::Waiting);

        // matching blocker: the slice runs right here on the test thread
        assert!(fiber.as_ref().run_inline(&blocker));
        assert_eq!(fiber.state(), Lifecycle::Terminated);
        assert_eq!(fiber.join().unwrap(), 99);

        pool.shutdown();
    }

    #[test]
    fn try_unpark_reports_whether_it_was_the_wake() {
        let _trace = trace();
        let pool = Pool::new(1);

        let slices = Arc::new(AtomicUsize::new(0));
        let fiber = Builder::new(&pool)
            .build(CosThenPark { slices })
            .unwrap();

        // a fiber that is not parked cannot be woken
        assert!(!fiber.try_unpark());

        fiber.start();
        await_state(&fiber.as_ref(), Lifecycle::Waiting);
        // we are the wake; the fiber runs to completion from here
        assert!(fiber.try_unpark());
        fiber.join().unwrap();

        // nor can a terminated one
        assert!(!fiber.try_unpark());

        pool.shutdown();
    }

    struct PostParkPublish {
        published: Arc<AtomicUsize>,
    }

    impl Suspendable for PostParkPublish {
        type Output = ();
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<(), Suspended> {
            let _resume = y.enter(type_name::<Self>(), 0, 0);
            let published = self.published.clone();
            let fiber = y.fiber();
            if let Err(signal) = y.park_with(
                None,
                move || {
                    // runs exactly once, after the park has committed
                    published.fetch_add(1, Ordering::Relaxed);
                    fiber.unpark();
                },
                None,
            ) {
                y.save(1, |_| ());
                return Err(signal);
            }
            y.leave();
            Ok(())
        }
    }

    #[test]
    fn post_park_action_runs_once_after_the_commit() {
        let _trace = trace();
        let pool = Pool::new(1);

        let published = Arc::new(AtomicUsize::new(0));
        let fiber = Fiber::spawn(
            &pool,
            PostParkPublish {
                published: published.clone(),
            },
        )
        .unwrap();

        fiber.join().unwrap();
        assert_eq!(published.load(Ordering::Relaxed), 1);

        pool.shutdown();
    }

    struct YieldALot {
        rounds: u64,
    }

    impl Suspendable for YieldALot {
        type Output = u64;
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<u64, Suspended> {
            let resume = y.enter(type_name::<Self>(), 1, 0);
            let mut completed = match resume {
                0 => 0,
                1 => y.restore(|frame| frame.word(0)),
                resume => unreachable!("unknown resume index {resume}"),
            };
            while completed < self.rounds {
                if let Err(signal) = y.yield_now() {
                    y.save(1, |frame| frame.put_word(0, completed));
                    return Err(signal);
                }
                completed += 1;
            }
            y.leave();
            Ok(completed)
        }
    }

    #[test]
    fn yielding_fibers_interleave_and_complete() {
        let _trace = trace();
        let pool = Pool::new(2);

        let fibers: Vec<_> = (0..4)
            .map(|_| Fiber::spawn(&pool, YieldALot { rounds: 25 }).unwrap())
            .collect();

        for fiber in &fibers {
            assert_eq!(fiber.join().unwrap(), 25);
        }

        pool.shutdown();
    }

    #[test]
    fn snapshot_of_a_waiting_fiber_describes_its_stack() {
        let _trace = trace();
        let pool = Pool::new(1);

        let fiber = Fiber::spawn(&pool, ParkForever).unwrap();
        await_state(&fiber.as_ref(), Lifecycle::Waiting);

        let snapshot = fiber.try_snapshot().unwrap();
        assert_eq!(snapshot.lifecycle(), Lifecycle::Waiting);
        assert_eq!(snapshot.captured_frames(), 1);
        assert_eq!(snapshot.id(), fiber.id());

        fiber.interrupt();
        let _ = fiber.join();

        // a terminated fiber snapshots with an empty stack
        let snapshot = fiber.try_snapshot().unwrap();
        assert_eq!(snapshot.lifecycle(), Lifecycle::Terminated);
        assert_eq!(snapshot.captured_frames(), 0);

        pool.shutdown();
    }

    #[test]
    fn double_start_is_fatal() {
        let pool = Pool::new(1);
        let fiber = Builder::new(&pool).build(ParkForever).unwrap();
        fiber.start();

        let fiber2 = fiber.clone();
        let second = thread::spawn(move || fiber2.start().id()).join();
        assert!(second.is_err());

        fiber.interrupt();
        let _ = fiber.join();
        pool.shutdown();
    }

    #[test]
    fn current_fails_outside_a_slice() {
        assert!(current().is_err());
    }

    crate::loom::lazy_static! {
        static ref SLOT: crate::local::FiberLocal<u64> = crate::local::FiberLocal::new(|| 0);
        static ref CONTEXT: crate::local::FiberInheritable<u64> =
            crate::local::FiberInheritable::new(|| 0);
    }

    struct TlsRoundTrip {
        value: u64,
    }

    impl Suspendable for TlsRoundTrip {
        type Output = u64;
        const INSTRUMENTED: bool = true;

        fn run(&mut self, y: &Yielder<'_>) -> Result<u64, Suspended> {
            let resume = y.enter(type_name::<Self>(), 0, 0);
            if resume == 0 {
                assert_eq!(SLOT.get(), 0, "fresh fiber saw another fiber's local");
                SLOT.set(self.value);
            }
            if let Err(signal) = y.park(None) {
                y.save(1, |_| ());
                return Err(signal);
            }
            y.leave();
            Ok(SLOT.get())
        }
    }

    #[test]
    fn fiber_locals_survive_suspension_and_stay_isolated() {
        let _trace = trace();
        let pool = Pool::new(1);

        // both fibers share the single worker; each one's view must survive
        // the other's slices untouched
        let a = Fiber::spawn(&pool, TlsRoundTrip { value: 11 }).unwrap();
        await_state(&a.as_ref(), Lifecycle::Waiting);
        let b = Fiber::spawn(&pool, TlsRoundTrip { value: 22 }).unwrap();
        await_state(&b.as_ref(), Lifecycle::Waiting);

        a.unpark();
        assert_eq!(a.join().unwrap(), 11);
        b.unpark();
        assert_eq!(b.join().unwrap(), 22);

        pool.shutdown();
    }

    struct Child;

    impl Suspendable for Child {
        type Output = (u64, Option<u64>);
        const INSTRUMENTED: bool = true;

        fn run(&mut self, _y: &Yielder<'_>) -> Result<(u64, Option<u64>), Suspended> {
            let parent = current()
                .expect("child runs inside a slice")
                .parent()
                .map(|parent| parent.id().as_u64());
            Ok((CONTEXT.get(), parent))
        }
    }

    struct Parent {
        pool: Pool,
    }

    impl Suspendable for Parent {
        type Output = (u64, Option<u64>, u64);
        const INSTRUMENTED: bool = true;

        fn run(&mut self, _y: &Yielder<'_>) -> Result<(u64, Option<u64>, u64), Suspended> {
            CONTEXT.set(5);
            let child = Fiber::spawn(&self.pool, Child).unwrap();
            let my_id = current().unwrap().id().as_u64();
            let (inherited, parent_id) = child.join().unwrap();
            Ok((inherited, parent_id, my_id))
        }
    }

    #[test]
    fn children_inherit_the_view_and_link_to_their_parent() {
        let _trace = trace();
        let pool = Pool::new(2);

        let parent = Fiber::spawn(&pool, Parent { pool: pool.clone() }).unwrap();
        let (inherited, parent_id, my_id) = parent.join().unwrap();

        assert_eq!(inherited, 5, "inheritable snapshot did not reach the child");
        assert_eq!(parent_id, Some(my_id), "parent link is wrong or missing");

        pool.shutdown();
    }
}
