// Copyright 2025 Strand Contributors
//
// Licensed under the Apache License, Version 2.0,
// <http://apache.org/licenses/LICENSE-2.0> or the MIT license
// <http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Heap-resident capture of a fiber's logical call stack.
//!
//! While a fiber is suspended its locals do not live on any worker stack;
//! they live here, as a stack of [`Frame`]s. Instrumented functions drive the
//! four-operation protocol:
//!
//! - [`ContinuationStack::enter`] at function entry pushes a fresh frame (or,
//!   when the fiber is being resumed, consumes the next captured frame and
//!   returns the resume index recorded for it),
//! - [`ContinuationStack::save`] in the `Err(`[`Suspended`]`)` arm of a
//!   suspendable call site records the resume index and live locals before
//!   the signal propagates outward,
//! - [`ContinuationStack::restore`] in a nonzero resume arm hands the saved
//!   locals back,
//! - [`ContinuationStack::leave`] at normal return pops the frame.
//!
//! Replay re-executes the captured call path: every frame's resume arm jumps
//! back to the suspendable call it was parked in and re-invokes it. The
//! suspension primitive itself notices that it is the innermost captured
//! frame's resume target, clears replay mode, and returns `Ok(())` instead of
//! suspending, so execution continues transparently past the former park.

use core::any::{Any, type_name};
use core::fmt;

/// The control-transfer signal raised at a suspension point.
///
/// This value is deliberately unforgeable: only the suspension primitives
/// construct it, so an `Err(Suspended)` reaching the slice boundary always
/// corresponds to a committed park signal. It is not an error; instrumented
/// code must propagate it outward after saving its frame and must never
/// fabricate or discard it.
pub struct Suspended {
    _signal: (),
}

impl Suspended {
    pub(crate) fn new() -> Self {
        Self { _signal: () }
    }
}

impl fmt::Debug for Suspended {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad("Suspended")
    }
}

/// One captured activation record.
///
/// A frame owns a word-slot array for primitive locals, a reference-slot
/// array for owned locals, and the resume index identifying the suspendable
/// call site at which control re-enters the function.
pub struct Frame {
    owner: &'static str,
    resume_at: u32,
    words: Box<[u64]>,
    refs: Box<[Option<Box<dyn Any + Send>>]>,
}

impl Frame {
    fn new(owner: &'static str, words: usize, refs: usize) -> Self {
        Self {
            owner,
            resume_at: 0,
            words: vec![0; words].into_boxed_slice(),
            refs: (0..refs).map(|_| None).collect(),
        }
    }

    /// The tag of the instrumented function owning this frame.
    pub fn owner(&self) -> &'static str {
        self.owner
    }

    /// The call site index at which control re-enters this frame.
    pub fn resume_at(&self) -> u32 {
        self.resume_at
    }

    /// Stores a primitive local in word slot `slot`.
    pub fn put_word(&mut self, slot: usize, value: u64) {
        self.words[slot] = value;
    }

    /// Reads a primitive local from word slot `slot`.
    pub fn word(&self, slot: usize) -> u64 {
        self.words[slot]
    }

    pub fn put_f64(&mut self, slot: usize, value: f64) {
        self.put_word(slot, value.to_bits());
    }

    pub fn f64(&self, slot: usize) -> f64 {
        f64::from_bits(self.word(slot))
    }

    pub fn put_bool(&mut self, slot: usize, value: bool) {
        self.put_word(slot, u64::from(value));
    }

    pub fn bool(&self, slot: usize) -> bool {
        self.word(slot) != 0
    }

    /// Moves an owned local into reference slot `slot`.
    pub fn put_obj<T: Any + Send>(&mut self, slot: usize, value: T) {
        self.refs[slot] = Some(Box::new(value));
    }

    /// Moves an owned local back out of reference slot `slot`.
    ///
    /// # Panics
    ///
    /// Panics if the slot is empty or holds a value of a different type;
    /// either means the generated save and restore paths of the owning
    /// function disagree, which is an instrumentation defect.
    pub fn take_obj<T: Any + Send>(&mut self, slot: usize) -> T {
        let value = self.refs[slot].take().unwrap_or_else(|| {
            panic!(
                "reference slot {slot} of frame `{}` is empty on restore",
                self.owner
            )
        });
        match value.downcast::<T>() {
            Ok(value) => *value,
            Err(_) => panic!(
                "reference slot {slot} of frame `{}` does not hold a `{}`",
                self.owner,
                type_name::<T>()
            ),
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("owner", &self.owner)
            .field("resume_at", &self.resume_at)
            .field("words", &self.words.len())
            .field("refs", &self.refs.len())
            .finish()
    }
}

/// The captured call stack of one fiber.
///
/// Created with the fiber, populated while the suspension signal unwinds,
/// consumed while the next slice replays, and empty again whenever the fiber
/// is between suspensions or has terminated.
pub struct ContinuationStack {
    frames: Vec<Frame>,
    /// Index one past the frame the executing code is currently inside.
    ///
    /// During normal execution this equals `frames.len()`; during replay it
    /// trails behind while outer frames re-enter one by one.
    depth: usize,
    replaying: bool,
}

impl ContinuationStack {
    pub(crate) fn with_capacity(frames: usize) -> Self {
        Self {
            frames: Vec::with_capacity(frames),
            depth: 0,
            replaying: false,
        }
    }

    /// Resets the cursors for one slice. Replay mode is armed iff a previous
    /// slice left captured frames behind.
    pub(crate) fn begin_slice(&mut self) {
        self.depth = 0;
        self.replaying = !self.frames.is_empty();
    }

    /// Called at the entry of every instrumented function.
    ///
    /// Returns the resume index: `0` on first execution, the index recorded
    /// by [`save`](Self::save) when the function is being replayed.
    ///
    /// # Panics
    ///
    /// Panics if replay encounters a frame captured for a different owner,
    /// which means the replayed call path diverged from the captured one.
    pub fn enter(&mut self, owner: &'static str, words: usize, refs: usize) -> u32 {
        if self.replaying {
            let frame = &self.frames[self.depth];
            assert_eq!(
                frame.owner, owner,
                "replay entered `{owner}` where `{}` was captured",
                frame.owner
            );
            self.depth += 1;
            tracing::trace!(owner, resume_at = frame.resume_at, "replaying frame");
            frame.resume_at
        } else {
            debug_assert_eq!(self.depth, self.frames.len());
            self.frames.push(Frame::new(owner, words, refs));
            self.depth += 1;
            0
        }
    }

    /// Records the resume index of the current frame while the suspension
    /// signal unwinds, and steps the cursor out to the caller's frame.
    ///
    /// Returns the frame so the caller can write its live locals.
    ///
    /// # Panics
    ///
    /// Panics if there is no frame left to save, i.e. more saves than enters.
    pub fn save(&mut self, resume_at: u32) -> &mut Frame {
        assert!(self.depth > 0, "save without a matching enter");
        self.depth -= 1;
        let frame = &mut self.frames[self.depth];
        frame.resume_at = resume_at;
        tracing::trace!(owner = frame.owner, resume_at, "captured frame");
        frame
    }

    /// The current frame, for restoring locals in a resume arm.
    ///
    /// # Panics
    ///
    /// Panics if no frame has been entered.
    pub fn restore(&mut self) -> &mut Frame {
        assert!(self.depth > 0, "restore without a matching enter");
        &mut self.frames[self.depth - 1]
    }

    /// Pops the current frame at normal function return.
    ///
    /// # Panics
    ///
    /// Panics if called while replaying; an instrumented function cannot
    /// return normally before the replayed call path has reached its former
    /// suspension point.
    pub fn leave(&mut self) {
        assert!(!self.replaying, "leave while replaying");
        debug_assert_eq!(self.depth, self.frames.len());
        self.frames.pop();
        self.depth -= 1;
    }

    /// `true` while a resumed slice is still rebuilding the captured call
    /// path.
    pub fn is_replaying(&self) -> bool {
        self.replaying
    }

    /// `true` when the executing code sits in the innermost captured frame,
    /// i.e. the next suspension primitive reached is the resume target.
    pub(crate) fn at_resume_point(&self) -> bool {
        self.replaying && self.depth == self.frames.len()
    }

    pub(crate) fn finish_replay(&mut self) {
        debug_assert!(self.at_resume_point());
        self.replaying = false;
    }

    pub(crate) fn depth(&self) -> usize {
        self.depth
    }

    pub(crate) fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub(crate) fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.frames.clear();
        self.depth = 0;
        self.replaying = false;
    }
}

impl fmt::Debug for ContinuationStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationStack")
            .field("frames", &self.frames)
            .field("depth", &self.depth)
            .field("replaying", &self.replaying)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> ContinuationStack {
        ContinuationStack::with_capacity(4)
    }

    #[test]
    fn fresh_enter_returns_zero() {
        let mut stack = stack();
        assert_eq!(stack.enter("a", 1, 0), 0);
        assert_eq!(stack.enter("b", 0, 0), 0);
        assert_eq!(stack.frame_count(), 2);
        stack.leave();
        stack.leave();
        assert!(stack.is_empty());
    }

    #[test]
    fn single_frame_round_trip() {
        let mut stack = stack();

        // first slice: enter, suspend at site 2 with one word and one object
        assert_eq!(stack.enter("a", 1, 1), 0);
        let frame = stack.save(2);
        frame.put_f64(0, 1.0);
        frame.put_obj(0, String::from("x"));
        assert_eq!(stack.depth(), 0);

        // second slice: replay hands back the same state
        stack.begin_slice();
        assert!(stack.is_replaying());
        assert_eq!(stack.enter("a", 1, 1), 2);
        assert!(stack.at_resume_point());
        assert_eq!(stack.restore().f64(0), 1.0);
        assert_eq!(stack.restore().take_obj::<String>(0), "x");
        stack.finish_replay();
        stack.leave();
        assert!(stack.is_empty());
    }

    #[test]
    fn nested_frames_unwind_outward_and_replay_inward() {
        let mut stack = stack();

        // capture: outer calls inner, inner suspends
        stack.enter("outer", 0, 0);
        stack.enter("inner", 1, 0);
        stack.save(3).put_word(0, 7);
        stack.save(1);
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.frame_count(), 2);

        // replay: outer re-enters first, then inner
        stack.begin_slice();
        assert_eq!(stack.enter("outer", 0, 0), 1);
        assert!(!stack.at_resume_point());
        assert_eq!(stack.enter("inner", 1, 0), 3);
        assert!(stack.at_resume_point());
        assert_eq!(stack.restore().word(0), 7);
        stack.finish_replay();
        stack.leave();
        stack.leave();
        assert!(stack.is_empty());
    }

    #[test]
    fn repeated_suspension_overwrites_the_frame() {
        let mut stack = stack();

        stack.enter("a", 1, 0);
        stack.save(1).put_word(0, 1);

        stack.begin_slice();
        assert_eq!(stack.enter("a", 1, 0), 1);
        stack.finish_replay();

        // park again from the same frame, at a later site
        stack.save(2).put_word(0, 2);

        stack.begin_slice();
        assert_eq!(stack.enter("a", 1, 0), 2);
        assert_eq!(stack.restore().word(0), 2);
        stack.finish_replay();
        stack.leave();
    }

    #[test]
    fn new_calls_after_replay_push_fresh_frames() {
        let mut stack = stack();

        stack.enter("outer", 0, 0);
        stack.enter("inner", 0, 0);
        stack.save(1);
        stack.save(1);

        stack.begin_slice();
        stack.enter("outer", 0, 0);
        stack.enter("inner", 0, 0);
        stack.finish_replay();
        stack.leave(); // inner returns

        // outer makes a second, new call
        assert_eq!(stack.enter("inner2", 0, 0), 0);
        stack.leave();
        stack.leave();
        assert!(stack.is_empty());
    }

    #[test]
    #[should_panic(expected = "replay entered")]
    fn replay_owner_mismatch_is_fatal() {
        let mut stack = stack();
        stack.enter("a", 0, 0);
        stack.save(1);
        stack.begin_slice();
        stack.enter("b", 0, 0);
    }

    #[test]
    #[should_panic(expected = "does not hold a")]
    fn type_confused_slot_is_fatal() {
        let mut stack = stack();
        stack.enter("a", 0, 1);
        stack.save(1).put_obj(0, 7_u32);
        stack.begin_slice();
        stack.enter("a", 0, 1);
        let _: String = stack.restore().take_obj(0);
    }
}
