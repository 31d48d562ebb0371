//! Active-state binding and continuation primitives
//!
//! Exactly one `ContinuationState` is active per thread while a resume call
//! runs its entry point. Transformed code, natives and proxy handlers reach it
//! through the functions in this module; each borrows the state only for the
//! duration of one operation.
//!
//! The manual frame helpers (`capture_activation`, `restore_activation`,
//! `pop_reference`) let hand-written Rust entry points follow the same frame
//! protocol as transformed bytecode.

use std::cell::RefCell;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::trace;

use super::error::ContinuationError;
use super::frame::{ActivationFrame, Frame};
use super::state::{ContinuationState, ResumeSignal, Signal};
use crate::backend::runtime::Value;

thread_local! {
    static ACTIVE: RefCell<Option<ContinuationState>> = const { RefCell::new(None) };
}

/// Installs a state as active for the current thread
///
/// Whatever was active before is put back when the guard finishes or drops,
/// so resume calls nest and a panicking entry point cannot leak its state.
pub(crate) struct ActiveGuard {
    previous: Option<ContinuationState>,
    finished: bool,
}

pub(crate) fn install(state: ContinuationState) -> ActiveGuard {
    let previous = ACTIVE.with(|active| active.borrow_mut().replace(state));
    ActiveGuard { previous, finished: false }
}

impl ActiveGuard {
    /// Uninstall and return the state the run left behind
    pub(crate) fn finish(mut self) -> Option<ContinuationState> {
        self.finished = true;
        let previous = self.previous.take();
        ACTIVE.with(|active| std::mem::replace(&mut *active.borrow_mut(), previous))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if !self.finished {
            let previous = self.previous.take();
            let _ = ACTIVE.try_with(|active| {
                if let Ok(mut slot) = active.try_borrow_mut() {
                    *slot = previous;
                }
            });
        }
    }
}

/// Run `f` against the active state
pub fn with_current<R>(f: impl FnOnce(&mut ContinuationState) -> R) -> Result<R, ContinuationError> {
    ACTIVE.with(|active| {
        let mut slot = active.borrow_mut();
        let state = slot.as_mut().ok_or(ContinuationError::NoActiveContinuation)?;
        Ok(f(state))
    })
}

/// Whether a continuation is active on this thread
pub fn is_active() -> bool {
    ACTIVE.with(|active| active.borrow().is_some())
}

/// Whether the active run is capturing; false outside any continuation
pub fn is_capturing() -> bool {
    ACTIVE.with(|active| active.borrow().as_ref().is_some_and(|s| s.capturing))
}

/// Whether the active run is restoring; false outside any continuation
pub fn is_restoring() -> bool {
    ACTIVE.with(|active| active.borrow().as_ref().is_some_and(|s| s.restoring))
}

/// Context passed to the resume call currently running
pub fn current_context() -> Option<Value> {
    ACTIVE.with(|active| active.borrow().as_ref().and_then(|s| s.context.clone()))
}

/// The suspend primitive
///
/// On a normal run this records `value` as the innermost frame, starts the
/// capturing pass and returns null. On a restoring pass it consumes that
/// frame, ends the restore and returns the resume value, or fails with the
/// exit signal when the continuation is being destroyed. While an exit is
/// being delivered it does nothing.
pub fn suspend(value: Value) -> Result<Value, ContinuationError> {
    with_current(|state| {
        if state.restoring {
            let frame = state.pop().ok_or(ContinuationError::FrameUnderflow)?;
            let Frame::Reference(_) = frame else {
                return Err(ContinuationError::FrameKindMismatch {
                    expected: "reference",
                    found: frame.kind(),
                });
            };
            state.restoring = false;
            if !state.frames.is_empty() {
                return Err(ContinuationError::UnconsumedFrames(state.frames.len()));
            }
            trace!(target: "replayflow::continuation", "suspend point reached, restore complete");
            match &state.signal {
                ResumeSignal::Exit => {
                    state.exiting = true;
                    Err(ContinuationError::Signal(Signal::Exit))
                }
                ResumeSignal::Value(v) => Ok(v.clone()),
                ResumeSignal::Again | ResumeSignal::Cancel => Ok(Value::Null),
            }
        } else if state.exiting {
            Ok(Value::Null)
        } else if state.capturing {
            Err(ContinuationError::StackCorruption(
                "suspend called while a capture is in progress".to_string(),
            ))
        } else {
            trace!(target: "replayflow::continuation", value = %value, "suspend, capture begins");
            state.yielded = Some(value.clone());
            state.push(Frame::Reference(value));
            state.capturing = true;
            Ok(Value::Null)
        }
    })?
}

/// Restart the current run from its last suspend point
pub fn again() -> Result<(), ContinuationError> {
    signal(Signal::Again)
}

/// Abandon the current run; the driver gets back the continuation it resumed
pub fn cancel() -> Result<(), ContinuationError> {
    signal(Signal::Cancel)
}

/// Unwind the current run fully, running cleanup regions
pub fn exit() -> Result<(), ContinuationError> {
    signal(Signal::Exit)
}

fn signal(signal: Signal) -> Result<(), ContinuationError> {
    with_current(|state| {
        state.signal = match signal {
            Signal::Again => ResumeSignal::Again,
            Signal::Cancel => ResumeSignal::Cancel,
            Signal::Exit => {
                state.exiting = true;
                ResumeSignal::Exit
            }
        };
    })?;
    trace!(target: "replayflow::continuation", ?signal, "control signal raised");
    Err(ContinuationError::Signal(signal))
}

/// Push a frame onto the active state
pub fn push_frame(frame: Frame) -> Result<(), ContinuationError> {
    with_current(|state| state.push(frame))
}

/// Pop the next frame, which must be an activation
pub fn pop_activation() -> Result<ActivationFrame, ContinuationError> {
    with_current(|state| match state.pop() {
        Some(Frame::Activation(frame)) => Ok(frame),
        Some(other) => Err(ContinuationError::FrameKindMismatch {
            expected: "activation",
            found: other.kind(),
        }),
        None => Err(ContinuationError::FrameUnderflow),
    })?
}

/// Pop the next frame, which must be a reference
pub fn pop_reference() -> Result<Value, ContinuationError> {
    with_current(|state| match state.pop() {
        Some(Frame::Reference(value)) => Ok(value),
        Some(other) => Err(ContinuationError::FrameKindMismatch {
            expected: "reference",
            found: other.kind(),
        }),
        None => Err(ContinuationError::FrameUnderflow),
    })?
}

/// Record a hand-written activation during a capturing pass
///
/// Pushes the activation followed by a reference to `this`, as a transformed
/// method does. Manual frames use version 0.
pub fn capture_activation(
    method: &str,
    resume_index: u16,
    locals: SmallVec<[Value; 8]>,
    this: Value,
) -> Result<(), ContinuationError> {
    with_current(|state| {
        state.push(Frame::Activation(ActivationFrame {
            method: Arc::from(method),
            version: 0,
            resume_index,
            locals,
            operands: SmallVec::new(),
        }));
        state.push(Frame::Reference(this));
    })
}

/// Reload a hand-written activation on a restoring pass
///
/// Returns `None` on a normal run. The frame must have been captured by the
/// same `method`.
pub fn restore_activation(method: &str) -> Result<Option<ActivationFrame>, ContinuationError> {
    if !is_restoring() {
        return Ok(None);
    }
    let frame = pop_activation()?;
    if &*frame.method != method {
        return Err(ContinuationError::StackCorruption(format!(
            "frame of {} restored into {}",
            frame.method, method
        )));
    }
    Ok(Some(frame))
}
