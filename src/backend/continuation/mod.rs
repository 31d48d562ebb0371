//! Continuation Execution Engine
//!
//! A `Continuation` is an immutable snapshot of a suspended run: the frame
//! stack captured at a suspend point plus the value handed to the suspend
//! primitive. Resuming never touches the snapshot; each run works on a private
//! fork of its state.
//!
//! # Run loop
//!
//! ```text
//!   resume(ctx) ──► fork state ──► restoring = frames non-empty ──► entry.run()
//!                                                                      │
//!        ┌─────────────────────────────────────────────────────────────┤
//!        ▼                        ▼                     ▼              ▼
//!   capturing set            no frames left        Signal(Again)   Signal(Cancel)
//!   new Continuation         Ok(None)              fork again,     Ok(Some(self))
//!                                                  run again
//! ```
//!
//! `destroy()` delivers the exit signal to the suspend point instead of a
//! value, so cleanup regions run once on the way out.

mod error;
mod frame;
pub mod recorder;
mod state;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error};

use crate::backend::runtime::Value;

pub use error::ContinuationError;
pub use frame::{ActivationFrame, Frame};
pub use state::{ContinuationState, Phase, ResumeSignal, Signal};

/// Zero-argument entry point of a continuation
pub trait Runnable: Send + Sync {
    fn run(&self) -> Result<(), ContinuationError>;
}

impl<F> Runnable for F
where
    F: Fn() -> Result<(), ContinuationError> + Send + Sync,
{
    fn run(&self) -> Result<(), ContinuationError> {
        self()
    }
}

struct Inner {
    state: ContinuationState,
    value: Option<Value>,
    generation: u64,
    running: AtomicBool,
    destroyed: AtomicBool,
}

/// Handle to a suspended run
///
/// Cloning the handle shares the same snapshot; [`ptr_eq`](Continuation::ptr_eq)
/// tells handles of the same snapshot apart from equal-looking ones.
#[derive(Clone)]
pub struct Continuation {
    inner: Arc<Inner>,
}

/// Resets the running flag when a resume call ends
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Continuation {
    fn from_state(state: ContinuationState, value: Option<Value>, generation: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                state,
                value,
                generation,
                running: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Bind an entry point without running it
    pub fn start_suspended(entry: Arc<dyn Runnable>) -> Self {
        Self::from_state(ContinuationState::new(entry), None, 0)
    }

    /// Run an entry point until it first suspends or completes
    pub fn start(entry: Arc<dyn Runnable>, context: Option<Value>) -> Result<Option<Self>, ContinuationError> {
        Self::start_suspended(entry).resume(context)
    }

    /// Value handed to the suspend primitive that produced this snapshot
    pub fn value(&self) -> Option<&Value> {
        self.inner.value.as_ref()
    }

    /// Context of the resume call running on this thread, if any
    pub fn current_context() -> Option<Value> {
        recorder::current_context()
    }

    /// Number of snapshots materialized in this lineage, this one included
    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Captured frames, innermost first
    pub fn frames(&self) -> &[Frame] {
        self.inner.state.frames()
    }

    pub fn phase(&self) -> Phase {
        if self.inner.destroyed.load(Ordering::Acquire) {
            Phase::Exited
        } else if self.inner.running.load(Ordering::Acquire) {
            Phase::Running
        } else if self.inner.state.frames().is_empty() {
            Phase::Fresh
        } else {
            Phase::Suspended
        }
    }

    /// Whether two handles refer to the same snapshot
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Continue the run from this snapshot
    ///
    /// Returns the next snapshot, or `None` once the entry point completes.
    /// A run that cancels returns this same continuation.
    pub fn resume(&self, context: Option<Value>) -> Result<Option<Self>, ContinuationError> {
        if self.inner.destroyed.load(Ordering::Acquire) {
            return Err(ContinuationError::Exited);
        }
        let _running = self.acquire()?;
        let context = context.unwrap_or(Value::Null);

        loop {
            let outcome = self.run_once(ResumeSignal::Value(context.clone()), Some(context.clone()))?;
            match outcome {
                (Ok(()), state) if state.capturing => return self.finish_capture(state).map(Some),
                (Ok(()), state) => {
                    if state.restoring {
                        return Err(ContinuationError::StackCorruption(
                            "run completed before reaching its suspend point".to_string(),
                        ));
                    }
                    if !state.frames.is_empty() {
                        return Err(ContinuationError::UnconsumedFrames(state.frames.len()));
                    }
                    debug!(target: "replayflow::continuation", generation = self.generation(), "run completed");
                    return Ok(None);
                }
                (Err(ContinuationError::Signal(Signal::Again)), _) => {
                    debug!(target: "replayflow::continuation", generation = self.generation(), "again, restarting from snapshot");
                    continue;
                }
                (Err(ContinuationError::Signal(Signal::Cancel)), _) => {
                    debug!(target: "replayflow::continuation", generation = self.generation(), "cancelled");
                    return Ok(Some(self.clone()));
                }
                (Err(ContinuationError::Signal(Signal::Exit)), _) => {
                    debug!(target: "replayflow::continuation", generation = self.generation(), "exited");
                    return Ok(None);
                }
                (Err(err), _) => {
                    error!(target: "replayflow::continuation", generation = self.generation(), error = %err, "run failed");
                    return Err(err);
                }
            }
        }
    }

    /// Deliver the exit signal to the suspend point, running pending cleanup
    ///
    /// Idempotent: only the first call on a continuation runs anything.
    pub fn destroy(&self) -> Result<(), ContinuationError> {
        let _running = self.acquire()?;
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.inner.state.frames().is_empty() {
            return Ok(());
        }

        match self.run_once(ResumeSignal::Exit, None)? {
            (Ok(()), state) if state.capturing => Err(ContinuationError::StackCorruption(
                "capture started while exiting".to_string(),
            )),
            (Ok(()), _) | (Err(ContinuationError::Signal(_)), _) => {
                debug!(target: "replayflow::continuation", generation = self.generation(), "destroyed");
                Ok(())
            }
            (Err(err), _) => {
                error!(target: "replayflow::continuation", generation = self.generation(), error = %err, "destroy failed");
                Err(err)
            }
        }
    }

    fn acquire(&self) -> Result<RunningGuard<'_>, ContinuationError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Err(ContinuationError::AlreadyRunning);
        }
        Ok(RunningGuard(&self.inner.running))
    }

    /// Run the entry point once on a fresh fork of this snapshot
    fn run_once(
        &self,
        signal: ResumeSignal,
        context: Option<Value>,
    ) -> Result<(Result<(), ContinuationError>, ContinuationState), ContinuationError> {
        let mut state = self.inner.state.fork();
        state.restoring = !state.frames.is_empty();
        state.signal = signal;
        state.context = context;
        let entry = Arc::clone(state.entry());

        let guard = recorder::install(state);
        let outcome = entry.run();
        let state = guard.finish().ok_or(ContinuationError::NoActiveContinuation)?;
        Ok((outcome, state))
    }

    /// Turn a completed capturing pass into the next snapshot
    fn finish_capture(&self, mut state: ContinuationState) -> Result<Self, ContinuationError> {
        // The entry point's own reference frame is never restored by a caller
        match state.pop() {
            Some(Frame::Reference(_)) => {}
            Some(other) => {
                return Err(ContinuationError::StackCorruption(format!(
                    "expected the entry point's reference frame on top, found {} frame",
                    other.kind()
                )))
            }
            None => return Err(ContinuationError::FrameUnderflow),
        }
        if !matches!(state.frames.last(), Some(Frame::Activation(_))) {
            return Err(ContinuationError::StackCorruption(
                "entry point suspended without recording an activation".to_string(),
            ));
        }

        let value = state.yielded.take();
        let frames = state.frames.len();
        let next = Self::from_state(state.fork(), value, self.generation() + 1);
        debug!(
            target: "replayflow::continuation",
            generation = next.generation(),
            frames,
            "captured"
        );
        Ok(next)
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("phase", &self.phase())
            .field("generation", &self.inner.generation)
            .field("frames", &self.inner.state.frames().len())
            .field("value", &self.inner.value)
            .finish()
    }
}
