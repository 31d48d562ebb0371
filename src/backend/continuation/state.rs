//! Per-run continuation state

use std::fmt;
use std::sync::Arc;

use super::frame::Frame;
use super::Runnable;
use crate::backend::runtime::Value;

/// Control signal that unwinds running code back to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Restart from the last suspend point without materializing a snapshot
    Again,
    /// Abandon this run; the caller keeps the continuation it already holds
    Cancel,
    /// Unwind fully, running cleanup regions
    Exit,
}

/// Signal pending for the suspend point a restoring pass is heading to
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeSignal {
    Value(Value),
    Again,
    Cancel,
    Exit,
}

/// Externally visible lifecycle phase of a continuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Entry point bound, nothing captured yet
    Fresh,
    /// A resume or destroy holds the continuation
    Running,
    /// Captured and waiting for a resume
    Suspended,
    Exited,
}

/// Mutable record of one run of a continuation
///
/// A resume never mutates the state of the continuation it was called on; it
/// works on a private [`fork`](ContinuationState::fork).
#[derive(Clone)]
pub struct ContinuationState {
    pub(crate) frames: Vec<Frame>,
    pub(crate) capturing: bool,
    pub(crate) restoring: bool,
    /// Set while an exit signal is being delivered; suspension is disabled
    pub(crate) exiting: bool,
    pub(crate) signal: ResumeSignal,
    pub(crate) context: Option<Value>,
    pub(crate) yielded: Option<Value>,
    pub(crate) entry: Arc<dyn Runnable>,
}

impl ContinuationState {
    pub fn new(entry: Arc<dyn Runnable>) -> Self {
        Self {
            frames: Vec::new(),
            capturing: false,
            restoring: false,
            exiting: false,
            signal: ResumeSignal::Value(Value::Null),
            context: None,
            yielded: None,
            entry,
        }
    }

    /// Private copy for a new run: frames copied, transient fields reset
    pub fn fork(&self) -> Self {
        Self {
            frames: self.frames.clone(),
            capturing: false,
            restoring: false,
            exiting: false,
            signal: ResumeSignal::Value(Value::Null),
            context: None,
            yielded: None,
            entry: Arc::clone(&self.entry),
        }
    }

    #[inline]
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    #[inline]
    pub fn is_capturing(&self) -> bool {
        self.capturing
    }

    #[inline]
    pub fn is_restoring(&self) -> bool {
        self.restoring
    }

    #[inline]
    pub fn signal(&self) -> &ResumeSignal {
        &self.signal
    }

    pub fn entry(&self) -> &Arc<dyn Runnable> {
        &self.entry
    }

    pub(crate) fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }
}

impl fmt::Debug for ContinuationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuationState")
            .field("frames", &self.frames.len())
            .field("capturing", &self.capturing)
            .field("restoring", &self.restoring)
            .field("exiting", &self.exiting)
            .field("signal", &self.signal)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::continuation::{ActivationFrame, ContinuationError};
    use smallvec::smallvec;

    fn noop() -> Arc<dyn Runnable> {
        Arc::new(|| -> Result<(), ContinuationError> { Ok(()) })
    }

    #[test]
    fn test_fork_resets_transient_fields() {
        let mut state = ContinuationState::new(noop());
        state.push(Frame::Reference(Value::Int(1)));
        state.capturing = true;
        state.restoring = true;
        state.exiting = true;
        state.signal = ResumeSignal::Exit;
        state.yielded = Some(Value::Int(1));

        let fork = state.fork();
        assert_eq!(fork.frames(), state.frames());
        assert!(!fork.is_capturing());
        assert!(!fork.is_restoring());
        assert!(!fork.exiting);
        assert_eq!(fork.signal(), &ResumeSignal::Value(Value::Null));
        assert!(fork.yielded.is_none());
    }

    #[test]
    fn test_fork_does_not_alias_frames() {
        let mut state = ContinuationState::new(noop());
        state.push(Frame::Activation(ActivationFrame {
            method: "demo.Main.run/0".into(),
            version: 1,
            resume_index: 0,
            locals: smallvec![Value::Int(5)],
            operands: smallvec![],
        }));

        let mut fork = state.fork();
        fork.pop();
        fork.push(Frame::Reference(Value::Null));

        assert_eq!(state.frames().len(), 1);
        assert_eq!(state.frames()[0].kind(), "activation");
    }
}
