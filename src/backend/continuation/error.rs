//! Continuation engine errors

use std::fmt;

use super::state::Signal;
use crate::backend::runtime::Value;
use crate::backend::vm::VmError;

/// Errors raised by the continuation engine and its recorder
///
/// Structural variants (`FrameUnderflow` through `StackCorruption`) mean the
/// transformed code and the engine disagree about the frame protocol. They
/// are never retried.
#[derive(Debug, Clone)]
pub enum ContinuationError {
    /// `resume` or `destroy` on a continuation that is already running
    AlreadyRunning,
    /// `resume` on a destroyed continuation
    Exited,
    /// A primitive was called outside of any resume call
    NoActiveContinuation,
    /// Restoring expected a pending frame but the stack was empty
    FrameUnderflow,
    /// The next frame has the wrong kind
    FrameKindMismatch { expected: &'static str, found: &'static str },
    /// A frame was captured by a different version of the method
    VersionMismatch { method: String, expected: u64, found: u64 },
    /// A frame names a call site the method does not have
    InvalidResumeIndex { method: String, index: u16 },
    /// A run completed normally while frames were still pending
    UnconsumedFrames(usize),
    /// The frame stack is not shaped as the protocol requires
    StackCorruption(String),
    /// A thrown value escaped the entry point
    Uncaught(Value),
    /// A control signal unwinding toward the engine
    Signal(Signal),
    /// Any other interpreter failure
    Vm(Box<VmError>),
}

impl ContinuationError {
    /// Whether the error indicates a broken frame protocol
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::FrameUnderflow
                | Self::FrameKindMismatch { .. }
                | Self::VersionMismatch { .. }
                | Self::InvalidResumeIndex { .. }
                | Self::UnconsumedFrames(_)
                | Self::StackCorruption(_)
        )
    }
}

impl fmt::Display for ContinuationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "continuation is already running"),
            Self::Exited => write!(f, "continuation has exited"),
            Self::NoActiveContinuation => write!(f, "no continuation is active on this thread"),
            Self::FrameUnderflow => write!(f, "frame stack underflow while restoring"),
            Self::FrameKindMismatch { expected, found } => {
                write!(f, "expected {} frame, found {} frame", expected, found)
            }
            Self::VersionMismatch { method, expected, found } => write!(
                f,
                "frame for {} was captured by version {:016x}, current version is {:016x}",
                method, found, expected
            ),
            Self::InvalidResumeIndex { method, index } => {
                write!(f, "{} has no call site {}", method, index)
            }
            Self::UnconsumedFrames(n) => write!(f, "run completed with {} unconsumed frames", n),
            Self::StackCorruption(msg) => write!(f, "frame stack corrupted: {}", msg),
            Self::Uncaught(value) => write!(f, "uncaught fault: {}", value),
            Self::Signal(signal) => write!(f, "unhandled continuation signal {:?}", signal),
            Self::Vm(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ContinuationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Vm(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<VmError> for ContinuationError {
    fn from(err: VmError) -> Self {
        match err {
            VmError::Signal(signal) => Self::Signal(signal),
            VmError::Continuation(inner) => inner,
            VmError::Thrown(value) => Self::Uncaught(value),
            other => Self::Vm(Box::new(other)),
        }
    }
}
