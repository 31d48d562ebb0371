//! Type definitions for the VM.
//!
//! This module contains the core types used throughout the VM:
//! - VmError: Error types that can occur during execution
//! - CallFrame: Activation record of one method invocation
//! - Step: Outcome of executing one instruction
//! - VmConfig: VM configuration options

use std::sync::Arc;

use serde::Deserialize;
use smallvec::SmallVec;

use crate::backend::bytecode::MethodBody;
use crate::backend::continuation::{ContinuationError, Signal};
use crate::backend::runtime::{MethodHandle, Value};

/// Result of VM execution
pub type VmResult<T> = Result<T, VmError>;

/// Errors that can occur during VM execution
#[derive(Debug, Clone)]
pub enum VmError {
    /// Stack underflow
    StackUnderflow,
    /// Invalid opcode byte
    InvalidOpcode(u8),
    /// Invalid or mistyped constant index
    InvalidConstant(u16),
    /// Invalid local variable index
    InvalidLocal(u8),
    /// Type error in operation
    TypeError { expected: &'static str, got: &'static str },
    /// Arithmetic overflow
    ArithmeticOverflow,
    /// Instruction pointer out of bounds
    IpOutOfBounds,
    /// Call stack overflow
    CallStackOverflow,
    /// Value stack overflow
    ValueStackOverflow,
    /// No such type
    UnknownType(String),
    /// A type could not be loaded or defined
    TypeLoad { name: String, reason: String },
    /// No such method, or the method has no body
    UnknownMethod { owner: String, method: String },
    /// No such native function
    UnknownNative(String),
    /// Native called with the wrong number of arguments
    ArityMismatch { name: String, expected: usize, got: usize },
    /// Virtual call or field access on null
    NullReceiver { member: String },
    /// A value raised by `throw`
    Thrown(Value),
    /// A continuation control signal unwinding the call chain
    Signal(Signal),
    /// Continuation bookkeeping failed
    Continuation(ContinuationError),
}

impl VmError {
    /// Whether a handler of the given kind may intercept this error
    pub fn is_catchable(&self) -> bool {
        matches!(self, Self::Thrown(_) | Self::Signal(Signal::Exit))
    }
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StackUnderflow => write!(f, "Stack underflow"),
            Self::InvalidOpcode(b) => write!(f, "Invalid opcode: 0x{:02x}", b),
            Self::InvalidConstant(i) => write!(f, "Invalid constant index: {}", i),
            Self::InvalidLocal(i) => write!(f, "Invalid local variable index: {}", i),
            Self::TypeError { expected, got } => {
                write!(f, "Type error: expected {}, got {}", expected, got)
            }
            Self::ArithmeticOverflow => write!(f, "Arithmetic overflow"),
            Self::IpOutOfBounds => write!(f, "Instruction pointer out of bounds"),
            Self::CallStackOverflow => write!(f, "Call stack overflow"),
            Self::ValueStackOverflow => write!(f, "Value stack overflow"),
            Self::UnknownType(name) => write!(f, "Unknown type: {}", name),
            Self::TypeLoad { name, reason } => write!(f, "Failed to load type {}: {}", name, reason),
            Self::UnknownMethod { owner, method } => write!(f, "Unknown method: {}.{}", owner, method),
            Self::UnknownNative(name) => write!(f, "Unknown native function: {}", name),
            Self::ArityMismatch { name, expected, got } => {
                write!(f, "{}: expected {} arguments, got {}", name, expected, got)
            }
            Self::NullReceiver { member } => write!(f, "Null receiver for {}", member),
            Self::Thrown(value) => write!(f, "Uncaught fault: {}", value),
            Self::Signal(signal) => write!(f, "Continuation signal: {:?}", signal),
            Self::Continuation(err) => write!(f, "Continuation error: {}", err),
        }
    }
}

impl std::error::Error for VmError {}

impl From<ContinuationError> for VmError {
    fn from(err: ContinuationError) -> Self {
        match err {
            ContinuationError::Signal(signal) => Self::Signal(signal),
            ContinuationError::Vm(inner) => *inner,
            other => Self::Continuation(other),
        }
    }
}

/// Activation record on the call stack
#[derive(Debug, Clone)]
pub struct CallFrame {
    /// The method being executed
    pub method: MethodHandle,
    /// Its body
    pub body: Arc<MethodBody>,
    /// Next instruction
    pub ip: usize,
    /// Start of the instruction currently executing, used for handler lookup
    pub insn_start: usize,
    /// Value stack height at entry
    pub base: usize,
    /// `this` for instance methods, null for static ones
    pub receiver: Value,
    /// Local slots: receiver, parameters, then temporaries
    pub locals: SmallVec<[Value; 8]>,
}

/// Outcome of executing one instruction
#[derive(Debug)]
pub enum Step {
    Continue,
    /// The current frame returned, with its result if any
    Returned(Option<Value>),
}

/// Configuration for the VM
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Maximum value stack size
    pub max_value_stack: usize,
    /// Maximum call stack depth
    pub max_call_depth: usize,
    /// Enable per-instruction tracing
    pub trace: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_value_stack: 65536,
            max_call_depth: 1024,
            trace: false,
        }
    }
}
