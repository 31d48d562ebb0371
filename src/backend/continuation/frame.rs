//! Captured frames

use std::sync::Arc;

use smallvec::SmallVec;

use crate::backend::runtime::Value;

/// Captured state of one suspended activation
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationFrame {
    /// Qualified method name, e.g. `demo.Counter.run/0`
    pub method: Arc<str>,
    /// Call-site table version of the method that captured the frame
    pub version: u64,
    /// Call site to resume at
    pub resume_index: u16,
    pub locals: SmallVec<[Value; 8]>,
    /// Pending operands below the interrupted call
    pub operands: SmallVec<[Value; 4]>,
}

/// One entry of a continuation's frame stack
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Activation(ActivationFrame),
    /// A single reference: an activation's receiver, a proxy target, or the
    /// value handed to the suspend primitive
    Reference(Value),
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Activation(_) => "activation",
            Self::Reference(_) => "reference",
        }
    }
}
