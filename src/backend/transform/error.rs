//! Transformation errors

use std::fmt;

use crate::backend::bytecode::{DecodeError, FormatError};
use crate::backend::hierarchy::ResolveError;

/// Errors that can occur while transforming a compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    /// The unit is not a valid compiled unit.
    Format(FormatError),
    /// A method body contains undecodable code.
    Decode { method: String, source: DecodeError },
    /// The hierarchy of the unit or of a call target could not be resolved.
    Resolve(ResolveError),
    /// A method body is structurally unsupported.
    Malformed { method: String, reason: String },
    /// A relocated jump no longer fits its 16-bit offset.
    BranchOutOfRange { method: String, offset: usize },
}

impl TransformError {
    /// Whether the failure must propagate instead of falling back to the
    /// unchanged bytes
    ///
    /// Only resource exhaustion while loading hierarchy metadata qualifies.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Resolve(err) => err.load_error().is_some_and(|e| e.is_resource_exhaustion()),
            _ => false,
        }
    }

    pub(crate) fn malformed(method: &str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            method: method.to_string(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format(err) => write!(f, "Invalid compiled unit: {}", err),
            Self::Decode { method, source } => write!(f, "Cannot decode {}: {}", method, source),
            Self::Resolve(err) => write!(f, "{}", err),
            Self::Malformed { method, reason } => write!(f, "Unsupported body in {}: {}", method, reason),
            Self::BranchOutOfRange { method, offset } => {
                write!(f, "Jump at offset {} in {} is out of range after transformation", offset, method)
            }
        }
    }
}

impl std::error::Error for TransformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Format(err) => Some(err),
            Self::Decode { source, .. } => Some(source),
            Self::Resolve(err) => Some(err),
            _ => None,
        }
    }
}

impl From<FormatError> for TransformError {
    fn from(err: FormatError) -> Self {
        Self::Format(err)
    }
}

impl From<ResolveError> for TransformError {
    fn from(err: ResolveError) -> Self {
        Self::Resolve(err)
    }
}
