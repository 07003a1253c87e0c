//! Error types for the marking runtime.

use std::fmt;

/// Errors surfaced by heap and marking operations.
///
/// Invariant violations (impossible colors, missing forwarding addresses)
/// are not errors; they are debug-checked programming mistakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GcError {
    /// A space ran out of room for the requested allocation.
    OutOfMemory,
    /// An operation referenced an address with no registered object.
    InvalidReference,
    /// The operation is not legal in the collector's current state.
    BadState(&'static str),
}

impl fmt::Display for GcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GcError::OutOfMemory => write!(f, "out of memory"),
            GcError::InvalidReference => write!(f, "invalid object reference"),
            GcError::BadState(what) => write!(f, "bad collector state: {}", what),
        }
    }
}

impl std::error::Error for GcError {}

/// Result type for heap and marking operations.
pub type GcResult<T> = Result<T, GcError>;
