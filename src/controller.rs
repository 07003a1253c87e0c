//! The incremental marking controller: tri-color state machine, write
//! barrier entry points, step scheduler, black allocation, finalization
//! handshake, and scavenge integration.

mod core;
mod protocol;
mod stepping;
mod types;

pub use self::core::IncrementalMarking;
pub use self::types::{
    CompletionAction, ForceCompletionAction, GcReason, GcRequestType, MarkingState, StepOrigin,
};
