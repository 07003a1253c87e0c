//! Controller state and request types.

/// Phase of the incremental marker. `Complete` still counts as "marking"
/// for the barrier: the cycle holds until `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkingState {
    Stopped,
    Sweeping,
    Marking,
    Complete,
}

/// How completion is delivered when the worklist drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionAction {
    /// Post an asynchronous GC request through the stack guard.
    GcViaStackGuard,
    /// Only flip the request type; the embedder polls it.
    NoGcViaStackGuard,
}

/// Whether a drain may stop on budget exhaustion or must empty the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceCompletionAction {
    ForceCompletion,
    DoNotForceCompletion,
}

/// Where a step was initiated. Task-origin work is credited against the
/// mutator's schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOrigin {
    Mutator,
    Task,
}

/// Pending request for the embedding loop, set when the worklist drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRequestType {
    None,
    /// Run a finalization round (`finalize_incrementally`).
    Finalization,
    /// Marking is complete; schedule the full pause.
    CompleteMarking,
}

/// Why a cycle was started; recorded for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcReason {
    AllocationLimit,
    IdleTask,
    Testing,
    External,
}
