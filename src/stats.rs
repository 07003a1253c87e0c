//! Marking statistics published for monitoring.

use crate::controller::GcReason;

/// Snapshot of marking activity, published through an `ArcSwap` and updated
/// with `rcu` so telemetry reads never contend with the marker.
#[derive(Debug, Default, Clone)]
pub struct MarkingStats {
    /// Cycles started, by `start` call.
    pub cycles_started: usize,
    /// Reason passed to the most recent `start`.
    pub last_start_reason: Option<GcReason>,
    /// Steps executed (mutator- and task-origin).
    pub steps: usize,
    /// Bytes drained from the worklist across all steps.
    pub bytes_processed: usize,
    /// Wall-clock total across steps.
    pub total_step_duration_ms: f64,
    /// Longest single step observed.
    pub longest_step_duration_ms: f64,
    /// Finalization rounds performed across all cycles.
    pub finalization_rounds: usize,
}

impl MarkingStats {
    pub fn average_step_duration_ms(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.total_step_duration_ms / self.steps as f64
        }
    }
}
