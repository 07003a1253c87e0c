//! Tuning knobs for the incremental marker.

use crate::types::{KB, MB};

/// Configuration for incremental and concurrent marking behavior.
///
/// The defaults reproduce the production tuning; tests dial individual
/// fields (small worklists, single-threaded marking) to force edge paths.
///
/// # Examples
///
/// ```
/// use greymark::config::MarkingConfig;
///
/// let config = MarkingConfig {
///     concurrent_marking: false,
///     ..MarkingConfig::default()
/// };
/// assert!(config.incremental_marking);
/// assert_eq!(config.target_step_count, 128);
/// ```
#[derive(Debug, Clone)]
pub struct MarkingConfig {
    /// Feature switch; `start` refuses to run when this is off.
    pub incremental_marking: bool,
    /// Run marking tasks on background workers.
    pub concurrent_marking: bool,
    /// Allow new objects to be born black while marking.
    pub black_allocation: bool,
    /// Number of background marking workers.
    pub marker_threads: usize,
    /// Allocation-observer callback period, in bytes.
    pub allocated_threshold: usize,
    /// Target duration of a single step driven from the mutator.
    pub step_size_ms: f64,
    /// Upper clamp used when converting the step budget to bytes.
    pub max_step_size_ms: f64,
    /// Ramp-up window over which per-allocation progress grows to full size.
    pub ramp_up_interval_ms: f64,
    /// Divisor of the initial old-generation size for a full-size step.
    pub target_step_count: usize,
    /// Divisor applied instead when the heap is close to out of memory.
    pub target_step_count_at_oom: usize,
    /// Extra slack added to new-space capacity for the out-of-memory check.
    pub oom_slack_bytes: usize,
    /// Conservative marking-speed estimate before any step has run, bytes/ms.
    pub initial_marking_speed: usize,
    /// Finalization completes unconditionally after this many rounds.
    pub max_finalization_rounds: usize,
    /// Finalization completes once a round discovers less progress than this.
    pub min_progress_during_finalization: usize,
    /// Idle steps tolerated with a non-ready embedder before completion is
    /// requested anyway.
    pub max_idle_marking_delay: usize,
    /// Number of collection cycles a retained map survives without use.
    pub retain_maps_for_n_gc: usize,
    /// Capacity of the bounded marking deque.
    pub worklist_capacity: usize,
    /// Emit timestamped trace lines for every start/step/finalize/stop.
    pub trace_incremental_marking: bool,
}

impl Default for MarkingConfig {
    fn default() -> Self {
        Self {
            incremental_marking: true,
            concurrent_marking: true,
            black_allocation: true,
            marker_threads: num_cpus::get().min(4),
            allocated_threshold: 64 * KB,
            step_size_ms: 1.0,
            max_step_size_ms: 5.0,
            ramp_up_interval_ms: 300.0,
            target_step_count: 128,
            target_step_count_at_oom: 16,
            oom_slack_bytes: 64 * MB,
            initial_marking_speed: 100 * KB,
            max_finalization_rounds: 3,
            min_progress_during_finalization: 32,
            max_idle_marking_delay: 3,
            retain_maps_for_n_gc: 2,
            worklist_capacity: 4096,
            trace_incremental_marking: false,
        }
    }
}
