//! Step scheduling: allocation-driven and deadline-driven advances, step
//! sizing, and the marking-speed estimate.

use std::sync::atomic::Ordering;

use crate::heap::GcState;

use super::core::IncrementalMarking;
use super::types::*;

impl IncrementalMarking {
    /// Finish deferred sweeping; transitions to `Marking` once the sweeper
    /// is out of the way.
    pub(super) fn finalize_sweeping(&self) {
        debug_assert!(self.is_sweeping());
        let compactor = self.heap.compactor();
        if compactor.sweeping_in_progress() && !compactor.are_sweeper_tasks_running() {
            compactor.ensure_sweeping_completed();
        }
        if !compactor.sweeping_in_progress() {
            self.start_marking();
        }
    }

    /// Allocation debt accumulated since the last snapshot of the
    /// old-generation allocation counter.
    pub(super) fn step_size_to_keep_up_with_allocations(&self) -> usize {
        let current = self.heap.old_generation_allocation_counter();
        let last = self
            .old_generation_allocation_counter
            .swap(current, Ordering::AcqRel);
        let newly_allocated = current.saturating_sub(last);
        self.bytes_allocated.fetch_add(newly_allocated, Ordering::AcqRel) + newly_allocated
    }

    /// Progress-making share of a step, ramped up over the first interval
    /// of the cycle so early marking work stays in background tasks. Under
    /// memory pressure the target step count collapses so marking finishes
    /// sooner.
    pub(super) fn step_size_to_make_progress(&self) -> usize {
        let oom_slack = self.heap.new_space().capacity() + self.config.oom_slack_bytes;
        if self.heap.is_close_to_out_of_memory(oom_slack) {
            return self.heap.promoted_space_size() / self.config.target_step_count_at_oom;
        }

        let step_size = (self.initial_old_generation_size.load(Ordering::Acquire)
            / self.config.target_step_count)
            .max(self.config.allocated_threshold);
        let time_passed_ms = self.heap.monotonic_ms() - self.start_time_ms();
        let factor = (time_passed_ms / self.config.ramp_up_interval_ms).min(1.0);
        (factor * step_size as f64) as usize
    }

    /// Convert a millisecond budget into bytes using the observed marking
    /// speed.
    pub(super) fn estimate_marking_step_size(&self, ms: f64) -> usize {
        let speed = self.marking_speed_bytes_per_ms.load(Ordering::Acquire);
        ((speed as f64) * ms) as usize
    }

    /// Allocation-observer entry point: compute the step budget and either
    /// consume schedule credit earned by background tasks or run a step.
    pub fn advance_on_allocation(&self) {
        // Under an always-allocate scope the GC state must not change, so
        // no marking steps may run.
        if self.heap.gc_state() != GcState::NotInGc
            || !self.config.incremental_marking
            || !matches!(self.state(), MarkingState::Sweeping | MarkingState::Marking)
            || self.heap.always_allocate()
        {
            return;
        }

        let bytes_to_process =
            self.step_size_to_keep_up_with_allocations() + self.step_size_to_make_progress();

        if bytes_to_process < self.config.allocated_threshold {
            return;
        }

        // The first step after a scavenge sees many allocated bytes; cap
        // the step to spread the work uniformly.
        let max_step_size = self.estimate_marking_step_size(self.config.max_step_size_ms);
        let bytes_to_process = bytes_to_process.min(max_step_size);

        let bytes_processed;
        if self.bytes_marked_ahead_of_schedule.load(Ordering::Acquire) >= bytes_to_process {
            // Background tasks have put us ahead of schedule; consume the
            // credit instead of marking here.
            self.bytes_marked_ahead_of_schedule
                .fetch_sub(bytes_to_process, Ordering::AcqRel);
            bytes_processed = bytes_to_process;
        } else {
            bytes_processed = self.step(
                bytes_to_process,
                CompletionAction::GcViaStackGuard,
                ForceCompletionAction::ForceCompletion,
                StepOrigin::Mutator,
            );
        }
        let allocated = self.bytes_allocated.load(Ordering::Acquire);
        self.bytes_allocated
            .fetch_sub(allocated.min(bytes_processed), Ordering::AcqRel);
    }

    /// Deadline-driven advance: alternate wrapper tracing and marking
    /// steps while time remains, the cycle is incomplete, and there is
    /// work. Returns the remaining time.
    pub fn advance(
        &self,
        deadline_ms: f64,
        action: CompletionAction,
        completion: ForceCompletionAction,
        origin: StepOrigin,
    ) -> f64 {
        debug_assert!(!self.is_stopped());

        let step_size = self.estimate_marking_step_size(self.config.step_size_ms);
        let incremental_wrapper_tracing =
            self.state() == MarkingState::Marking && self.embedder.in_use();
        let mut remaining_time_ms;
        loop {
            let trace_wrappers = incremental_wrapper_tracing
                && self.trace_wrappers_toggle.load(Ordering::Acquire);
            if trace_wrappers {
                if !self.embedder.should_finalize_incremental_marking() {
                    let wrapper_deadline = self.heap.monotonic_ms() + self.config.step_size_ms;
                    self.embedder.trace(wrapper_deadline);
                }
            } else {
                self.step(step_size, action, completion, origin);
            }
            self.trace_wrappers_toggle
                .fetch_xor(true, Ordering::AcqRel);
            remaining_time_ms = deadline_ms - self.heap.monotonic_ms();
            if remaining_time_ms < self.config.step_size_ms
                || self.is_complete()
                || self.worklist.is_empty()
            {
                break;
            }
        }
        remaining_time_ms
    }

    /// One marking step: finish sweeping if due, drain up to the byte
    /// budget, and drive completion when the worklist is empty.
    pub fn step(
        &self,
        bytes_to_process: usize,
        action: CompletionAction,
        completion: ForceCompletionAction,
        origin: StepOrigin,
    ) -> usize {
        let start_ms = self.heap.monotonic_ms();

        if self.state() == MarkingState::Sweeping {
            self.finalize_sweeping();
        }

        let mut bytes_processed = 0;
        if self.state() == MarkingState::Marking {
            bytes_processed = self.process_marking_worklist(
                bytes_to_process,
                ForceCompletionAction::DoNotForceCompletion,
            );
            if origin == StepOrigin::Task {
                self.bytes_marked_ahead_of_schedule
                    .fetch_add(bytes_processed, Ordering::AcqRel);
            }

            if self.worklist.is_empty() {
                if self.embedder.should_finalize_incremental_marking() {
                    if completion == ForceCompletionAction::ForceCompletion
                        || self.is_idle_marking_delay_counter_limit_reached()
                    {
                        if !self.finalize_marking_completed() {
                            self.finalize_marking(action);
                        } else {
                            self.marking_complete(action);
                        }
                    } else {
                        self.increment_idle_marking_delay_counter();
                    }
                } else {
                    self.embedder.notify_marking_worklist_was_empty();
                }
            }
        }

        if let Some(concurrent) = &self.concurrent {
            concurrent.reschedule_tasks_if_needed();
        }

        let duration_ms = self.heap.monotonic_ms() - start_ms;
        self.update_marking_speed(bytes_processed, duration_ms);
        // Zero bytes are reported while sweeping or right after marking
        // started; no worklist work happened then.
        self.stats.rcu(|stats| {
            let mut stats = (**stats).clone();
            stats.steps += 1;
            stats.bytes_processed += bytes_processed;
            stats.total_step_duration_ms += duration_ms;
            if duration_ms > stats.longest_step_duration_ms {
                stats.longest_step_duration_ms = duration_ms;
            }
            stats
        });
        if self.config.trace_incremental_marking {
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] Step {} {} bytes ({}) in {:.1} ms",
                match origin {
                    StepOrigin::Mutator => "in mutator",
                    StepOrigin::Task => "in task",
                },
                bytes_processed,
                bytes_to_process,
                duration_ms
            );
        }
        bytes_processed
    }

    fn update_marking_speed(&self, bytes_processed: usize, duration_ms: f64) {
        if bytes_processed == 0 || duration_ms <= 0.0 {
            return;
        }
        let observed = (bytes_processed as f64 / duration_ms) as usize;
        let previous = self.marking_speed_bytes_per_ms.load(Ordering::Acquire);
        // Low-pass the estimate so one outlier step cannot swing the
        // budget-to-bytes conversion.
        let updated = (previous + observed.max(1)) / 2;
        self.marking_speed_bytes_per_ms
            .store(updated.max(1), Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Idle-marker stall handling

    pub(super) fn is_idle_marking_delay_counter_limit_reached(&self) -> bool {
        self.idle_marking_delay_counter.load(Ordering::Acquire) > self.config.max_idle_marking_delay
    }

    pub(super) fn increment_idle_marking_delay_counter(&self) {
        self.idle_marking_delay_counter
            .fetch_add(1, Ordering::AcqRel);
    }

    pub fn clear_idle_marking_delay_counter(&self) {
        self.idle_marking_delay_counter.store(0, Ordering::Release);
    }
}
