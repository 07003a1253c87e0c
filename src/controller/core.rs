//! Controller struct, construction, and accessors.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use crossbeam_utils::atomic::AtomicCell;

use crate::concurrent::ConcurrentMarker;
use crate::config::MarkingConfig;
use crate::embedder::EmbedderTracer;
use crate::heap::{AllocationObserver, Heap};
use crate::marking::{AccessMode, MarkBitmap, MarkingWorklist};
use crate::stats::MarkingStats;
use crate::types::Address;

use super::types::*;

/// The incremental marker. One per heap; owns the worklist, the state
/// flags, and the step counters. The mark bitmap is shared with the write
/// barrier and the concurrent workers through atomic access.
pub struct IncrementalMarking {
    pub(super) heap: Arc<Heap>,
    pub(super) config: MarkingConfig,
    pub(super) bitmap: Arc<MarkBitmap>,
    pub(super) worklist: MarkingWorklist,
    pub(super) embedder: Arc<dyn EmbedderTracer>,
    pub(super) concurrent: Option<Arc<ConcurrentMarker>>,

    pub(super) state: Arc<AtomicCell<MarkingState>>,
    pub(super) is_compacting: AtomicBool,
    pub(super) should_hurry: AtomicBool,
    pub(super) was_activated: AtomicBool,
    pub(super) finalize_marking_completed: AtomicBool,
    pub(super) trace_wrappers_toggle: AtomicBool,
    pub(super) request_type: AtomicCell<GcRequestType>,

    pub(super) start_time_ms: AtomicU64,
    pub(super) initial_old_generation_size: AtomicUsize,
    pub(super) old_generation_allocation_counter: AtomicUsize,
    pub(super) bytes_allocated: AtomicUsize,
    pub(super) bytes_marked_ahead_of_schedule: Arc<AtomicUsize>,
    pub(super) unscanned_bytes_of_large_object: AtomicUsize,
    pub(super) idle_marking_delay_counter: AtomicUsize,
    pub(super) finalization_rounds: AtomicUsize,
    pub(super) marking_speed_bytes_per_ms: AtomicUsize,

    pub(super) stats: ArcSwap<MarkingStats>,

    pub(super) new_generation_observer: Arc<dyn AllocationObserver>,
    pub(super) old_generation_observer: Arc<dyn AllocationObserver>,
}

impl IncrementalMarking {
    pub fn new(
        heap: &Arc<Heap>,
        config: MarkingConfig,
        embedder: Arc<dyn EmbedderTracer>,
    ) -> Arc<Self> {
        let bitmap = Arc::clone(heap.marking_bitmap());
        let worklist = MarkingWorklist::new(config.worklist_capacity);
        let state = Arc::new(AtomicCell::new(MarkingState::Stopped));
        let bytes_marked_ahead_of_schedule = Arc::new(AtomicUsize::new(0));
        let initial_marking_speed = config.initial_marking_speed;
        let concurrent = if config.concurrent_marking {
            Some(ConcurrentMarker::new(
                heap,
                &bitmap,
                worklist.clone(),
                &state,
                &bytes_marked_ahead_of_schedule,
                config.marker_threads,
            ))
        } else {
            None
        };

        Arc::new_cyclic(|weak: &Weak<IncrementalMarking>| Self {
            heap: Arc::clone(heap),
            config,
            bitmap,
            worklist,
            embedder,
            concurrent,
            state,
            is_compacting: AtomicBool::new(false),
            should_hurry: AtomicBool::new(false),
            was_activated: AtomicBool::new(false),
            finalize_marking_completed: AtomicBool::new(false),
            trace_wrappers_toggle: AtomicBool::new(false),
            request_type: AtomicCell::new(GcRequestType::None),
            start_time_ms: AtomicU64::new(0),
            initial_old_generation_size: AtomicUsize::new(0),
            old_generation_allocation_counter: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
            bytes_marked_ahead_of_schedule,
            unscanned_bytes_of_large_object: AtomicUsize::new(0),
            idle_marking_delay_counter: AtomicUsize::new(0),
            finalization_rounds: AtomicUsize::new(0),
            marking_speed_bytes_per_ms: AtomicUsize::new(initial_marking_speed),
            stats: ArcSwap::from_pointee(MarkingStats::default()),
            new_generation_observer: Arc::new(MarkingObserver {
                marking: weak.clone(),
            }),
            old_generation_observer: Arc::new(MarkingObserver {
                marking: weak.clone(),
            }),
        })
    }

    // ---------------------------------------------------------------
    // State queries

    pub fn state(&self) -> MarkingState {
        self.state.load()
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == MarkingState::Stopped
    }

    pub fn is_sweeping(&self) -> bool {
        self.state() == MarkingState::Sweeping
    }

    /// Marking or already complete: the cycle is live and barriers are on.
    pub fn is_marking(&self) -> bool {
        matches!(self.state(), MarkingState::Marking | MarkingState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.state() == MarkingState::Complete
    }

    pub fn is_compacting(&self) -> bool {
        self.is_compacting.load(Ordering::Acquire)
    }

    pub fn black_allocation(&self) -> bool {
        self.heap.black_allocator().is_active()
    }

    pub fn was_activated(&self) -> bool {
        self.was_activated.load(Ordering::Acquire)
    }

    pub fn should_hurry(&self) -> bool {
        self.should_hurry.load(Ordering::Acquire)
    }

    pub fn set_should_hurry(&self, hurry: bool) {
        self.should_hurry.store(hurry, Ordering::Release);
    }

    pub fn finalize_marking_completed(&self) -> bool {
        self.finalize_marking_completed.load(Ordering::Acquire)
    }

    /// Pending request for the embedding loop.
    pub fn request_type(&self) -> GcRequestType {
        self.request_type.load()
    }

    /// The embedding loop acknowledges a serviced request.
    pub fn clear_request(&self) {
        self.request_type.store(GcRequestType::None);
    }

    pub fn marking_worklist(&self) -> &MarkingWorklist {
        &self.worklist
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn config(&self) -> &MarkingConfig {
        &self.config
    }

    pub fn concurrent_marker(&self) -> Option<&Arc<ConcurrentMarker>> {
        self.concurrent.as_ref()
    }

    /// Unscanned remainder reported by the most recent large-object visit.
    pub fn unscanned_bytes_of_large_object(&self) -> usize {
        self.unscanned_bytes_of_large_object.load(Ordering::Acquire)
    }

    pub fn bytes_marked_ahead_of_schedule(&self) -> usize {
        self.bytes_marked_ahead_of_schedule.load(Ordering::Acquire)
    }

    pub fn finalization_rounds(&self) -> usize {
        self.finalization_rounds.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> Arc<MarkingStats> {
        self.stats.load_full()
    }

    /// Bitmap access mode for this cycle; atomic whenever workers share the
    /// mark bits.
    pub(crate) fn access_mode(&self) -> AccessMode {
        if self.config.concurrent_marking {
            AccessMode::Atomic
        } else {
            AccessMode::NonAtomic
        }
    }

    pub(super) fn set_state(&self, new_state: MarkingState) {
        let old_state = self.state.swap(new_state);
        if self.config.trace_incremental_marking && old_state != new_state {
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] State {:?} -> {:?}",
                old_state,
                new_state
            );
        }
    }

    pub(super) fn start_time_ms(&self) -> f64 {
        f64::from_bits(self.start_time_ms.load(Ordering::Acquire))
    }

    pub(super) fn set_start_time_ms(&self, ms: f64) {
        self.start_time_ms.store(ms.to_bits(), Ordering::Release);
    }
}

/// Allocation observer delivering work to the controller; one is registered
/// per space while a cycle is active.
pub(super) struct MarkingObserver {
    marking: Weak<IncrementalMarking>,
}

impl AllocationObserver for MarkingObserver {
    fn step(&self, _bytes_allocated: usize, _soonest_object: Address, _size: usize) {
        if let Some(marking) = self.marking.upgrade() {
            marking.advance_on_allocation();
        }
    }
}
