//! Background marking workers.
//!
//! Workers share the mark bitmap and the worklist with the mutator-side
//! marker through atomic primitives and lock-free queue semantics. They
//! suspend between popped items and at queue-empty; the controller requests
//! termination through the cancellation flag, and in-flight workers finish
//! their current item. Bytes marked here are credited against the
//! mutator's schedule so allocation-driven steps can skip work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_utils::atomic::AtomicCell;

use crate::controller::MarkingState;
use crate::heap::Heap;
use crate::marking::visitor::white_to_grey_and_push;
use crate::marking::{AccessMode, MarkBitmap, MarkingVisitor, MarkingWorklist};

pub struct ConcurrentMarker {
    this: Weak<ConcurrentMarker>,
    heap: Arc<Heap>,
    bitmap: Arc<MarkBitmap>,
    worklist: MarkingWorklist,
    state: Arc<AtomicCell<MarkingState>>,
    bytes_marked_ahead_of_schedule: Arc<AtomicUsize>,
    pool: rayon::ThreadPool,
    task_pending: AtomicBool,
    cancelled: AtomicBool,
    objects_marked: AtomicUsize,
}

impl ConcurrentMarker {
    pub fn new(
        heap: &Arc<Heap>,
        bitmap: &Arc<MarkBitmap>,
        worklist: MarkingWorklist,
        state: &Arc<AtomicCell<MarkingState>>,
        bytes_marked_ahead_of_schedule: &Arc<AtomicUsize>,
        workers: usize,
    ) -> Arc<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .thread_name(|index| format!("greymark-marker-{}", index))
            .build()
            .expect("failed to build marker thread pool");
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            heap: Arc::clone(heap),
            bitmap: Arc::clone(bitmap),
            worklist,
            state: Arc::clone(state),
            bytes_marked_ahead_of_schedule: Arc::clone(bytes_marked_ahead_of_schedule),
            pool,
            task_pending: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            objects_marked: AtomicUsize::new(0),
        })
    }

    /// Dispatch a marking task unless one is already running.
    pub fn schedule_tasks(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self
            .task_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let marker = self.this.upgrade().expect("marker owned by controller");
            self.pool.spawn(move || marker.run_task());
        }
    }

    /// Called after every mutator step: keep workers running while there
    /// is queued work.
    pub fn reschedule_tasks_if_needed(&self) {
        if self.state.load() == MarkingState::Marking && !self.worklist.is_empty() {
            self.schedule_tasks();
        }
    }

    /// Request termination. Workers observe the flag at their next
    /// worklist check; the worklist itself is left intact.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Re-arm after a cancel, before the next cycle schedules tasks.
    pub fn resume(&self) {
        self.cancelled.store(false, Ordering::Release);
    }

    pub fn is_task_pending(&self) -> bool {
        self.task_pending.load(Ordering::Acquire)
    }

    pub fn objects_marked(&self) -> usize {
        self.objects_marked.load(Ordering::Acquire)
    }

    fn run_task(&self) {
        // Workers always take the atomic paths and hand partially scanned
        // large objects back through the bailout queue.
        let visitor = MarkingVisitor::new(
            &self.heap,
            &self.bitmap,
            &self.worklist,
            AccessMode::Atomic,
            true,
        );
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                break;
            }
            // `is_marking` is advisory; a stale read costs one extra item.
            if self.state.load() != MarkingState::Marking {
                break;
            }
            let Some(object) = self.worklist.pop_shared() else {
                break;
            };
            if self.heap.is_filler(object) {
                continue;
            }
            let map = self.heap.map_of(object);
            white_to_grey_and_push(&self.bitmap, &self.worklist, map, AccessMode::Atomic);
            let outcome = visitor.visit(map, object);
            if outcome.unscanned == 0 {
                self.bitmap.grey_to_black(object, AccessMode::Atomic);
            }
            self.bytes_marked_ahead_of_schedule
                .fetch_add(outcome.size - outcome.unscanned, Ordering::AcqRel);
            self.objects_marked.fetch_add(1, Ordering::AcqRel);
        }
        self.task_pending.store(false, Ordering::Release);
    }
}
