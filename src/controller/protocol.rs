//! Cycle protocol: start, root marking, finalization rounds, hurry, stop,
//! and the scavenge/left-trim integration.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::barrier::StubMode;
use crate::heap::{AllocationObserver, Page, PageFlags, NORMALIZED_MAP_CACHE_INDEX};
use crate::marking::visitor::white_to_grey_and_push;
use crate::marking::{MarkingVisitor, ScanOutcome};
use crate::types::{ObjectReference, MB, WORD_SIZE};

use super::core::IncrementalMarking;
use super::types::*;

impl IncrementalMarking {
    /// Whether a cycle may begin: feature on, heap quiescent, snapshot
    /// machinery out of the way.
    pub fn can_be_activated(&self) -> bool {
        self.config.incremental_marking
            && self.heap.gc_state() == crate::heap::GcState::NotInGc
            && self.heap.deserialization_complete()
            && !self.heap.serializer_enabled()
    }

    /// Begin a cycle. Enters `Sweeping` while the previous cycle's sweeper
    /// is still running, `Marking` otherwise.
    pub fn start(&self, reason: GcReason) {
        if self.config.trace_incremental_marking {
            let old_generation_mb = self.heap.promoted_space_size() / MB;
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] Start ({:?}): old generation {}MB",
                reason,
                old_generation_mb
            );
        }
        debug_assert!(self.config.incremental_marking);
        debug_assert!(self.is_stopped());
        debug_assert!(self.heap.gc_state() == crate::heap::GcState::NotInGc);
        debug_assert!(!self.heap.serializer_enabled());

        self.stats.rcu(|stats| {
            let mut stats = (**stats).clone();
            stats.cycles_started += 1;
            stats.last_start_reason = Some(reason);
            stats
        });

        self.set_start_time_ms(self.heap.monotonic_ms());
        self.initial_old_generation_size
            .store(self.heap.promoted_space_size(), Ordering::Release);
        self.old_generation_allocation_counter.store(
            self.heap.old_generation_allocation_counter(),
            Ordering::Release,
        );
        self.bytes_allocated.store(0, Ordering::Release);
        self.bytes_marked_ahead_of_schedule
            .store(0, Ordering::Release);
        self.should_hurry.store(false, Ordering::Release);
        self.was_activated.store(true, Ordering::Release);

        if !self.heap.compactor().sweeping_in_progress() {
            self.start_marking();
        } else {
            if self.config.trace_incremental_marking {
                tracing::debug!(target: "greymark", "[IncrementalMarking] Start sweeping");
            }
            self.set_state(MarkingState::Sweeping);
        }

        let new_observer: Arc<dyn AllocationObserver> =
            Arc::clone(&self.new_generation_observer);
        let old_observer: Arc<dyn AllocationObserver> =
            Arc::clone(&self.old_generation_observer);
        self.heap.new_space().add_allocation_observer(new_observer);
        self.heap
            .old_space()
            .add_allocation_observer(Arc::clone(&old_observer));
        self.heap
            .map_space()
            .add_allocation_observer(Arc::clone(&old_observer));
        self.heap
            .code_space()
            .add_allocation_observer(Arc::clone(&old_observer));
        self.heap.large_space().add_allocation_observer(old_observer);
    }

    /// Transition into `Marking`: pick the compaction mode, patch the
    /// barrier stubs, flag pages, and grey the strong roots.
    pub(super) fn start_marking(&self) {
        if self.heap.serializer_enabled() {
            // Black allocation would be observed by the serializer; retry
            // at a later step.
            if self.config.trace_incremental_marking {
                tracing::debug!(
                    target: "greymark",
                    "[IncrementalMarking] Start delayed - serializer"
                );
            }
            return;
        }
        if self.config.trace_incremental_marking {
            tracing::debug!(target: "greymark", "[IncrementalMarking] Start marking");
        }

        self.is_compacting
            .store(self.heap.compactor().start_compaction(), Ordering::Release);
        self.set_state(MarkingState::Marking);

        self.embedder.trace_prologue();

        let mode = if self.is_compacting() {
            StubMode::IncrementalCompaction
        } else {
            StubMode::Incremental
        };
        self.patch_stubs(mode);

        self.worklist.start_using();
        self.activate_incremental_write_barrier();

        self.heap.clear_compilation_cache();

        if self.config.concurrent_marking && !self.black_allocation() {
            self.start_black_allocation();
        }

        // Mark strong roots grey.
        self.mark_roots();

        if let Some(concurrent) = &self.concurrent {
            concurrent.resume();
            concurrent.schedule_tasks();
        }

        if self.config.trace_incremental_marking {
            tracing::debug!(target: "greymark", "[IncrementalMarking] Running");
        }
    }

    /// Tear the cycle down: stubs back to store-buffer-only, page flags
    /// cleared, observers detached, pending GC request rescinded.
    pub fn stop(&self) {
        if self.is_stopped() {
            return;
        }
        if self.config.trace_incremental_marking {
            let old_generation_mb = self.heap.promoted_space_size() / MB;
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] Stopping: old generation {}MB",
                old_generation_mb
            );
        }

        let new_observer: Arc<dyn AllocationObserver> =
            Arc::clone(&self.new_generation_observer);
        let old_observer: Arc<dyn AllocationObserver> =
            Arc::clone(&self.old_generation_observer);
        self.heap.new_space().remove_allocation_observer(&new_observer);
        self.heap.old_space().remove_allocation_observer(&old_observer);
        self.heap.map_space().remove_allocation_observer(&old_observer);
        self.heap.code_space().remove_allocation_observer(&old_observer);
        self.heap.large_space().remove_allocation_observer(&old_observer);

        self.set_should_hurry(false);
        if self.is_marking() {
            self.patch_stubs(StubMode::StoreBufferOnly);
            self.deactivate_incremental_write_barrier();
        }
        if let Some(concurrent) = &self.concurrent {
            concurrent.cancel();
        }
        self.heap.stack_guard().clear_gc();
        self.set_state(MarkingState::Stopped);
        self.is_compacting.store(false, Ordering::Release);
        self.finish_black_allocation();
    }

    /// Drain everything, then stop. The synchronous completion path.
    pub fn finalize(&self) {
        self.hurry();
        self.stop();
    }

    /// Reset per-cycle flags once the full pause has run.
    pub fn epilogue(&self) {
        self.was_activated.store(false, Ordering::Release);
        self.finalize_marking_completed
            .store(false, Ordering::Release);
        self.finalization_rounds.store(0, Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Page flags

    fn set_old_space_page_flags(page: &Page, is_marking: bool) {
        if is_marking {
            page.set_flag(PageFlags::POINTERS_TO_HERE_INTERESTING);
            page.set_flag(PageFlags::POINTERS_FROM_HERE_INTERESTING);
        } else {
            page.clear_flag(PageFlags::POINTERS_TO_HERE_INTERESTING);
            page.set_flag(PageFlags::POINTERS_FROM_HERE_INTERESTING);
        }
    }

    fn set_new_space_page_flags(page: &Page, is_marking: bool) {
        page.set_flag(PageFlags::POINTERS_TO_HERE_INTERESTING);
        if is_marking {
            page.set_flag(PageFlags::POINTERS_FROM_HERE_INTERESTING);
        } else {
            page.clear_flag(PageFlags::POINTERS_FROM_HERE_INTERESTING);
        }
    }

    fn activate_incremental_write_barrier(&self) {
        for page in self
            .heap
            .old_space()
            .pages()
            .iter()
            .chain(self.heap.map_space().pages())
            .chain(self.heap.code_space().pages())
        {
            Self::set_old_space_page_flags(page, true);
        }
        for page in self.heap.new_space().pages() {
            Self::set_new_space_page_flags(page, true);
        }
        for page in self.heap.large_space().pages() {
            Self::set_old_space_page_flags(&page, true);
        }
    }

    fn deactivate_incremental_write_barrier(&self) {
        for page in self
            .heap
            .old_space()
            .pages()
            .iter()
            .chain(self.heap.map_space().pages())
            .chain(self.heap.code_space().pages())
        {
            Self::set_old_space_page_flags(page, false);
        }
        for page in self.heap.new_space().pages() {
            Self::set_new_space_page_flags(page, false);
        }
        for page in self.heap.large_space().pages() {
            Self::set_old_space_page_flags(&page, false);
        }
    }

    // ---------------------------------------------------------------
    // Black allocation

    pub(super) fn start_black_allocation(&self) {
        debug_assert!(self.config.black_allocation);
        debug_assert!(self.is_marking());
        self.heap.black_allocator().activate();
        if self.config.trace_incremental_marking {
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] Black allocation started"
            );
        }
    }

    /// Temporarily disable black allocation around operations that would
    /// otherwise observe inconsistent colors (e.g. a scavenge).
    pub fn pause_black_allocation(&self) {
        debug_assert!(self.is_marking());
        self.heap.black_allocator().deactivate();
        if self.config.trace_incremental_marking {
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] Black allocation paused"
            );
        }
    }

    pub(super) fn finish_black_allocation(&self) {
        if self.black_allocation() {
            self.heap.black_allocator().deactivate();
            if self.config.trace_incremental_marking {
                tracing::debug!(
                    target: "greymark",
                    "[IncrementalMarking] Black allocation finished"
                );
            }
        }
    }

    // ---------------------------------------------------------------
    // Marking primitives

    /// Color a white object grey and queue it. Returns true iff the color
    /// changed.
    pub fn white_to_grey_and_push(&self, object: ObjectReference) -> bool {
        white_to_grey_and_push(&self.bitmap, &self.worklist, object, self.access_mode())
    }

    /// Color an object black and queue it for (re)scanning through the
    /// bailout path, falling back to black-to-grey when the deque is full.
    pub fn mark_black_and_push(&self, object: ObjectReference) {
        let mode = self.access_mode();
        self.bitmap.white_to_grey(object, mode);
        if self.bitmap.grey_to_black(object, mode) {
            if self.config.concurrent_marking {
                self.worklist.push_bailout(object);
            } else if !self.worklist.push(object) {
                self.bitmap.black_to_grey(object, mode);
            }
        }
    }

    /// Re-scan the strong root set; roots may have changed while marking.
    pub(super) fn mark_roots(&self) {
        debug_assert!(self.is_marking());
        self.heap.iterate_strong_roots(|root| {
            self.white_to_grey_and_push(root);
        });
    }

    /// Scan one worklist entry and blacken it once fully scanned; a
    /// partially scanned progress-bar array stays grey and re-queued.
    /// Returns the bytes to credit against the step budget (size minus any
    /// unscanned large-array tail).
    pub(super) fn visit_object(&self, map: ObjectReference, object: ObjectReference) -> usize {
        let mode = self.access_mode();
        debug_assert!(!self.bitmap.is_white(object, mode));

        self.white_to_grey_and_push(map);

        let visitor = MarkingVisitor::new(
            &self.heap,
            &self.bitmap,
            &self.worklist,
            mode,
            self.config.concurrent_marking,
        );
        let ScanOutcome { size, unscanned } = visitor.visit(map, object);
        self.unscanned_bytes_of_large_object
            .store(unscanned, Ordering::Release);
        if unscanned == 0 {
            // Fails for objects that arrived already black (black
            // allocation, duplicates); they are black either way.
            self.bitmap.grey_to_black(object, mode);
            debug_assert!(self.bitmap.is_black(object, mode));
        }
        size - unscanned
    }

    /// A black-allocated object appeared in the worklist; its children may
    /// be unscanned, so visit it again.
    pub fn process_black_allocated_object(&self, object: ObjectReference) {
        if self.is_marking() && self.bitmap.is_black(object, self.access_mode()) {
            self.revisit_object(object);
        }
    }

    /// Re-scan an object from scratch; large objects restart their
    /// progress bar.
    pub fn revisit_object(&self, object: ObjectReference) {
        debug_assert!(self.is_marking());
        let page = self.heap.page_of(object.to_address());
        if page.space() == crate::heap::SpaceId::Large {
            page.reset_progress_bar();
        }
        let map = self.heap.map_of(object);
        self.visit_object(map, object);
    }

    /// Drain up to `bytes_to_process` from the worklist; with
    /// `ForceCompletion`, drain until empty regardless of budget. Fillers of
    /// any color are skipped. All found wrappers are handed to the embedder
    /// afterwards so it cannot invalidate them mid-cycle.
    pub fn process_marking_worklist(
        &self,
        bytes_to_process: usize,
        completion: ForceCompletionAction,
    ) -> usize {
        let mode = self.access_mode();
        let mut bytes_processed = 0;
        while bytes_processed < bytes_to_process
            || completion == ForceCompletionAction::ForceCompletion
        {
            let Some(object) = self.worklist.pop() else {
                break;
            };
            // Left trimming leaves filler objects of any color on the
            // worklist; ignore them.
            if self.heap.is_filler(object) {
                debug_assert!(!self.bitmap.is_impossible(object, mode));
                continue;
            }
            let map = self.heap.map_of(object);
            self.unscanned_bytes_of_large_object.store(0, Ordering::Release);
            bytes_processed += self.visit_object(map, object);
        }
        self.embedder.register_wrappers_with_remote_tracer();
        bytes_processed
    }

    // ---------------------------------------------------------------
    // Finalization

    /// One incremental finalization round: re-mark roots, age retained maps
    /// on the first round, measure progress, and flip
    /// `finalize_marking_completed` once rounds or progress bottom out.
    pub fn finalize_incrementally(&self) {
        debug_assert!(!self.finalize_marking_completed());
        debug_assert!(self.is_marking());

        let start = self.heap.monotonic_ms();

        // Discover all unmarked objects now to shrink the final pause:
        // root set changes are re-marked, and maps embedded in optimized
        // code are aged and retained.
        self.mark_roots();

        if self.finalization_rounds.load(Ordering::Acquire) == 0 {
            // Map retaining is about performance, not correctness; once at
            // the start of finalization is enough.
            self.retain_maps();
        }

        let marking_progress =
            self.worklist.len() + self.embedder.number_of_cached_wrappers_to_trace();

        let rounds = self.finalization_rounds.fetch_add(1, Ordering::AcqRel) + 1;
        self.stats.rcu(|stats| {
            let mut stats = (**stats).clone();
            stats.finalization_rounds += 1;
            stats
        });

        if self.config.trace_incremental_marking {
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] Finalize incrementally round {}, spent {:.1} ms, marking progress {}",
                rounds,
                self.heap.monotonic_ms() - start,
                marking_progress
            );
        }

        if rounds >= self.config.max_finalization_rounds
            || marking_progress < self.config.min_progress_during_finalization
        {
            self.finalize_marking_completed
                .store(true, Ordering::Release);
        }

        if self.config.black_allocation
            && !self.heap.should_reduce_memory()
            && !self.black_allocation()
        {
            self.start_black_allocation();
        }
    }

    /// Age the retained-maps list and keep recently used maps alive.
    /// Entries in the disposed prefix are never aged or retained.
    pub(super) fn retain_maps(&self) {
        let retaining_disabled = self.heap.should_reduce_memory()
            || self.config.retain_maps_for_n_gc == 0;
        let mode = self.access_mode();
        let mut retained = self.heap.retained_maps().lock();
        let disposed = retained.number_of_disposed_maps.min(retained.entries.len());
        for (index, entry) in retained.entries.iter_mut().enumerate() {
            let Some(map) = entry.cell.value() else {
                continue;
            };
            let age = entry.age;
            let new_age;
            if index >= disposed && !retaining_disabled && self.bitmap.is_white(map, mode) {
                if self.should_retain_map(map, age) {
                    white_to_grey_and_push(&self.bitmap, &self.worklist, map, mode);
                }
                let prototype = self.heap.map_prototype(map);
                if age > 0
                    && prototype.is_some_and(|prototype| self.bitmap.is_white(prototype, mode))
                {
                    // The prototype is not marked; age the map.
                    new_age = age - 1;
                } else {
                    // The map only keeps its transition tree alive; do not
                    // age it.
                    new_age = age;
                }
            } else {
                new_age = self.config.retain_maps_for_n_gc;
            }
            if new_age != age {
                entry.age = new_age;
            }
        }
    }

    fn should_retain_map(&self, map: ObjectReference, age: usize) -> bool {
        if age == 0 {
            // The map has aged; let it go.
            return false;
        }
        let Some(constructor) = self.heap.map_constructor(map) else {
            return false;
        };
        // A dead constructor means no new objects with this map.
        !self.bitmap.is_white(constructor, self.access_mode())
    }

    /// Drain the worklist with forced completion and blacken any grey
    /// normalized-map caches in one sweep.
    pub fn hurry(&self) {
        // A scavenge may have re-populated the worklist (black allocation)
        // even in the Complete state.
        if !self.worklist.is_empty() {
            let start = self.heap.monotonic_ms();
            if self.config.trace_incremental_marking {
                tracing::debug!(target: "greymark", "[IncrementalMarking] Hurry");
            }
            self.process_marking_worklist(0, ForceCompletionAction::ForceCompletion);
            self.set_state(MarkingState::Complete);
            if self.config.trace_incremental_marking {
                tracing::debug!(
                    target: "greymark",
                    "[IncrementalMarking] Complete (hurry), spent {:.1} ms",
                    self.heap.monotonic_ms() - start
                );
            }
        }

        let mode = self.access_mode();
        for context in self.heap.native_contexts() {
            // The context may not be fully initialized yet.
            if let Some(cache) = self.heap.read_field(context, NORMALIZED_MAP_CACHE_INDEX) {
                self.bitmap.grey_to_black(cache, mode);
            }
        }
    }

    /// Request a finalization round from the embedding loop.
    pub fn finalize_marking(&self, action: CompletionAction) {
        debug_assert!(!self.finalize_marking_completed());
        if self.config.trace_incremental_marking {
            tracing::debug!(
                target: "greymark",
                "[IncrementalMarking] Requesting finalization of incremental marking"
            );
        }
        self.request_type.store(GcRequestType::Finalization);
        if action == CompletionAction::GcViaStackGuard {
            self.heap.stack_guard().request_gc();
        }
    }

    /// Marking is done; request the full pause. Completion cannot run here
    /// (we may be in a record-write context), so it is delivered
    /// asynchronously; `should_hurry` notes that little work can remain.
    pub fn marking_complete(&self, action: CompletionAction) {
        self.set_state(MarkingState::Complete);
        self.set_should_hurry(true);
        if self.config.trace_incremental_marking {
            tracing::debug!(target: "greymark", "[IncrementalMarking] Complete (normal)");
        }
        self.request_type.store(GcRequestType::CompleteMarking);
        if action == CompletionAction::GcViaStackGuard {
            self.heap.stack_guard().request_gc();
        }
    }

    /// A paused-but-live cycle observed new grey work (from the barrier or
    /// left trimming); resume stepping.
    pub(crate) fn restart_if_not_marking(&self) {
        if self.is_complete() {
            self.set_state(MarkingState::Marking);
            if self.config.trace_incremental_marking {
                tracing::debug!(target: "greymark", "[IncrementalMarking] Restarting");
            }
        }
    }

    // ---------------------------------------------------------------
    // Scavenge integration

    /// Rewrite worklist entries after young-generation evacuation:
    /// forwarded entries follow their forwarding address, dead entries and
    /// in-place fillers are dropped, and entries on swept-in-place pages
    /// survive only if externally grey.
    pub fn update_marking_worklist_after_scavenge(&self) {
        if !self.is_marking() {
            return;
        }

        let filler_map = self.heap.one_pointer_filler_map();
        let mode = self.access_mode();
        self.worklist.update(|object| {
            if self.heap.in_from_space(object) {
                match self.heap.forwarding_of(object) {
                    Some(destination) => Some(destination),
                    // Left-trimmed or stale root entries that died before
                    // the scavenge have no forwarding address.
                    None => None,
                }
            } else if self.heap.in_to_space(object) {
                debug_assert!(self
                    .heap
                    .page_of(object.to_address())
                    .is_flag_set(PageFlags::SWEEP_TO_ITERATE));
                if self.heap.is_externally_grey(object) {
                    Some(object)
                } else {
                    None
                }
            } else {
                let page = self.heap.page_of(object.to_address());
                if page.is_flag_set(PageFlags::SWEEP_TO_ITERATE) {
                    if self.heap.is_externally_grey(object) {
                        Some(object)
                    } else {
                        None
                    }
                } else {
                    debug_assert!(!self.bitmap.is_impossible(object, mode));
                    // One-word fillers appear when arrays are shifted in
                    // place; drop them.
                    if self.heap.map_of(object) == filler_map {
                        None
                    } else {
                        Some(object)
                    }
                }
            }
        });
    }

    /// Transfer color across an in-place array head removal. `from` is the
    /// old start, `to` the new start on the same page. When the two mark-bit
    /// pairs overlap (`from + one word == to`), a single bit is enough.
    pub fn notify_left_trimming(&self, from: ObjectReference, to: ObjectReference) {
        debug_assert!(self.is_marking());
        debug_assert!(Arc::ptr_eq(
            &self.heap.page_of(from.to_address()),
            &self.heap.page_of(to.to_address())
        ));
        debug_assert!(from != to);

        let mode = self.access_mode();

        if self.black_allocation() && self.bitmap.is_black(to, mode) {
            // The object is in a black area; nothing to transfer.
            return;
        }

        let mut marked_black_due_to_left_trimming = false;
        if self.config.concurrent_marking {
            // Blacken the old start before its map and length are
            // overwritten so a concurrent worker cannot observe the stale
            // length mid-scan.
            self.bitmap.white_to_grey(from, mode);
            if self.bitmap.grey_to_black(from, mode) {
                marked_black_due_to_left_trimming = true;
            }
            debug_assert!(self.bitmap.is_black(from, mode));
        }

        let bitmaps_overlap = from.to_address() + WORD_SIZE == to.to_address();

        if self.bitmap.is_black(from, mode) && !marked_black_due_to_left_trimming {
            // Black before the trim: transfer the color.
            if bitmaps_overlap {
                // `to` already reads grey through the shared bit; set the
                // second bit.
                self.bitmap.grey_to_black(to, mode);
            } else {
                let success = self.bitmap.white_to_black(to, mode);
                debug_assert!(success);
                let _ = success;
            }
        } else if self.bitmap.is_grey(from, mode) || marked_black_due_to_left_trimming {
            // Grey before the trim (or blackened only to fence concurrent
            // markers): the new start must be grey and queued.
            self.bitmap.white_to_grey(to, mode);
            debug_assert!(!self.bitmap.is_impossible(to, mode));
            if !self.worklist.push(to) {
                self.worklist.push_bailout(to);
            }
            self.restart_if_not_marking();
        }
    }
}
