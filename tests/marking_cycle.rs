//! End-to-end marking cycles: start conditions, completion, finalization
//! rounds, and the state machine around them.

use greymark::test_support::{test_config, TestFixture};
use greymark::{
    AccessMode, CompletionAction, ForceCompletionAction, GcReason, GcRequestType, MarkingConfig,
    SpaceId, StepOrigin,
};

#[test]
fn simple_cycle_marks_reachable_graph_black() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    // A -> B -> A, root = {A}.
    let a = fixture.new_plain(SpaceId::Old, 1);
    let b = fixture.new_plain(SpaceId::Old, 1);
    heap.write_field(a, 0, Some(b));
    heap.write_field(b, 0, Some(a));
    heap.add_strong_root(a);

    assert!(fixture.marking.can_be_activated());
    fixture.marking.start(GcReason::Testing);
    assert!(fixture.marking.is_marking());

    fixture.drive_to_completion();

    assert!(bitmap.is_black(a, AccessMode::NonAtomic));
    assert!(bitmap.is_black(b, AccessMode::NonAtomic));
    assert!(fixture.marking.marking_worklist().is_empty());
    assert!(fixture.marking.should_hurry());
    assert_eq!(fixture.marking.request_type(), GcRequestType::CompleteMarking);
}

#[test]
fn unreachable_objects_stay_white() {
    let fixture = TestFixture::new();
    let bitmap = fixture.heap.marking_bitmap();

    let root = fixture.new_plain(SpaceId::Old, 0);
    let garbage = fixture.new_plain(SpaceId::Old, 0);
    fixture.heap.add_strong_root(root);

    fixture.marking.start(GcReason::Testing);
    fixture.drive_to_completion();

    assert!(bitmap.is_black(root, AccessMode::NonAtomic));
    assert!(bitmap.is_white(garbage, AccessMode::NonAtomic));
}

#[test]
fn barrier_catches_store_into_black_host() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    let a = fixture.new_plain(SpaceId::Old, 1);
    heap.add_strong_root(a);
    fixture.marking.start(GcReason::Testing);
    fixture.drive_to_completion();
    assert!(bitmap.is_black(a, AccessMode::NonAtomic));

    // The mutator attaches an otherwise unreachable object to a black host.
    let c = fixture.new_plain(SpaceId::Old, 0);
    assert!(bitmap.is_white(c, AccessMode::NonAtomic));
    fixture.write_with_barrier(a, 0, c);

    // The target is grey immediately after the store, and the paused cycle
    // resumed stepping.
    assert!(bitmap.is_grey(c, AccessMode::NonAtomic));
    assert!(!fixture.marking.is_complete());

    fixture.drive_to_completion();
    assert!(bitmap.is_black(c, AccessMode::NonAtomic));
}

#[test]
fn finalization_needs_a_low_progress_round() {
    let mut config = test_config();
    config.min_progress_during_finalization = 1;
    let fixture = TestFixture::with_config(config);
    let heap = &fixture.heap;

    let a = fixture.new_plain(SpaceId::Old, 0);
    heap.add_strong_root(a);
    fixture.marking.start(GcReason::Testing);

    // Drain, then request finalization.
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::ForceCompletion,
        StepOrigin::Mutator,
    );
    assert_eq!(fixture.marking.request_type(), GcRequestType::Finalization);
    fixture.marking.clear_request();

    // A new root shows up before the first round: progress = 1, not below
    // the minimum, so finalization keeps going.
    let d = fixture.new_plain(SpaceId::Old, 0);
    heap.add_strong_root(d);
    fixture.marking.finalize_incrementally();
    assert_eq!(fixture.marking.finalization_rounds(), 1);
    assert!(!fixture.marking.finalize_marking_completed());

    // Second round discovers nothing; 0 < 1 completes finalization.
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::ForceCompletion,
        StepOrigin::Mutator,
    );
    fixture.marking.clear_request();
    fixture.marking.finalize_incrementally();
    assert!(fixture.marking.finalize_marking_completed());

    // The next step reaches Complete.
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::ForceCompletion,
        StepOrigin::Mutator,
    );
    assert!(fixture.marking.is_complete());
    assert!(fixture.heap.stack_guard().gc_requested());
}

#[test]
fn stop_resets_state_and_clears_requests() {
    let fixture = TestFixture::new();
    let root = fixture.new_plain(SpaceId::Old, 0);
    fixture.heap.add_strong_root(root);

    fixture.marking.start(GcReason::AllocationLimit);
    fixture.drive_to_completion();
    assert!(fixture.heap.stack_guard().gc_requested());
    assert!(fixture.marking.was_activated());

    fixture.marking.stop();
    assert!(fixture.marking.is_stopped());
    assert!(!fixture.marking.is_compacting());
    assert!(!fixture.heap.stack_guard().gc_requested());
    assert!(!fixture.marking.black_allocation());
    // `was_activated` survives until the epilogue of the full pause.
    assert!(fixture.marking.was_activated());

    fixture.marking.epilogue();
    assert!(!fixture.marking.was_activated());
    assert!(!fixture.marking.finalize_marking_completed());
    assert_eq!(fixture.marking.finalization_rounds(), 0);
}

#[test]
fn start_defers_to_sweeping_until_sweeper_finishes() {
    let fixture = TestFixture::new();
    let root = fixture.new_plain(SpaceId::Old, 0);
    fixture.heap.add_strong_root(root);

    fixture.heap.compactor().set_sweeping_in_progress(true);
    fixture.heap.compactor().set_sweeper_tasks_running(true);
    fixture.marking.start(GcReason::Testing);
    assert!(fixture.marking.is_sweeping());

    // Sweeper tasks still running: the step must not force completion.
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::DoNotForceCompletion,
        StepOrigin::Mutator,
    );
    assert!(fixture.marking.is_sweeping());

    // Once the tasks retire, the next step finalizes sweeping and starts
    // marking in the same increment.
    fixture.heap.compactor().set_sweeper_tasks_running(false);
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::DoNotForceCompletion,
        StepOrigin::Mutator,
    );
    assert!(fixture.marking.is_marking());
}

#[test]
fn serializer_blocks_activation_and_delays_start_marking() {
    let fixture = TestFixture::new();
    fixture.heap.set_serializer_enabled(true);
    assert!(!fixture.marking.can_be_activated());

    // A start issued while sweeping retries `start_marking` from the step
    // path; with the serializer active it keeps deferring.
    fixture.heap.set_serializer_enabled(false);
    fixture.heap.compactor().set_sweeping_in_progress(true);
    fixture.marking.start(GcReason::Testing);
    assert!(fixture.marking.is_sweeping());

    fixture.heap.set_serializer_enabled(true);
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::DoNotForceCompletion,
        StepOrigin::Mutator,
    );
    assert!(fixture.marking.is_sweeping());

    fixture.heap.set_serializer_enabled(false);
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::DoNotForceCompletion,
        StepOrigin::Mutator,
    );
    assert!(fixture.marking.is_marking());
}

#[test]
fn hurry_blackens_grey_normalized_map_caches() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    let context_map = heap
        .new_map(greymark::InstanceKind::NativeContext)
        .unwrap();
    let context = heap.allocate_native_context(context_map).unwrap();
    let cache = fixture.new_plain(SpaceId::Old, 0);
    heap.write_field(context, greymark::heap::NORMALIZED_MAP_CACHE_INDEX, Some(cache));
    heap.add_strong_root(context);

    fixture.marking.start(GcReason::Testing);
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::GcViaStackGuard,
        ForceCompletionAction::ForceCompletion,
        StepOrigin::Mutator,
    );

    // The visitor greyed the cache without queueing it; it is finalized
    // black only by the hurry sweep.
    assert!(bitmap.is_grey(cache, AccessMode::NonAtomic));
    fixture.marking.hurry();
    assert!(bitmap.is_black(cache, AccessMode::NonAtomic));
}

#[test]
fn repeated_pushes_of_black_objects_are_filtered() {
    let fixture = TestFixture::new();
    let bitmap = fixture.heap.marking_bitmap();

    let a = fixture.new_plain(SpaceId::Old, 0);
    fixture.heap.add_strong_root(a);
    fixture.marking.start(GcReason::Testing);
    fixture.drive_to_completion();
    assert!(bitmap.is_black(a, AccessMode::NonAtomic));

    // Duplicate pushes of an already-black object change nothing; the
    // visit path filters them by color.
    fixture.marking.marking_worklist().push(a);
    fixture.marking.marking_worklist().push(a);
    fixture.marking.hurry();

    assert!(bitmap.is_black(a, AccessMode::NonAtomic));
    assert!(fixture.marking.marking_worklist().is_empty());
}

#[test]
fn mark_black_and_push_schedules_children_for_scanning() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    let wrapper = fixture.new_plain(SpaceId::Old, 1);
    let child = fixture.new_plain(SpaceId::Old, 0);
    heap.write_field(wrapper, 0, Some(child));

    fixture.marking.start(GcReason::External);
    fixture.marking.mark_black_and_push(wrapper);
    assert!(bitmap.is_black(wrapper, AccessMode::NonAtomic));

    // The queued black object is revisited so its children get scanned.
    fixture.drive_to_completion();
    assert!(bitmap.is_black(child, AccessMode::NonAtomic));
}

#[test]
fn idle_steps_only_request_completion_after_delay_limit() {
    let config = MarkingConfig {
        max_idle_marking_delay: 3,
        ..test_config()
    };
    let fixture = TestFixture::with_config(config);
    fixture.marking.start(GcReason::IdleTask);

    // Empty worklist, no forced completion: the first steps only bump the
    // delay counter.
    for _ in 0..4 {
        fixture.marking.step(
            usize::MAX / 2,
            CompletionAction::NoGcViaStackGuard,
            ForceCompletionAction::DoNotForceCompletion,
            StepOrigin::Mutator,
        );
        assert_eq!(fixture.marking.request_type(), GcRequestType::None);
    }

    // Past the limit, completion is requested without a stack-guard GC.
    fixture.marking.step(
        usize::MAX / 2,
        CompletionAction::NoGcViaStackGuard,
        ForceCompletionAction::DoNotForceCompletion,
        StepOrigin::Mutator,
    );
    assert_eq!(fixture.marking.request_type(), GcRequestType::Finalization);
    assert!(!fixture.heap.stack_guard().gc_requested());
}
