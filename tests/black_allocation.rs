//! The black-allocation regime: birth colors, pausing, and revisiting
//! black-allocated objects.

use greymark::test_support::{test_config, TestFixture};
use greymark::{AccessMode, GcReason, MarkingConfig, SpaceId};

#[test]
fn concurrent_cycles_enable_black_allocation_at_start() {
    let config = MarkingConfig {
        concurrent_marking: true,
        marker_threads: 1,
        ..test_config()
    };
    let fixture = TestFixture::with_config(config);
    let bitmap = fixture.heap.marking_bitmap();

    assert!(!fixture.marking.black_allocation());
    fixture.marking.start(GcReason::Testing);
    assert!(fixture.marking.black_allocation());

    // Old-generation allocations are born black from here on.
    let newcomer = fixture.new_plain(SpaceId::Old, 0);
    assert!(bitmap.is_black(newcomer, AccessMode::Atomic));

    // Young allocations keep starting white; the scavenger owns them.
    let young = fixture.new_plain(SpaceId::New, 0);
    assert!(bitmap.is_white(young, AccessMode::Atomic));

    fixture.marking.stop();
    assert!(!fixture.marking.black_allocation());
}

#[test]
fn non_concurrent_cycles_enable_black_allocation_at_first_finalization() {
    let fixture = TestFixture::new();
    let bitmap = fixture.heap.marking_bitmap();

    fixture.marking.start(GcReason::Testing);
    assert!(!fixture.marking.black_allocation());

    let before = fixture.new_plain(SpaceId::Old, 0);
    assert!(bitmap.is_white(before, AccessMode::NonAtomic));

    fixture.marking.finalize_incrementally();
    assert!(fixture.marking.black_allocation());

    let after = fixture.new_plain(SpaceId::Old, 0);
    assert!(bitmap.is_black(after, AccessMode::NonAtomic));
}

#[test]
fn reducing_memory_keeps_black_allocation_off() {
    let fixture = TestFixture::new();
    fixture.heap.set_should_reduce_memory(true);

    fixture.marking.start(GcReason::Testing);
    fixture.marking.finalize_incrementally();
    assert!(!fixture.marking.black_allocation());
}

#[test]
fn pausing_black_allocation_restores_white_births() {
    let config = MarkingConfig {
        concurrent_marking: true,
        marker_threads: 1,
        ..test_config()
    };
    let fixture = TestFixture::with_config(config);
    let bitmap = fixture.heap.marking_bitmap();

    fixture.marking.start(GcReason::Testing);
    assert!(fixture.marking.black_allocation());

    fixture.marking.pause_black_allocation();
    let while_paused = fixture.new_plain(SpaceId::Old, 0);
    assert!(bitmap.is_white(while_paused, AccessMode::Atomic));

    fixture.marking.stop();
}

#[test]
fn black_allocated_objects_get_revisited_for_unscanned_children() {
    let config = MarkingConfig {
        concurrent_marking: true,
        marker_threads: 1,
        ..test_config()
    };
    let fixture = TestFixture::with_config(config);
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    fixture.marking.start(GcReason::Testing);

    // Born black, so its child edge was never scanned.
    let parent = fixture.new_plain(SpaceId::Old, 1);
    assert!(bitmap.is_black(parent, AccessMode::Atomic));
    fixture.marking.pause_black_allocation();
    let child = fixture.new_plain(SpaceId::Old, 0);
    heap.write_field(parent, 0, Some(child));
    assert!(bitmap.is_white(child, AccessMode::Atomic));

    fixture.marking.process_black_allocated_object(parent);
    assert!(!bitmap.is_white(child, AccessMode::Atomic));

    fixture.marking.stop();
}
