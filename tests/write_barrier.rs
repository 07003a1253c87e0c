//! Write-barrier contract: recording decisions, slot registration for the
//! compactor, code-target patches, and stub modes.

use greymark::test_support::{test_config, TestFixture};
use greymark::{
    AccessMode, GcReason, InstanceKind, MarkingConfig, RecordWriteStub, RelocInfo, SpaceId,
    StubMode,
};
use std::sync::Arc;

#[test]
fn stores_into_white_hosts_need_no_recording_single_threaded() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    let host = fixture.new_plain(SpaceId::Old, 1);
    let value = fixture.new_plain(SpaceId::Old, 0);
    fixture.marking.start(GcReason::Testing);

    assert!(bitmap.is_white(host, AccessMode::NonAtomic));
    fixture.write_with_barrier(host, 0, value);

    // A white host cannot create a black-to-white edge; nothing recorded.
    assert!(bitmap.is_white(value, AccessMode::NonAtomic));
    assert!(!heap.compactor().has_recorded_slot(heap.slot_address(host, 0)));
}

#[test]
fn concurrent_mode_treats_every_store_as_dangerous() {
    let config = MarkingConfig {
        concurrent_marking: true,
        marker_threads: 1,
        ..test_config()
    };
    let fixture = TestFixture::with_config(config);
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    let host = fixture.new_plain(SpaceId::Old, 1);
    let value = fixture.new_plain(SpaceId::Old, 0);
    fixture.marking.start(GcReason::Testing);

    // The host is white, but without synchronization its color cannot be
    // trusted; the value is shaded anyway.
    assert!(bitmap.is_white(host, AccessMode::Atomic));
    fixture.write_with_barrier(host, 0, value);
    assert!(!bitmap.is_white(value, AccessMode::Atomic));
    assert!(heap.compactor().has_recorded_slot(heap.slot_address(host, 0)));

    fixture.marking.stop();
}

#[test]
fn slots_recorded_only_in_compacting_cycles() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    heap.compactor().set_compaction_enabled(false);

    let host = fixture.new_plain(SpaceId::Old, 1);
    let value = fixture.new_plain(SpaceId::Old, 0);
    heap.add_strong_root(host);
    fixture.marking.start(GcReason::Testing);
    assert!(!fixture.marking.is_compacting());
    fixture.drive_to_completion();

    fixture.write_with_barrier(host, 0, value);
    assert!(!heap.compactor().has_recorded_slot(heap.slot_address(host, 0)));
    // The value is still shaded; only the slot registration is skipped.
    assert!(!heap.marking_bitmap().is_white(value, AccessMode::NonAtomic));
}

#[test]
fn barrier_is_inert_outside_a_cycle() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    let host = fixture.new_plain(SpaceId::Old, 1);
    let value = fixture.new_plain(SpaceId::Old, 0);
    fixture.write_with_barrier(host, 0, value);

    assert!(bitmap.is_white(value, AccessMode::NonAtomic));
    assert_eq!(heap.read_field(host, 0), Some(value));
}

#[test]
fn code_target_patch_records_reloc_slots() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;

    let code_map = heap.new_map(InstanceKind::Code).unwrap();
    let code = heap.allocate_plain(SpaceId::Code, code_map, 1).unwrap();
    let target = fixture.new_plain(SpaceId::Old, 0);
    heap.add_strong_root(code);

    fixture.marking.start(GcReason::Testing);
    fixture.drive_to_completion();

    // Patch an instruction reference inside the (black) code object.
    let pc = code.to_address() + 8;
    fixture.marking.record_code_target_patch(code, pc, target);

    assert!(!heap.marking_bitmap().is_white(target, AccessMode::NonAtomic));
    assert!(heap.compactor().has_recorded_reloc_slot(pc));
}

#[test]
fn reloc_barrier_shades_without_explicit_slot() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;

    let code_map = heap.new_map(InstanceKind::Code).unwrap();
    let code = heap.allocate_plain(SpaceId::Code, code_map, 1).unwrap();
    let target = fixture.new_plain(SpaceId::Old, 0);
    heap.add_strong_root(code);
    fixture.marking.start(GcReason::Testing);
    fixture.drive_to_completion();

    let reloc = RelocInfo {
        pc: code.to_address() + 16,
    };
    fixture.marking.record_write_into_code(code, &reloc, target);
    assert!(!heap.marking_bitmap().is_white(target, AccessMode::NonAtomic));
}

#[test]
fn stubs_patch_with_the_cycle_and_back() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;

    let stub = Arc::new(RecordWriteStub::new());
    heap.register_code_stub(1, Arc::clone(&stub));
    assert_eq!(stub.mode(), StubMode::StoreBufferOnly);

    fixture.marking.start(GcReason::Testing);
    assert!(fixture.marking.is_compacting());
    assert_eq!(stub.mode(), StubMode::IncrementalCompaction);

    fixture.marking.stop();
    assert_eq!(stub.mode(), StubMode::StoreBufferOnly);
}

#[test]
fn non_compacting_cycles_use_the_incremental_stub_mode() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    heap.compactor().set_compaction_enabled(false);

    let stub = Arc::new(RecordWriteStub::new());
    heap.register_code_stub(1, Arc::clone(&stub));

    fixture.marking.start(GcReason::Testing);
    assert_eq!(stub.mode(), StubMode::Incremental);
    fixture.marking.stop();
}

#[test]
fn freshly_generated_stubs_adopt_the_current_mode() {
    let fixture = TestFixture::new();

    // Stopped: new stubs stay in store-buffer-only mode.
    let early = RecordWriteStub::new();
    fixture.marking.activate_generated_stub(&early);
    assert_eq!(early.mode(), StubMode::StoreBufferOnly);

    fixture.marking.start(GcReason::Testing);
    let late = RecordWriteStub::new();
    fixture.marking.activate_generated_stub(&late);
    assert_eq!(late.mode(), StubMode::IncrementalCompaction);
}

#[test]
fn stub_assisted_barrier_reads_the_slot_itself() {
    let fixture = TestFixture::new();
    let heap = &fixture.heap;
    let bitmap = heap.marking_bitmap();

    let host = fixture.new_plain(SpaceId::Old, 2);
    let value = fixture.new_plain(SpaceId::Old, 0);
    heap.add_strong_root(host);
    fixture.marking.start(GcReason::Testing);
    fixture.drive_to_completion();

    heap.write_field(host, 1, Some(value));
    fixture.marking.record_write_from_code(host, 1);

    assert!(!bitmap.is_white(value, AccessMode::NonAtomic));
    assert!(heap.compactor().has_recorded_slot(heap.slot_address(host, 1)));
}
