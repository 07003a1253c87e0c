//! Write barrier entry points and the record-write stub registry.
//!
//! Mutator code reaches the marker through patched code stubs; each stub's
//! mode selects the store-buffer-only fast path or the incremental barrier.
//! The barrier itself never allocates and is reentrant-safe; completion is
//! never triggered from inside a record-write context.

use crossbeam_utils::atomic::AtomicCell;

use crate::compactor::RelocInfo;
use crate::controller::IncrementalMarking;
use crate::types::{Address, ObjectReference};

/// Mode a record-write stub is patched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubMode {
    /// No marking cycle: only remember cross-generation stores.
    StoreBufferOnly,
    /// Marking without evacuation: color targets, no slot recording.
    Incremental,
    /// Marking with evacuation: color targets and record slots.
    IncrementalCompaction,
}

/// A compiled record-write stub. Freshly generated stubs start in
/// store-buffer-only mode and are patched to the cycle's mode on
/// registration.
pub struct RecordWriteStub {
    mode: AtomicCell<StubMode>,
}

impl RecordWriteStub {
    pub fn new() -> Self {
        Self {
            mode: AtomicCell::new(StubMode::StoreBufferOnly),
        }
    }

    pub fn mode(&self) -> StubMode {
        self.mode.load()
    }

    pub fn patch(&self, mode: StubMode) {
        self.mode.store(mode);
    }
}

impl Default for RecordWriteStub {
    fn default() -> Self {
        Self::new()
    }
}

impl IncrementalMarking {
    /// Core barrier decision for a store `host.field = value`.
    ///
    /// Recording is needed when the host is black (a black-to-white edge
    /// would break the tri-color invariant) or whenever concurrent marking
    /// is on — the host's color cannot be trusted without synchronization,
    /// so every write is treated as potentially dangerous. Returns whether
    /// the slot must additionally be recorded for compaction.
    fn base_record_write(&self, host: ObjectReference, value: ObjectReference) -> bool {
        let mode = self.access_mode();
        let bitmap = self.heap().marking_bitmap();
        debug_assert!(!bitmap.is_impossible(value, mode));
        debug_assert!(!bitmap.is_impossible(host, mode));
        let need_recording = self.config().concurrent_marking || bitmap.is_black(host, mode);

        if need_recording && self.white_to_grey_and_push(value) {
            self.restart_if_not_marking();
        }
        self.is_compacting() && need_recording
    }

    /// Barrier for an ordinary pointer store. `slot` is the written field's
    /// address when the caller knows it; without one the slot cannot be
    /// recorded for evacuation and the host will be rescanned instead.
    pub fn record_write(
        &self,
        host: ObjectReference,
        slot: Option<Address>,
        value: Option<ObjectReference>,
    ) {
        // Outside a cycle the stubs run in store-buffer-only mode and never
        // reach this path; modelled here as an early return.
        if !self.is_marking() {
            return;
        }
        // Non-heap values (cleared fields, immediates) need no barrier.
        let Some(value) = value else {
            return;
        };
        if self.base_record_write(host, value) {
            if let Some(slot) = slot {
                // The host is not going to be rescanned; record the slot.
                self.heap().compactor().record_slot(host, slot, value);
            }
        }
    }

    /// Barrier entry point for stub-assisted calls, which pass the slot
    /// index rather than the value.
    pub fn record_write_from_code(&self, host: ObjectReference, slot_index: usize) {
        let value = self.heap().read_field(host, slot_index);
        let slot = self.heap().slot_address(host, slot_index);
        self.record_write(host, Some(slot), value);
    }

    /// Barrier for a pointer embedded in a code object, identified by a
    /// relocation descriptor instead of a tagged slot.
    pub fn record_write_into_code(
        &self,
        host: ObjectReference,
        reloc: &RelocInfo,
        value: ObjectReference,
    ) {
        if !self.is_marking() {
            return;
        }
        if self.base_record_write(host, value) {
            // The host is not going to be rescanned; record the relocation.
            self.heap()
                .compactor()
                .record_reloc_slot(host, reloc, value);
        }
    }

    /// A code target was patched: rewrite of an instruction reference,
    /// same rules as a pointer store.
    pub fn record_code_target_patch(
        &self,
        host: ObjectReference,
        pc: Address,
        value: ObjectReference,
    ) {
        if self.is_marking() {
            let reloc = RelocInfo { pc };
            self.record_write_into_code(host, &reloc, value);
        }
    }

    /// Bring a freshly generated stub up to the current cycle's mode.
    pub fn activate_generated_stub(&self, stub: &RecordWriteStub) {
        debug_assert_eq!(stub.mode(), StubMode::StoreBufferOnly);
        if !self.is_marking() {
            // Stubs are generated in store-buffer-only mode; nothing to do
            // while incremental marking is off.
        } else if self.is_compacting() {
            stub.patch(StubMode::IncrementalCompaction);
        } else {
            stub.patch(StubMode::Incremental);
        }
    }

    /// Patch every registered record-write stub to `mode`.
    pub(crate) fn patch_stubs(&self, mode: StubMode) {
        for stub in self.heap().code_stubs() {
            stub.patch(mode);
        }
    }
}
