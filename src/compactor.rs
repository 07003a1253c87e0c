//! Peer interface to the compacting mark-sweep collector.
//!
//! The marker records slot locations here so evacuation can fix them up
//! later, and consults the sweeping flags to defer its own start while the
//! previous cycle's sweeper is still running. The real evacuation and
//! sweeping machinery lives outside this crate; this peer keeps just enough
//! state to honor the interface.

use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::types::{Address, ObjectReference};

/// Descriptor for a pointer embedded in a code object, identified by its
/// instruction address rather than a tagged slot.
#[derive(Debug, Clone, Copy)]
pub struct RelocInfo {
    pub pc: Address,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecordedSlot {
    host: usize,
    value: usize,
}

pub struct CompactingCollector {
    /// Whether `start_compaction` may succeed; tests flip this to exercise
    /// the non-compacting barrier path.
    compaction_enabled: AtomicBool,
    compacting: AtomicBool,
    sweeping_in_progress: AtomicBool,
    sweeper_tasks_running: AtomicBool,
    recorded_slots: DashMap<usize, RecordedSlot>,
    recorded_reloc_slots: DashMap<usize, RecordedSlot>,
}

impl CompactingCollector {
    pub fn new() -> Self {
        Self {
            compaction_enabled: AtomicBool::new(true),
            compacting: AtomicBool::new(false),
            sweeping_in_progress: AtomicBool::new(false),
            sweeper_tasks_running: AtomicBool::new(false),
            recorded_slots: DashMap::new(),
            recorded_reloc_slots: DashMap::new(),
        }
    }

    /// Decide whether this cycle evacuates. Called once from the marking
    /// start path.
    pub fn start_compaction(&self) -> bool {
        let compacting = self.compaction_enabled.load(Ordering::Acquire);
        self.compacting.store(compacting, Ordering::Release);
        compacting
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    pub fn set_compaction_enabled(&self, enabled: bool) {
        self.compaction_enabled.store(enabled, Ordering::Release);
    }

    /// Register a slot for relocation fix-up during evacuation. No-op when
    /// this cycle does not compact.
    pub fn record_slot(&self, host: ObjectReference, slot: Address, value: ObjectReference) {
        if !self.is_compacting() {
            return;
        }
        self.recorded_slots.insert(
            slot.as_usize(),
            RecordedSlot {
                host: host.to_raw(),
                value: value.to_raw(),
            },
        );
    }

    /// Register a code-embedded pointer for fix-up.
    pub fn record_reloc_slot(&self, host: ObjectReference, reloc: &RelocInfo, value: ObjectReference) {
        if !self.is_compacting() {
            return;
        }
        self.recorded_reloc_slots.insert(
            reloc.pc.as_usize(),
            RecordedSlot {
                host: host.to_raw(),
                value: value.to_raw(),
            },
        );
    }

    pub fn has_recorded_slot(&self, slot: Address) -> bool {
        self.recorded_slots.contains_key(&slot.as_usize())
    }

    /// Host and value registered for a slot, if any.
    pub fn recorded_slot(&self, slot: Address) -> Option<(ObjectReference, ObjectReference)> {
        self.recorded_slots.get(&slot.as_usize()).and_then(|entry| {
            Some((
                ObjectReference::from_raw(entry.host)?,
                ObjectReference::from_raw(entry.value)?,
            ))
        })
    }

    pub fn has_recorded_reloc_slot(&self, pc: Address) -> bool {
        self.recorded_reloc_slots.contains_key(&pc.as_usize())
    }

    pub fn recorded_slot_count(&self) -> usize {
        self.recorded_slots.len()
    }

    pub fn sweeping_in_progress(&self) -> bool {
        self.sweeping_in_progress.load(Ordering::Acquire)
    }

    /// Test hook: pretend the previous cycle's sweeper is (still) running.
    pub fn set_sweeping_in_progress(&self, in_progress: bool) {
        self.sweeping_in_progress.store(in_progress, Ordering::Release);
        if !in_progress {
            self.sweeper_tasks_running.store(false, Ordering::Release);
        }
    }

    pub fn are_sweeper_tasks_running(&self) -> bool {
        self.sweeper_tasks_running.load(Ordering::Acquire)
    }

    pub fn set_sweeper_tasks_running(&self, running: bool) {
        self.sweeper_tasks_running.store(running, Ordering::Release);
    }

    /// Block until sweeping is done. The model sweeper finishes instantly.
    pub fn ensure_sweeping_completed(&self) {
        self.sweeping_in_progress.store(false, Ordering::Release);
        self.sweeper_tasks_running.store(false, Ordering::Release);
    }

    /// Reset per-cycle state.
    pub fn reset(&self) {
        self.compacting.store(false, Ordering::Release);
        self.recorded_slots.clear();
        self.recorded_reloc_slots.clear();
    }
}

impl Default for CompactingCollector {
    fn default() -> Self {
        Self::new()
    }
}
