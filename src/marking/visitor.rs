//! Object scanning: enumerate outgoing references, color targets grey, and
//! feed the worklist.

use crate::heap::{Heap, InstanceKind, ObjectRecord, PageFlags, NORMALIZED_MAP_CACHE_INDEX};
use crate::marking::{AccessMode, MarkBitmap, MarkingWorklist};
use crate::types::{ObjectReference, OBJECT_HEADER_SIZE, WORD_SIZE};

/// How much of a progress-bar array a single visit scans.
pub const PROGRESS_BAR_SCANNING_CHUNK: usize = 32 * 1024;

/// Result of visiting one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Byte size computed from the map.
    pub size: usize,
    /// Bytes left unscanned by a partial large-array visit; the step
    /// scheduler subtracts these so unread memory earns no credit.
    pub unscanned: usize,
}

impl ScanOutcome {
    fn complete(size: usize) -> Self {
        Self { size, unscanned: 0 }
    }
}

/// Color a white object grey and queue it. The bounded deque can reject the
/// push; the object then goes to the unbounded bailout stack so no grey
/// object is ever lost. Returns true iff this call performed the transition.
pub fn white_to_grey_and_push(
    bitmap: &MarkBitmap,
    worklist: &MarkingWorklist,
    object: ObjectReference,
    mode: AccessMode,
) -> bool {
    if bitmap.white_to_grey(object, mode) {
        if !worklist.push(object) {
            worklist.push_bailout(object);
        }
        true
    } else {
        false
    }
}

/// Visitor over a single object's pointer fields, polymorphic over the
/// object's map descriptor.
pub struct MarkingVisitor<'a> {
    heap: &'a Heap,
    bitmap: &'a MarkBitmap,
    worklist: &'a MarkingWorklist,
    mode: AccessMode,
    /// Concurrent workers re-push partially scanned arrays through the
    /// bailout queue so the main marker finishes them.
    bailout_on_partial_scan: bool,
}

impl<'a> MarkingVisitor<'a> {
    pub fn new(
        heap: &'a Heap,
        bitmap: &'a MarkBitmap,
        worklist: &'a MarkingWorklist,
        mode: AccessMode,
        bailout_on_partial_scan: bool,
    ) -> Self {
        Self {
            heap,
            bitmap,
            worklist,
            mode,
            bailout_on_partial_scan,
        }
    }

    /// Scan `object`'s pointer fields given its map.
    pub fn visit(&self, map: ObjectReference, object: ObjectReference) -> ScanOutcome {
        let record = self.heap.record_of(object);
        debug_assert_eq!(record.map(), Some(map));
        match record.kind() {
            InstanceKind::OnePointerFiller | InstanceKind::FreeSpace => {
                ScanOutcome::complete(record.size())
            }
            InstanceKind::FixedArray => self.visit_fixed_array(object, &record),
            InstanceKind::NativeContext => self.visit_native_context(object, &record),
            InstanceKind::Plain | InstanceKind::Code | InstanceKind::Map => {
                self.scan_slots(object, &record, 0, record.slot_count());
                ScanOutcome::complete(record.size())
            }
        }
    }

    /// Large arrays on progress-bar pages are scanned one chunk per visit
    /// and re-queued until done. A full worklist forces scanning through to
    /// the end in place instead of yielding.
    fn visit_fixed_array(&self, object: ObjectReference, record: &ObjectRecord) -> ScanOutcome {
        let page = self.heap.page_of(object.to_address());
        let object_size = record.size();
        if !page.is_flag_set(PageFlags::HAS_PROGRESS_BAR) {
            self.scan_slots(object, record, 0, record.slot_count());
            return ScanOutcome::complete(object_size);
        }

        let mut start_offset = OBJECT_HEADER_SIZE.max(page.progress_bar());
        let mut unscanned = 0;
        if start_offset < object_size {
            if self.bailout_on_partial_scan {
                self.worklist.push_bailout(object);
            } else if !self.worklist.push(object) {
                self.worklist.push_bailout(object);
            }

            let already_scanned_offset = start_offset;
            let mut end_offset = object_size.min(start_offset + PROGRESS_BAR_SCANNING_CHUNK);
            loop {
                self.scan_byte_range(object, record, start_offset, end_offset);
                start_offset = end_offset;
                end_offset = object_size.min(end_offset + PROGRESS_BAR_SCANNING_CHUNK);
                let scan_until_end = self.worklist.is_full();
                if !(scan_until_end && start_offset < object_size) {
                    break;
                }
            }
            page.set_progress_bar(start_offset);
            if start_offset < object_size {
                unscanned = object_size - (start_offset - already_scanned_offset);
            }
        }
        ScanOutcome {
            size: object_size,
            unscanned,
        }
    }

    /// The normalized-map cache keeps lookup caches alive for performance
    /// only; it is colored grey without queueing and blackened in one sweep
    /// at the end of marking.
    fn visit_native_context(&self, object: ObjectReference, record: &ObjectRecord) -> ScanOutcome {
        if let Some(cache) = record.slot(NORMALIZED_MAP_CACHE_INDEX) {
            self.bitmap.white_to_grey(cache, self.mode);
        }
        self.scan_slots(object, record, 0, record.slot_count());
        ScanOutcome::complete(record.size())
    }

    fn scan_byte_range(
        &self,
        object: ObjectReference,
        record: &ObjectRecord,
        start_offset: usize,
        end_offset: usize,
    ) {
        debug_assert!(start_offset >= OBJECT_HEADER_SIZE);
        let from = (start_offset - OBJECT_HEADER_SIZE) / WORD_SIZE;
        let to = (end_offset - OBJECT_HEADER_SIZE) / WORD_SIZE;
        self.scan_slots(object, record, from, to.min(record.slot_count()));
    }

    fn scan_slots(&self, object: ObjectReference, record: &ObjectRecord, from: usize, to: usize) {
        for index in from..to {
            let Some(target) = record.slot(index) else {
                continue;
            };
            self.heap.compactor().record_slot(
                object,
                self.heap.slot_address(object, index),
                target,
            );
            self.mark_object(target);
        }
    }

    /// Color the target grey (if white) and queue it.
    pub fn mark_object(&self, target: ObjectReference) {
        white_to_grey_and_push(self.bitmap, self.worklist, target, self.mode);
    }
}
