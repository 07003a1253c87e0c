//! Object records and map (type descriptor) shapes.
//!
//! The heap keeps one record per live object, keyed by address. A record
//! names its map — itself a heap object in map space — and holds the
//! object's tagged pointer slots as atomics so mutator stores, the write
//! barrier, and concurrent markers can race on them safely.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{ObjectReference, OBJECT_HEADER_SIZE, WORD_SIZE};

/// What a map's instances are. Drives size computation and visitor
/// dispatch; a static table of shapes rather than a class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceKind {
    /// Ordinary object with a fixed set of tagged pointer fields.
    Plain,
    /// Array of tagged pointer slots; may carry a progress bar when large.
    FixedArray,
    /// Context with a fixed slot table; the normalized-map-cache slot gets
    /// special marking treatment.
    NativeContext,
    /// Code object; embedded pointers are updated through relocation
    /// records rather than ordinary slots.
    Code,
    /// A map itself (slot 0 = constructor, slot 1 = prototype).
    Map,
    /// Single-word filler left behind by left trimming.
    OnePointerFiller,
    /// Multi-word free-space filler; `len` is its size in words.
    FreeSpace,
}

impl InstanceKind {
    pub fn is_filler(self) -> bool {
        matches!(self, InstanceKind::OnePointerFiller | InstanceKind::FreeSpace)
    }
}

/// Slot index of the normalized-map cache in a native context.
pub const NORMALIZED_MAP_CACHE_INDEX: usize = 0;
/// Number of slots in a native context.
pub const NATIVE_CONTEXT_SLOTS: usize = 8;
/// Slot index of a map's constructor.
pub const MAP_CONSTRUCTOR_INDEX: usize = 0;
/// Slot index of a map's prototype.
pub const MAP_PROTOTYPE_INDEX: usize = 1;
/// Number of slots in a map object.
pub const MAP_SLOTS: usize = 2;

/// Per-object bookkeeping record.
pub struct ObjectRecord {
    map: AtomicUsize,
    kind: InstanceKind,
    /// For maps: the kind of this map's instances.
    instance_kind: Option<InstanceKind>,
    /// Pointer-slot count; for `FreeSpace`, total size in words.
    len: usize,
    slots: Box<[AtomicUsize]>,
    forwarding: AtomicUsize,
}

impl ObjectRecord {
    pub fn new(map: Option<ObjectReference>, kind: InstanceKind, len: usize) -> Self {
        let slot_count = match kind {
            InstanceKind::OnePointerFiller | InstanceKind::FreeSpace => 0,
            _ => len,
        };
        Self {
            map: AtomicUsize::new(map.map_or(0, |m| m.to_raw())),
            kind,
            instance_kind: None,
            len,
            slots: (0..slot_count).map(|_| AtomicUsize::new(0)).collect(),
            forwarding: AtomicUsize::new(0),
        }
    }

    pub fn new_map_record(meta_map: Option<ObjectReference>, instances: InstanceKind) -> Self {
        let mut record = Self::new(meta_map, InstanceKind::Map, MAP_SLOTS);
        record.instance_kind = Some(instances);
        record
    }

    pub fn map(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.map.load(Ordering::Acquire))
    }

    pub fn set_map(&self, map: ObjectReference) {
        self.map.store(map.to_raw(), Ordering::Release);
    }

    pub fn kind(&self) -> InstanceKind {
        self.kind
    }

    /// The kind of this map's instances. Meaningless for non-map objects.
    pub fn instance_kind(&self) -> Option<InstanceKind> {
        self.instance_kind
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, index: usize) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.slots[index].load(Ordering::Acquire))
    }

    pub fn set_slot(&self, index: usize, value: Option<ObjectReference>) {
        self.slots[index].store(value.map_or(0, |v| v.to_raw()), Ordering::Release);
    }

    /// Byte size derived from the record's shape.
    pub fn size(&self) -> usize {
        match self.kind {
            InstanceKind::OnePointerFiller => WORD_SIZE,
            InstanceKind::FreeSpace => self.len * WORD_SIZE,
            _ => OBJECT_HEADER_SIZE + self.len * WORD_SIZE,
        }
    }

    pub fn forwarding(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.forwarding.load(Ordering::Acquire))
    }

    pub fn set_forwarding(&self, target: ObjectReference) {
        self.forwarding.store(target.to_raw(), Ordering::Release);
    }
}

/// A weak cell holding a map, clearable when the map dies.
pub struct WeakMapCell {
    value: AtomicUsize,
}

impl WeakMapCell {
    pub fn new(map: ObjectReference) -> Self {
        Self {
            value: AtomicUsize::new(map.to_raw()),
        }
    }

    pub fn value(&self) -> Option<ObjectReference> {
        ObjectReference::from_raw(self.value.load(Ordering::Acquire))
    }

    pub fn clear(&self) {
        self.value.store(0, Ordering::Release);
    }

    pub fn is_cleared(&self) -> bool {
        self.value().is_none()
    }
}

/// One `(weak map, age)` entry of the retained-maps list.
pub struct RetainedMapEntry {
    pub cell: WeakMapCell,
    pub age: usize,
}

/// The retained-maps list. Entries before `number_of_disposed_maps` belong
/// to disposed contexts and are never aged or retained.
#[derive(Default)]
pub struct RetainedMaps {
    pub entries: Vec<RetainedMapEntry>,
    pub number_of_disposed_maps: usize,
}
