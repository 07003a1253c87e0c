//! The managed heap model the marking core is exercised against.
//!
//! Spaces, pages, the object registry, roots, the retained-maps list, and
//! the peers the controller consumes (compacting collector, stack guard,
//! black allocator). The model allocates bookkeeping records rather than
//! raw memory; addresses are real and stable, which is all the marker
//! cares about.

pub mod object;
pub mod page;
pub mod spaces;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::atomic::AtomicCell;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;

use crate::barrier::RecordWriteStub;
use crate::black_alloc::BlackAllocator;
use crate::compactor::CompactingCollector;
use crate::error::{GcError, GcResult};
use crate::marking::MarkBitmap;
use crate::stack_guard::StackGuard;
use crate::types::{Address, ObjectReference, KB, MB, WORD_SIZE, OBJECT_HEADER_SIZE};

pub use object::{
    InstanceKind, ObjectRecord, RetainedMapEntry, RetainedMaps, WeakMapCell,
    MAP_CONSTRUCTOR_INDEX, MAP_PROTOTYPE_INDEX, MAP_SLOTS, NATIVE_CONTEXT_SLOTS,
    NORMALIZED_MAP_CACHE_INDEX,
};
pub use page::{Page, PageFlags, PAGE_SIZE};
pub use spaces::{AllocationObserver, LargeSpace, NewSpace, PagedSpace, SpaceId};

/// What the heap is currently doing. The marker only steps while `NotInGc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    NotInGc,
    Scavenge,
    MarkCompact,
}

/// Sizing of the model heap's address range.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    pub heap_base: usize,
    pub semispace_capacity: usize,
    pub old_space_capacity: usize,
    pub map_space_capacity: usize,
    pub code_space_capacity: usize,
    pub large_space_capacity: usize,
    /// Old-generation budget used by the out-of-memory proximity check.
    pub old_generation_limit: usize,
    /// Allocation-observer callback period, in bytes.
    pub allocated_threshold: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            heap_base: 0x1000_0000,
            semispace_capacity: MB,
            old_space_capacity: 8 * MB,
            map_space_capacity: MB,
            code_space_capacity: MB,
            large_space_capacity: 16 * MB,
            old_generation_limit: 256 * MB,
            allocated_threshold: 64 * KB,
        }
    }
}

pub struct Heap {
    config: HeapConfig,
    epoch: Instant,

    bitmap: Arc<MarkBitmap>,
    black_allocator: Arc<BlackAllocator>,
    compactor: CompactingCollector,
    stack_guard: StackGuard,

    registry: DashMap<usize, Arc<ObjectRecord>>,
    pages: DashMap<usize, Arc<Page>>,

    new_space: NewSpace,
    old_space: PagedSpace,
    map_space: PagedSpace,
    code_space: PagedSpace,
    large_space: LargeSpace,

    meta_map: AtomicUsize,
    one_pointer_filler_map: AtomicUsize,
    free_space_map: AtomicUsize,

    code_stubs: DashMap<u32, Arc<RecordWriteStub>>,
    strong_roots: Mutex<Vec<ObjectReference>>,
    native_contexts: Mutex<Vec<ObjectReference>>,
    retained_maps: Mutex<RetainedMaps>,
    compilation_cache: Mutex<Vec<ObjectReference>>,
    externally_grey: DashSet<usize>,

    gc_state: AtomicCell<GcState>,
    serializer_enabled: AtomicBool,
    deserialization_complete: AtomicBool,
    always_allocate: AtomicBool,
    should_reduce_memory: AtomicBool,

    old_generation_allocation_counter: AtomicUsize,
}

impl Heap {
    pub fn new(config: HeapConfig) -> Arc<Self> {
        let base = Address::from_usize(config.heap_base);
        let new_total = 2 * config.semispace_capacity;
        let old_start = base + new_total;
        let map_start = old_start + config.old_space_capacity;
        let code_start = map_start + config.map_space_capacity;
        let large_start = code_start + config.code_space_capacity;
        let total = new_total
            + config.old_space_capacity
            + config.map_space_capacity
            + config.code_space_capacity
            + config.large_space_capacity;

        let bitmap = Arc::new(MarkBitmap::new(base, total));
        let black_allocator = Arc::new(BlackAllocator::new(&bitmap));

        let heap = Arc::new(Self {
            epoch: Instant::now(),
            bitmap,
            black_allocator,
            compactor: CompactingCollector::new(),
            stack_guard: StackGuard::new(),
            registry: DashMap::new(),
            pages: DashMap::new(),
            new_space: NewSpace::new(base, config.semispace_capacity, config.allocated_threshold),
            old_space: PagedSpace::new(
                SpaceId::Old,
                old_start,
                config.old_space_capacity,
                config.allocated_threshold,
            ),
            map_space: PagedSpace::new(
                SpaceId::Map,
                map_start,
                config.map_space_capacity,
                config.allocated_threshold,
            ),
            code_space: PagedSpace::new(
                SpaceId::Code,
                code_start,
                config.code_space_capacity,
                config.allocated_threshold,
            ),
            large_space: LargeSpace::new(
                large_start,
                config.large_space_capacity,
                config.allocated_threshold,
            ),
            meta_map: AtomicUsize::new(0),
            one_pointer_filler_map: AtomicUsize::new(0),
            free_space_map: AtomicUsize::new(0),
            code_stubs: DashMap::new(),
            strong_roots: Mutex::new(Vec::new()),
            native_contexts: Mutex::new(Vec::new()),
            retained_maps: Mutex::new(RetainedMaps::default()),
            compilation_cache: Mutex::new(Vec::new()),
            externally_grey: DashSet::new(),
            gc_state: AtomicCell::new(GcState::NotInGc),
            serializer_enabled: AtomicBool::new(false),
            deserialization_complete: AtomicBool::new(true),
            always_allocate: AtomicBool::new(false),
            should_reduce_memory: AtomicBool::new(false),
            old_generation_allocation_counter: AtomicUsize::new(0),
            config,
        });

        heap.index_space_pages();
        heap.bootstrap_maps();
        heap
    }

    fn index_space_pages(&self) {
        for page in self
            .new_space
            .pages()
            .iter()
            .chain(self.old_space.pages())
            .chain(self.map_space.pages())
            .chain(self.code_space.pages())
        {
            self.index_page(page);
        }
    }

    fn index_page(&self, page: &Arc<Page>) {
        let first = page.start().as_usize() / PAGE_SIZE;
        let last = (page.start().as_usize() + page.size() - 1) / PAGE_SIZE;
        for index in first..=last {
            self.pages.insert(index, Arc::clone(page));
        }
    }

    fn bootstrap_maps(&self) {
        // The meta map is its own map; fix up after allocation.
        let meta = self
            .allocate_map_record(None, InstanceKind::Map)
            .expect("map space cannot be full at bootstrap");
        self.record_of(meta).set_map(meta);
        self.meta_map.store(meta.to_raw(), Ordering::Release);

        let filler = self
            .allocate_map_record(Some(meta), InstanceKind::OnePointerFiller)
            .expect("map space cannot be full at bootstrap");
        self.one_pointer_filler_map
            .store(filler.to_raw(), Ordering::Release);

        let free = self
            .allocate_map_record(Some(meta), InstanceKind::FreeSpace)
            .expect("map space cannot be full at bootstrap");
        self.free_space_map.store(free.to_raw(), Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Component access

    pub fn marking_bitmap(&self) -> &Arc<MarkBitmap> {
        &self.bitmap
    }

    pub fn black_allocator(&self) -> &Arc<BlackAllocator> {
        &self.black_allocator
    }

    pub fn compactor(&self) -> &CompactingCollector {
        &self.compactor
    }

    pub fn stack_guard(&self) -> &StackGuard {
        &self.stack_guard
    }

    pub fn new_space(&self) -> &NewSpace {
        &self.new_space
    }

    pub fn old_space(&self) -> &PagedSpace {
        &self.old_space
    }

    pub fn map_space(&self) -> &PagedSpace {
        &self.map_space
    }

    pub fn code_space(&self) -> &PagedSpace {
        &self.code_space
    }

    pub fn large_space(&self) -> &LargeSpace {
        &self.large_space
    }

    /// Milliseconds since heap creation, monotonic.
    pub fn monotonic_ms(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64() * 1000.0
    }

    // ---------------------------------------------------------------
    // Object access

    pub fn object(&self, object: ObjectReference) -> Option<Arc<ObjectRecord>> {
        self.registry
            .get(&object.to_raw())
            .map(|entry| Arc::clone(entry.value()))
    }

    /// Record of a known-live object. A missing record is heap corruption.
    pub fn record_of(&self, object: ObjectReference) -> Arc<ObjectRecord> {
        self.object(object).expect("no record for heap object")
    }

    pub fn map_of(&self, object: ObjectReference) -> ObjectReference {
        self.record_of(object).map().expect("object without a map")
    }

    /// Size computed from the type descriptor, as the visitor does it.
    pub fn size_from_map(&self, map: ObjectReference, object: ObjectReference) -> usize {
        debug_assert_eq!(self.map_of(object), map);
        self.record_of(object).size()
    }

    pub fn is_filler(&self, object: ObjectReference) -> bool {
        self.record_of(object).kind().is_filler()
    }

    pub fn page_of(&self, addr: Address) -> Arc<Page> {
        let index = addr.as_usize() / PAGE_SIZE;
        self.pages
            .get(&index)
            .map(|entry| Arc::clone(entry.value()))
            .expect("address outside any page")
    }

    /// Address of a tagged pointer slot.
    pub fn slot_address(&self, object: ObjectReference, index: usize) -> Address {
        object.to_address() + OBJECT_HEADER_SIZE + index * WORD_SIZE
    }

    pub fn read_field(&self, object: ObjectReference, index: usize) -> Option<ObjectReference> {
        self.record_of(object).slot(index)
    }

    /// Raw mutator store. The write barrier is a separate call; see
    /// `IncrementalMarking::record_write`.
    pub fn write_field(&self, object: ObjectReference, index: usize, value: Option<ObjectReference>) {
        self.record_of(object).set_slot(index, value);
    }

    // ---------------------------------------------------------------
    // Allocation

    fn register(&self, addr: Address, record: ObjectRecord, space: SpaceId) -> ObjectReference {
        let object = ObjectReference::from_address(addr).expect("allocation at the null address");
        self.registry.insert(object.to_raw(), Arc::new(record));
        if space != SpaceId::New {
            self.old_generation_allocation_counter
                .fetch_add(self.record_of(object).size(), Ordering::AcqRel);
            self.black_allocator.allocate_black(object);
        }
        object
    }

    fn allocate_map_record(
        &self,
        meta_map: Option<ObjectReference>,
        instances: InstanceKind,
    ) -> GcResult<ObjectReference> {
        let record = ObjectRecord::new_map_record(meta_map, instances);
        let addr = self.map_space.allocate(record.size())?;
        Ok(self.register(addr, record, SpaceId::Map))
    }

    /// Allocate a map whose instances have the given kind.
    pub fn new_map(&self, instances: InstanceKind) -> GcResult<ObjectReference> {
        self.allocate_map_record(Some(self.meta_map()), instances)
    }

    /// Allocate an ordinary object with `pointer_count` tagged fields.
    pub fn allocate_plain(
        &self,
        space: SpaceId,
        map: ObjectReference,
        pointer_count: usize,
    ) -> GcResult<ObjectReference> {
        let kind = self
            .record_of(map)
            .instance_kind()
            .ok_or(GcError::InvalidReference)?;
        let record = ObjectRecord::new(Some(map), kind, pointer_count);
        let size = record.size();
        let addr = match space {
            SpaceId::New => self.new_space.allocate(size)?,
            SpaceId::Old => self.old_space.allocate(size)?,
            SpaceId::Map => self.map_space.allocate(size)?,
            SpaceId::Code => self.code_space.allocate(size)?,
            SpaceId::Large => {
                let (addr, page) = self.large_space.allocate(size)?;
                self.index_page(&page);
                addr
            }
        };
        Ok(self.register(addr, record, space))
    }

    /// Allocate a fixed array of `length` pointer slots in large-object
    /// space, optionally scanned chunk-wise through a progress bar.
    pub fn allocate_large_array(
        &self,
        map: ObjectReference,
        length: usize,
        with_progress_bar: bool,
    ) -> GcResult<ObjectReference> {
        debug_assert_eq!(
            self.record_of(map).instance_kind(),
            Some(InstanceKind::FixedArray)
        );
        let record = ObjectRecord::new(Some(map), InstanceKind::FixedArray, length);
        let (addr, page) = self.large_space.allocate(record.size())?;
        self.index_page(&page);
        if with_progress_bar {
            page.set_flag(PageFlags::HAS_PROGRESS_BAR);
        }
        Ok(self.register(addr, record, SpaceId::Large))
    }

    /// Allocate a native context (fixed slot table) in old space.
    pub fn allocate_native_context(&self, map: ObjectReference) -> GcResult<ObjectReference> {
        debug_assert_eq!(
            self.record_of(map).instance_kind(),
            Some(InstanceKind::NativeContext)
        );
        let record = ObjectRecord::new(Some(map), InstanceKind::NativeContext, NATIVE_CONTEXT_SLOTS);
        let addr = self.old_space.allocate(record.size())?;
        let context = self.register(addr, record, SpaceId::Old);
        self.native_contexts.lock().push(context);
        Ok(context)
    }

    // ---------------------------------------------------------------
    // Well-known maps

    pub fn meta_map(&self) -> ObjectReference {
        ObjectReference::from_raw(self.meta_map.load(Ordering::Acquire))
            .expect("heap not bootstrapped")
    }

    pub fn one_pointer_filler_map(&self) -> ObjectReference {
        ObjectReference::from_raw(self.one_pointer_filler_map.load(Ordering::Acquire))
            .expect("heap not bootstrapped")
    }

    pub fn free_space_map(&self) -> ObjectReference {
        ObjectReference::from_raw(self.free_space_map.load(Ordering::Acquire))
            .expect("heap not bootstrapped")
    }

    pub fn map_constructor(&self, map: ObjectReference) -> Option<ObjectReference> {
        self.record_of(map).slot(MAP_CONSTRUCTOR_INDEX)
    }

    pub fn set_map_constructor(&self, map: ObjectReference, constructor: Option<ObjectReference>) {
        self.record_of(map).set_slot(MAP_CONSTRUCTOR_INDEX, constructor);
    }

    pub fn map_prototype(&self, map: ObjectReference) -> Option<ObjectReference> {
        self.record_of(map).slot(MAP_PROTOTYPE_INDEX)
    }

    pub fn set_map_prototype(&self, map: ObjectReference, prototype: Option<ObjectReference>) {
        self.record_of(map).set_slot(MAP_PROTOTYPE_INDEX, prototype);
    }

    // ---------------------------------------------------------------
    // Roots, contexts, caches

    pub fn add_strong_root(&self, object: ObjectReference) {
        self.strong_roots.lock().push(object);
    }

    pub fn remove_strong_root(&self, object: ObjectReference) {
        self.strong_roots.lock().retain(|root| *root != object);
    }

    pub fn iterate_strong_roots<F: FnMut(ObjectReference)>(&self, mut f: F) {
        for root in self.strong_roots.lock().iter() {
            f(*root);
        }
    }

    pub fn native_contexts(&self) -> Vec<ObjectReference> {
        self.native_contexts.lock().clone()
    }

    pub fn retained_maps(&self) -> &Mutex<RetainedMaps> {
        &self.retained_maps
    }

    pub fn add_retained_map(&self, map: ObjectReference, age: usize) {
        self.retained_maps.lock().entries.push(RetainedMapEntry {
            cell: WeakMapCell::new(map),
            age,
        });
    }

    pub fn set_number_of_disposed_maps(&self, count: usize) {
        self.retained_maps.lock().number_of_disposed_maps = count;
    }

    /// Register a compiled record-write stub under its dictionary key.
    pub fn register_code_stub(&self, key: u32, stub: Arc<RecordWriteStub>) {
        self.code_stubs.insert(key, stub);
    }

    pub fn code_stub(&self, key: u32) -> Option<Arc<RecordWriteStub>> {
        self.code_stubs.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn code_stubs(&self) -> Vec<Arc<RecordWriteStub>> {
        self.code_stubs
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn add_compilation_cache_entry(&self, object: ObjectReference) {
        self.compilation_cache.lock().push(object);
    }

    pub fn compilation_cache_len(&self) -> usize {
        self.compilation_cache.lock().len()
    }

    /// Drop cached compilations so they do not keep dead code alive through
    /// the cycle.
    pub fn clear_compilation_cache(&self) {
        self.compilation_cache.lock().clear();
    }

    // ---------------------------------------------------------------
    // State flags

    pub fn gc_state(&self) -> GcState {
        self.gc_state.load()
    }

    pub fn set_gc_state(&self, state: GcState) {
        self.gc_state.store(state);
    }

    pub fn serializer_enabled(&self) -> bool {
        self.serializer_enabled.load(Ordering::Acquire)
    }

    pub fn set_serializer_enabled(&self, enabled: bool) {
        self.serializer_enabled.store(enabled, Ordering::Release);
    }

    pub fn deserialization_complete(&self) -> bool {
        self.deserialization_complete.load(Ordering::Acquire)
    }

    pub fn set_deserialization_complete(&self, complete: bool) {
        self.deserialization_complete.store(complete, Ordering::Release);
    }

    pub fn always_allocate(&self) -> bool {
        self.always_allocate.load(Ordering::Acquire)
    }

    pub fn set_always_allocate(&self, always: bool) {
        self.always_allocate.store(always, Ordering::Release);
    }

    pub fn should_reduce_memory(&self) -> bool {
        self.should_reduce_memory.load(Ordering::Acquire)
    }

    pub fn set_should_reduce_memory(&self, reduce: bool) {
        self.should_reduce_memory.store(reduce, Ordering::Release);
    }

    // ---------------------------------------------------------------
    // Counters

    /// Cumulative bytes ever allocated to the old generation.
    pub fn old_generation_allocation_counter(&self) -> usize {
        self.old_generation_allocation_counter.load(Ordering::Acquire)
    }

    /// Current size of promoted (old-generation) objects.
    pub fn promoted_space_size(&self) -> usize {
        self.old_space.allocated_bytes()
            + self.map_space.allocated_bytes()
            + self.code_space.allocated_bytes()
            + self.large_space.allocated_bytes()
    }

    pub fn is_close_to_out_of_memory(&self, slack: usize) -> bool {
        self.promoted_space_size() + slack >= self.config.old_generation_limit
    }

    // ---------------------------------------------------------------
    // Scavenge support

    pub fn in_from_space(&self, object: ObjectReference) -> bool {
        self.new_space.in_from_space(object.to_address())
    }

    pub fn in_to_space(&self, object: ObjectReference) -> bool {
        self.new_space.in_to_space(object.to_address())
    }

    pub fn in_new_space(&self, object: ObjectReference) -> bool {
        self.new_space.contains(object.to_address())
    }

    pub fn forwarding_of(&self, object: ObjectReference) -> Option<ObjectReference> {
        self.record_of(object).forwarding()
    }

    /// Copy `object` into to-space, leaving a forwarding address behind.
    pub fn evacuate_to_to_space(&self, object: ObjectReference) -> GcResult<ObjectReference> {
        debug_assert!(self.in_from_space(object));
        self.evacuate(object, SpaceId::New)
    }

    /// Promote `object` into old space, leaving a forwarding address behind.
    pub fn promote_to_old_space(&self, object: ObjectReference) -> GcResult<ObjectReference> {
        debug_assert!(self.in_from_space(object));
        self.evacuate(object, SpaceId::Old)
    }

    fn evacuate(&self, object: ObjectReference, target: SpaceId) -> GcResult<ObjectReference> {
        let old = self.record_of(object);
        let map = old.map().ok_or(GcError::InvalidReference)?;
        let copy = ObjectRecord::new(Some(map), old.kind(), old.slot_count());
        for i in 0..old.slot_count() {
            copy.set_slot(i, old.slot(i));
        }
        let size = copy.size();
        let addr = match target {
            SpaceId::New => self.new_space.allocate(size)?,
            SpaceId::Old => self.old_space.allocate(size)?,
            _ => return Err(GcError::BadState("evacuation targets new or old space")),
        };
        let forwarded = self.register(addr, copy, target);
        old.set_forwarding(forwarded);
        Ok(forwarded)
    }

    pub fn flip_new_space(&self) {
        self.new_space.flip();
    }

    /// External mark used for objects on pages swept in place; consulted by
    /// the post-scavenge worklist rewrite.
    pub fn set_externally_grey(&self, object: ObjectReference) {
        self.externally_grey.insert(object.to_raw());
    }

    pub fn is_externally_grey(&self, object: ObjectReference) -> bool {
        self.externally_grey.contains(&object.to_raw())
    }

    pub fn clear_external_marks(&self) {
        self.externally_grey.clear();
    }

    // ---------------------------------------------------------------
    // Left trimming

    /// Shift a fixed array's start forward by `words` slots, in place.
    /// The vacated prefix becomes a filler; the shrunk array lives at the
    /// shifted address. Color transfer is the marker's job; see
    /// `IncrementalMarking::notify_left_trimming`.
    pub fn left_trim_fixed_array(
        &self,
        array: ObjectReference,
        words: usize,
    ) -> GcResult<ObjectReference> {
        let old = self.record_of(array);
        if old.kind() != InstanceKind::FixedArray || words == 0 || words >= old.slot_count() {
            return Err(GcError::BadState("left trim needs a strictly shrinking array"));
        }
        let map = old.map().ok_or(GcError::InvalidReference)?;

        let new_len = old.slot_count() - words;
        let trimmed = ObjectRecord::new(Some(map), InstanceKind::FixedArray, new_len);
        for i in 0..new_len {
            trimmed.set_slot(i, old.slot(i + words));
        }
        let new_addr = array.to_address() + words * WORD_SIZE;
        let trimmed_ref =
            ObjectReference::from_address(new_addr).expect("trim cannot reach the null address");

        let filler = if words == 1 {
            ObjectRecord::new(
                Some(self.one_pointer_filler_map()),
                InstanceKind::OnePointerFiller,
                0,
            )
        } else {
            ObjectRecord::new(Some(self.free_space_map()), InstanceKind::FreeSpace, words)
        };

        self.registry.insert(trimmed_ref.to_raw(), Arc::new(trimmed));
        self.registry.insert(array.to_raw(), Arc::new(filler));
        Ok(trimmed_ref)
    }
}
