//! Spaces: paged old-generation spaces, the semispace pair of new space,
//! and the large-object space. Each space notifies allocation observers on
//! a byte threshold.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{GcError, GcResult};
use crate::heap::page::{Page, PAGE_SIZE};
use crate::types::Address;

/// Allocation alignment; keeps the mark-bit pairs of distinct objects
/// disjoint except where left trimming makes them overlap on purpose.
pub const ALLOCATION_ALIGNMENT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceId {
    New,
    Old,
    Map,
    Code,
    Large,
}

/// Callback invoked from allocation paths once per threshold-many bytes.
///
/// Runs under space-internal locks; implementations must not re-enter the
/// allocator.
pub trait AllocationObserver: Send + Sync {
    fn step(&self, bytes_allocated: usize, soonest_object: Address, size: usize);
}

/// Observer registration shared by all space kinds.
pub(crate) struct ObserverSet {
    observers: RwLock<Vec<Arc<dyn AllocationObserver>>>,
    accumulated: AtomicUsize,
    threshold: usize,
}

impl ObserverSet {
    fn new(threshold: usize) -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            accumulated: AtomicUsize::new(0),
            threshold,
        }
    }

    fn add(&self, observer: Arc<dyn AllocationObserver>) {
        self.observers.write().push(observer);
    }

    fn remove(&self, observer: &Arc<dyn AllocationObserver>) {
        self.observers
            .write()
            .retain(|o| !Arc::ptr_eq(o, observer));
    }

    fn notify(&self, object: Address, size: usize) {
        let total = self.accumulated.fetch_add(size, Ordering::AcqRel) + size;
        if total < self.threshold {
            return;
        }
        self.accumulated.store(0, Ordering::Release);
        for observer in self.observers.read().iter() {
            observer.step(total, object, size);
        }
    }
}

/// A paged old-generation space (old, map, or code) with bump allocation
/// over pre-carved pages.
pub struct PagedSpace {
    id: SpaceId,
    start: Address,
    end: Address,
    top: AtomicUsize,
    pages: Vec<Arc<Page>>,
    observers: ObserverSet,
    allocated_bytes: AtomicUsize,
}

impl PagedSpace {
    pub fn new(id: SpaceId, start: Address, capacity: usize, observer_threshold: usize) -> Self {
        let mut pages = Vec::new();
        let mut page_start = start;
        let end = start + capacity;
        while page_start < end {
            pages.push(Arc::new(Page::new(page_start, PAGE_SIZE, id)));
            page_start = page_start + PAGE_SIZE;
        }
        Self {
            id,
            start,
            end,
            top: AtomicUsize::new(start.as_usize()),
            pages,
            observers: ObserverSet::new(observer_threshold),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> SpaceId {
        self.id
    }

    pub fn pages(&self) -> &[Arc<Page>] {
        &self.pages
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    pub fn allocate(&self, size: usize) -> GcResult<Address> {
        let size = round_up(size, ALLOCATION_ALIGNMENT);
        let old_top = self.top.fetch_add(size, Ordering::AcqRel);
        if old_top + size > self.end.as_usize() {
            self.top.fetch_sub(size, Ordering::AcqRel);
            return Err(GcError::OutOfMemory);
        }
        self.allocated_bytes.fetch_add(size, Ordering::AcqRel);
        let addr = Address::from_usize(old_top);
        self.observers.notify(addr, size);
        Ok(addr)
    }

    pub fn add_allocation_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_allocation_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.observers.remove(observer);
    }
}

/// The young generation: two semispaces, one active at a time. A flip turns
/// the active half into from-space; evacuation targets the other half.
pub struct NewSpace {
    lower: (Address, Address),
    upper: (Address, Address),
    active_is_lower: AtomicBool,
    top: AtomicUsize,
    pages: Vec<Arc<Page>>,
    observers: ObserverSet,
}

impl NewSpace {
    pub fn new(start: Address, semispace_capacity: usize, observer_threshold: usize) -> Self {
        let lower = (start, start + semispace_capacity);
        let upper = (lower.1, lower.1 + semispace_capacity);
        let mut pages = Vec::new();
        let mut page_start = start;
        while page_start < upper.1 {
            pages.push(Arc::new(Page::new(page_start, PAGE_SIZE, SpaceId::New)));
            page_start = page_start + PAGE_SIZE;
        }
        Self {
            lower,
            upper,
            active_is_lower: AtomicBool::new(true),
            top: AtomicUsize::new(start.as_usize()),
            pages,
            observers: ObserverSet::new(observer_threshold),
        }
    }

    pub fn pages(&self) -> &[Arc<Page>] {
        &self.pages
    }

    pub fn capacity(&self) -> usize {
        self.lower.1 - self.lower.0
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.lower.0 && addr < self.upper.1
    }

    fn active_half(&self) -> (Address, Address) {
        if self.active_is_lower.load(Ordering::Acquire) {
            self.lower
        } else {
            self.upper
        }
    }

    fn inactive_half(&self) -> (Address, Address) {
        if self.active_is_lower.load(Ordering::Acquire) {
            self.upper
        } else {
            self.lower
        }
    }

    /// Whether `addr` is in from-space (the half evacuated by a scavenge).
    pub fn in_from_space(&self, addr: Address) -> bool {
        let (start, end) = self.inactive_half();
        addr >= start && addr < end
    }

    /// Whether `addr` is in to-space (the half receiving evacuees).
    pub fn in_to_space(&self, addr: Address) -> bool {
        let (start, end) = self.active_half();
        addr >= start && addr < end
    }

    /// Swap semispaces: the active half becomes from-space and allocation
    /// restarts at the bottom of the other half.
    pub fn flip(&self) {
        let was_lower = self.active_is_lower.load(Ordering::Acquire);
        self.active_is_lower.store(!was_lower, Ordering::Release);
        let (start, _) = self.active_half();
        self.top.store(start.as_usize(), Ordering::Release);
    }

    pub fn allocate(&self, size: usize) -> GcResult<Address> {
        let size = round_up(size, ALLOCATION_ALIGNMENT);
        let (_, end) = self.active_half();
        let old_top = self.top.fetch_add(size, Ordering::AcqRel);
        if old_top + size > end.as_usize() {
            self.top.fetch_sub(size, Ordering::AcqRel);
            return Err(GcError::OutOfMemory);
        }
        let addr = Address::from_usize(old_top);
        self.observers.notify(addr, size);
        Ok(addr)
    }

    pub fn add_allocation_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_allocation_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.observers.remove(observer);
    }
}

/// Large-object space: every allocation gets a page of its own, sized to
/// the object.
pub struct LargeSpace {
    start: Address,
    end: Address,
    top: AtomicUsize,
    pages: RwLock<Vec<Arc<Page>>>,
    observers: ObserverSet,
    allocated_bytes: AtomicUsize,
}

impl LargeSpace {
    pub fn new(start: Address, capacity: usize, observer_threshold: usize) -> Self {
        Self {
            start,
            end: start + capacity,
            top: AtomicUsize::new(start.as_usize()),
            pages: RwLock::new(Vec::new()),
            observers: ObserverSet::new(observer_threshold),
            allocated_bytes: AtomicUsize::new(0),
        }
    }

    pub fn pages(&self) -> Vec<Arc<Page>> {
        self.pages.read().clone()
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes.load(Ordering::Acquire)
    }

    /// Allocate an object and its dedicated page; returns the object start
    /// and the page for flag setup.
    pub fn allocate(&self, size: usize) -> GcResult<(Address, Arc<Page>)> {
        let page_size = round_up(size, ALLOCATION_ALIGNMENT);
        let old_top = self.top.fetch_add(page_size, Ordering::AcqRel);
        if old_top + page_size > self.end.as_usize() {
            self.top.fetch_sub(page_size, Ordering::AcqRel);
            return Err(GcError::OutOfMemory);
        }
        self.allocated_bytes.fetch_add(page_size, Ordering::AcqRel);
        let addr = Address::from_usize(old_top);
        let page = Arc::new(Page::new(addr, page_size, SpaceId::Large));
        self.pages.write().push(Arc::clone(&page));
        self.observers.notify(addr, page_size);
        Ok((addr, page))
    }

    pub fn add_allocation_observer(&self, observer: Arc<dyn AllocationObserver>) {
        self.observers.add(observer);
    }

    pub fn remove_allocation_observer(&self, observer: &Arc<dyn AllocationObserver>) {
        self.observers.remove(observer);
    }
}

fn round_up(value: usize, alignment: usize) -> usize {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingObserver(AtomicUsize);

    impl AllocationObserver for CountingObserver {
        fn step(&self, _bytes: usize, _object: Address, _size: usize) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn paged_space_bumps_and_overflows() {
        let space = PagedSpace::new(SpaceId::Old, Address::from_usize(0x100_0000), PAGE_SIZE, 1024);
        let a = space.allocate(64).unwrap();
        let b = space.allocate(64).unwrap();
        assert_eq!(b - a, 64);
        assert!(space.allocate(PAGE_SIZE).is_err());
    }

    #[test]
    fn observer_fires_on_threshold() {
        let space = PagedSpace::new(SpaceId::Old, Address::from_usize(0x100_0000), PAGE_SIZE, 128);
        let observer = Arc::new(CountingObserver(AtomicUsize::new(0)));
        space.add_allocation_observer(observer.clone());
        space.allocate(64).unwrap();
        assert_eq!(observer.0.load(Ordering::Relaxed), 0);
        space.allocate(64).unwrap();
        assert_eq!(observer.0.load(Ordering::Relaxed), 1);
        space.remove_allocation_observer(&(observer.clone() as Arc<dyn AllocationObserver>));
        space.allocate(256).unwrap();
        assert_eq!(observer.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn new_space_flip_swaps_halves() {
        let space = NewSpace::new(Address::from_usize(0x100_0000), PAGE_SIZE, 1024);
        let addr = space.allocate(64).unwrap();
        assert!(space.in_to_space(addr));
        space.flip();
        assert!(space.in_from_space(addr));
        let evacuee = space.allocate(64).unwrap();
        assert!(space.in_to_space(evacuee));
    }

    #[test]
    fn large_space_sizes_pages_to_objects() {
        let space = LargeSpace::new(Address::from_usize(0x100_0000), 4 * PAGE_SIZE, 1024);
        let (addr, page) = space.allocate(3 * PAGE_SIZE).unwrap();
        assert_eq!(page.start(), addr);
        assert_eq!(page.size(), 3 * PAGE_SIZE);
    }
}
