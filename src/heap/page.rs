//! Pages: fixed-size chunks of a space carrying barrier flags and the
//! large-object scan cursor.

use std::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::heap::spaces::SpaceId;
use crate::types::{Address, KB};

/// Size of a regular page. Large-object pages are sized to their object.
pub const PAGE_SIZE: usize = 256 * KB;

bitflags! {
    /// Per-page flag word consulted by the write-barrier fast paths and the
    /// scavenge rewrite.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: usize {
        /// Stores into this page are interesting while marking is on.
        const POINTERS_TO_HERE_INTERESTING = 1 << 0;
        /// Stores out of this page go through the store buffer or barrier.
        const POINTERS_FROM_HERE_INTERESTING = 1 << 1;
        /// The page hosts a large array scanned chunk-wise via the
        /// progress bar.
        const HAS_PROGRESS_BAR = 1 << 2;
        /// The page was swept in place during a scavenge; worklist entries
        /// pointing here are only kept if externally marked.
        const SWEEP_TO_ITERATE = 1 << 3;
    }
}

/// One page of a space.
pub struct Page {
    start: Address,
    size: usize,
    space: SpaceId,
    flags: AtomicUsize,
    progress_bar: AtomicUsize,
}

impl Page {
    pub fn new(start: Address, size: usize, space: SpaceId) -> Self {
        Self {
            start,
            size,
            space,
            flags: AtomicUsize::new(0),
            progress_bar: AtomicUsize::new(0),
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn space(&self) -> SpaceId {
        self.space
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start && (addr - self.start) < self.size
    }

    pub fn set_flag(&self, flag: PageFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::Release);
    }

    pub fn clear_flag(&self, flag: PageFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::Release);
    }

    pub fn is_flag_set(&self, flag: PageFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flag.bits() != 0
    }

    /// Byte offset up to which the page's large array has been scanned.
    pub fn progress_bar(&self) -> usize {
        debug_assert!(self.is_flag_set(PageFlags::HAS_PROGRESS_BAR));
        self.progress_bar.load(Ordering::Acquire)
    }

    pub fn set_progress_bar(&self, offset: usize) {
        debug_assert!(self.is_flag_set(PageFlags::HAS_PROGRESS_BAR));
        self.progress_bar.store(offset, Ordering::Release);
    }

    pub fn reset_progress_bar(&self) {
        if self.is_flag_set(PageFlags::HAS_PROGRESS_BAR) {
            self.progress_bar.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent() {
        let page = Page::new(Address::from_usize(0x1000_0000), PAGE_SIZE, SpaceId::Old);
        page.set_flag(PageFlags::POINTERS_TO_HERE_INTERESTING);
        page.set_flag(PageFlags::POINTERS_FROM_HERE_INTERESTING);
        assert!(page.is_flag_set(PageFlags::POINTERS_TO_HERE_INTERESTING));
        page.clear_flag(PageFlags::POINTERS_TO_HERE_INTERESTING);
        assert!(!page.is_flag_set(PageFlags::POINTERS_TO_HERE_INTERESTING));
        assert!(page.is_flag_set(PageFlags::POINTERS_FROM_HERE_INTERESTING));
    }

    #[test]
    fn progress_bar_round_trips() {
        let page = Page::new(Address::from_usize(0x1000_0000), PAGE_SIZE, SpaceId::Large);
        page.set_flag(PageFlags::HAS_PROGRESS_BAR);
        assert_eq!(page.progress_bar(), 0);
        page.set_progress_bar(32 * 1024);
        assert_eq!(page.progress_bar(), 32 * 1024);
        page.reset_progress_bar();
        assert_eq!(page.progress_bar(), 0);
    }
}
