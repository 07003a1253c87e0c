//! Per-object color state packed into a word-indexed mark bitmap.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::types::{Address, ObjectReference, WORD_SIZE};

const BITS_PER_CELL: usize = usize::BITS as usize;

/// Whether a bitmap operation must be safe against concurrent markers.
///
/// `NonAtomic` is a relaxed fast path and is only legal while the cycle runs
/// single-threaded; the mode is chosen once at cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Atomic,
    NonAtomic,
}

/// Object color during a marking cycle.
///
/// An object's color is the pair of mark bits at its word index: the first
/// bit records "marked", the second "scanned". The second-without-first
/// state cannot be produced by any legal transition; observing it means the
/// bitmap (or the address it was queried with) is corrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    /// Unmarked; reclaimable if the cycle completes without coloring it.
    White,
    /// Marked but not yet scanned; on the worklist.
    Grey,
    /// Marked and scanned; every outgoing reference is grey or black.
    Black,
    /// Corruption sentinel (second bit set, first clear).
    Impossible,
}

/// Mark bitmap covering a contiguous heap address range, one bit per word.
///
/// An object's color occupies the bit at its word index and the bit after
/// it. Because the pairs of adjacent words overlap by one bit, shifting an
/// object's start forward by one word (left trimming) can transfer color by
/// touching a single bit; [`crate::controller::IncrementalMarking::notify_left_trimming`]
/// relies on this.
///
/// # Examples
///
/// ```
/// use greymark::marking::{AccessMode, Color, MarkBitmap};
/// use greymark::types::{Address, ObjectReference};
///
/// let base = Address::from_usize(0x1000_0000);
/// let bitmap = MarkBitmap::new(base, 1024 * 1024);
/// let obj = ObjectReference::from_address(base).unwrap();
///
/// assert_eq!(bitmap.color(obj, AccessMode::Atomic), Color::White);
/// assert!(bitmap.white_to_grey(obj, AccessMode::Atomic));
/// assert!(bitmap.grey_to_black(obj, AccessMode::Atomic));
/// assert_eq!(bitmap.color(obj, AccessMode::Atomic), Color::Black);
///
/// // Repeating a transition reports that no change was made.
/// assert!(!bitmap.white_to_grey(obj, AccessMode::Atomic));
/// ```
pub struct MarkBitmap {
    cells: Box<[AtomicUsize]>,
    base: Address,
    covered_bytes: usize,
}

impl MarkBitmap {
    pub fn new(base: Address, covered_bytes: usize) -> Self {
        let bits = covered_bytes / WORD_SIZE;
        let num_cells = bits.div_ceil(BITS_PER_CELL);
        Self {
            cells: (0..num_cells).map(|_| AtomicUsize::new(0)).collect(),
            base,
            covered_bytes,
        }
    }

    /// CAS the first mark bit 0 -> 1. Returns true iff this call made the
    /// transition; a white object becomes grey, anything already marked is
    /// left untouched.
    pub fn white_to_grey(&self, object: ObjectReference, mode: AccessMode) -> bool {
        self.set_bit(self.first_bit_index(object), mode)
    }

    /// CAS the second mark bit 0 -> 1 while the first bit is set. Returns
    /// true iff this call made the transition.
    pub fn grey_to_black(&self, object: ObjectReference, mode: AccessMode) -> bool {
        let first = self.first_bit_index(object);
        if !self.get_bit(first, mode) {
            return false;
        }
        self.set_bit(first + 1, mode)
    }

    /// White -> grey -> black composition. True iff both transitions were
    /// performed by this call.
    pub fn white_to_black(&self, object: ObjectReference, mode: AccessMode) -> bool {
        self.white_to_grey(object, mode) && self.grey_to_black(object, mode)
    }

    /// Drop a black object back to grey. Only used to recover from worklist
    /// overflow, where a blackened object could not be queued for scanning.
    pub fn black_to_grey(&self, object: ObjectReference, mode: AccessMode) {
        self.clear_bit(self.first_bit_index(object) + 1, mode);
    }

    pub fn color(&self, object: ObjectReference, mode: AccessMode) -> Color {
        let first = self.first_bit_index(object);
        match (self.get_bit(first, mode), self.get_bit(first + 1, mode)) {
            (false, false) => Color::White,
            (true, false) => Color::Grey,
            (true, true) => Color::Black,
            (false, true) => Color::Impossible,
        }
    }

    pub fn is_white(&self, object: ObjectReference, mode: AccessMode) -> bool {
        self.color(object, mode) == Color::White
    }

    pub fn is_grey(&self, object: ObjectReference, mode: AccessMode) -> bool {
        self.color(object, mode) == Color::Grey
    }

    pub fn is_black(&self, object: ObjectReference, mode: AccessMode) -> bool {
        self.color(object, mode) == Color::Black
    }

    pub fn is_impossible(&self, object: ObjectReference, mode: AccessMode) -> bool {
        self.color(object, mode) == Color::Impossible
    }

    /// Reset every object to white. Runs between cycles, never during one.
    pub fn clear_all(&self) {
        for cell in self.cells.iter() {
            cell.store(0, Ordering::Release);
        }
    }

    fn first_bit_index(&self, object: ObjectReference) -> usize {
        let addr = object.to_address();
        debug_assert!(addr >= self.base && addr - self.base < self.covered_bytes);
        debug_assert!(addr.is_aligned(WORD_SIZE));
        (addr - self.base) / WORD_SIZE
    }

    fn get_bit(&self, index: usize, mode: AccessMode) -> bool {
        let (cell, mask) = self.locate(index);
        let Some(cell) = self.cells.get(cell) else {
            return false;
        };
        let word = match mode {
            AccessMode::Atomic => cell.load(Ordering::Acquire),
            AccessMode::NonAtomic => cell.load(Ordering::Relaxed),
        };
        word & mask != 0
    }

    /// Set one bit; true iff it was previously clear.
    fn set_bit(&self, index: usize, mode: AccessMode) -> bool {
        let (cell, mask) = self.locate(index);
        let Some(cell) = self.cells.get(cell) else {
            return false;
        };
        match mode {
            AccessMode::Atomic => cell.fetch_or(mask, Ordering::AcqRel) & mask == 0,
            AccessMode::NonAtomic => {
                let word = cell.load(Ordering::Relaxed);
                if word & mask != 0 {
                    return false;
                }
                cell.store(word | mask, Ordering::Relaxed);
                true
            }
        }
    }

    fn clear_bit(&self, index: usize, mode: AccessMode) {
        let (cell, mask) = self.locate(index);
        let Some(cell) = self.cells.get(cell) else {
            return;
        };
        match mode {
            AccessMode::Atomic => {
                cell.fetch_and(!mask, Ordering::AcqRel);
            }
            AccessMode::NonAtomic => {
                let word = cell.load(Ordering::Relaxed);
                cell.store(word & !mask, Ordering::Relaxed);
            }
        }
    }

    fn locate(&self, bit_index: usize) -> (usize, usize) {
        (bit_index / BITS_PER_CELL, 1 << (bit_index % BITS_PER_CELL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap() -> (MarkBitmap, ObjectReference) {
        let base = Address::from_usize(0x1000_0000);
        let bitmap = MarkBitmap::new(base, 64 * 1024);
        let obj = ObjectReference::from_address(base + 128).unwrap();
        (bitmap, obj)
    }

    #[test]
    fn transitions_walk_white_grey_black() {
        let (bitmap, obj) = bitmap();
        assert!(bitmap.is_white(obj, AccessMode::Atomic));
        assert!(bitmap.white_to_grey(obj, AccessMode::Atomic));
        assert!(bitmap.is_grey(obj, AccessMode::Atomic));
        assert!(bitmap.grey_to_black(obj, AccessMode::Atomic));
        assert!(bitmap.is_black(obj, AccessMode::Atomic));
    }

    #[test]
    fn grey_to_black_requires_grey() {
        let (bitmap, obj) = bitmap();
        assert!(!bitmap.grey_to_black(obj, AccessMode::Atomic));
        assert!(bitmap.is_white(obj, AccessMode::Atomic));
    }

    #[test]
    fn white_to_black_is_the_composition() {
        let (bitmap, obj) = bitmap();
        assert!(bitmap.white_to_black(obj, AccessMode::Atomic));
        assert!(bitmap.is_black(obj, AccessMode::Atomic));
        // A second caller performs neither transition.
        assert!(!bitmap.white_to_black(obj, AccessMode::Atomic));
    }

    #[test]
    fn black_to_grey_recovers_overflowed_objects() {
        let (bitmap, obj) = bitmap();
        bitmap.white_to_black(obj, AccessMode::Atomic);
        bitmap.black_to_grey(obj, AccessMode::Atomic);
        assert!(bitmap.is_grey(obj, AccessMode::Atomic));
    }

    #[test]
    fn adjacent_word_pairs_overlap_by_one_bit() {
        let (bitmap, obj) = bitmap();
        let next = ObjectReference::from_address(obj.to_address() + WORD_SIZE).unwrap();
        bitmap.white_to_black(obj, AccessMode::Atomic);
        // The second bit of `obj` is the first bit of `obj + one word`.
        assert!(bitmap.is_grey(next, AccessMode::Atomic));
    }

    #[test]
    fn non_atomic_mode_matches_atomic_semantics() {
        let (bitmap, obj) = bitmap();
        assert!(bitmap.white_to_grey(obj, AccessMode::NonAtomic));
        assert!(!bitmap.white_to_grey(obj, AccessMode::NonAtomic));
        assert!(bitmap.grey_to_black(obj, AccessMode::NonAtomic));
        assert!(bitmap.is_black(obj, AccessMode::NonAtomic));
    }

    #[test]
    fn clear_all_resets_to_white() {
        let (bitmap, obj) = bitmap();
        bitmap.white_to_black(obj, AccessMode::Atomic);
        bitmap.clear_all();
        assert!(bitmap.is_white(obj, AccessMode::Atomic));
    }
}
