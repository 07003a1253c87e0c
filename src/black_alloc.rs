//! Black allocation: new old-generation objects are born black while a
//! marking cycle is far enough along, so the barrier never has to intercept
//! stores into them.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::marking::{AccessMode, MarkBitmap};
use crate::types::ObjectReference;

pub struct BlackAllocator {
    bitmap: Arc<MarkBitmap>,
    active: AtomicBool,
    objects_allocated_black: AtomicUsize,
}

impl BlackAllocator {
    pub fn new(bitmap: &Arc<MarkBitmap>) -> Self {
        Self {
            bitmap: Arc::clone(bitmap),
            active: AtomicBool::new(false),
            objects_allocated_black: AtomicUsize::new(0),
        }
    }

    pub fn activate(&self) {
        self.active.store(true, Ordering::SeqCst);
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Mark a newly allocated object black. Called from old-generation
    /// allocation paths; no-op while inactive, so objects start white.
    pub fn allocate_black(&self, object: ObjectReference) {
        if !self.is_active() {
            return;
        }
        self.bitmap.white_to_black(object, AccessMode::Atomic);
        self.objects_allocated_black.fetch_add(1, Ordering::Relaxed);
    }

    pub fn objects_allocated_black(&self) -> usize {
        self.objects_allocated_black.load(Ordering::Relaxed)
    }

    /// Reset for a new cycle.
    pub fn reset(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.objects_allocated_black.store(0, Ordering::Relaxed);
    }
}
