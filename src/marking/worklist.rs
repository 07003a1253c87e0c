//! Shared worklist of grey objects awaiting scanning.

use std::sync::Arc;

use crossbeam::queue::{ArrayQueue, SegQueue};

use crate::types::ObjectReference;

/// Producer/consumer queue of grey objects, shared between the mutator-side
/// marker and background workers.
///
/// Two sub-queues: a bounded deque for ordinary marking work and an
/// unbounded bailout stack for objects that must be re-delivered to the main
/// marker (partial large-object scans, work handed back by cancelled
/// workers). `pop` drains the bailout stack first. Ordering is otherwise
/// unspecified and duplicates are permitted; the visit path filters them by
/// color.
///
/// Handles are cheap clones of one shared queue.
///
/// # Examples
///
/// ```
/// use greymark::marking::MarkingWorklist;
/// use greymark::types::ObjectReference;
///
/// let worklist = MarkingWorklist::new(16);
/// let a = ObjectReference::from_raw(0x1000_0010).unwrap();
/// let b = ObjectReference::from_raw(0x1000_0020).unwrap();
///
/// assert!(worklist.push(a));
/// worklist.push_bailout(b);
///
/// // Bailout entries are re-delivered first.
/// assert_eq!(worklist.pop(), Some(b));
/// assert_eq!(worklist.pop(), Some(a));
/// assert!(worklist.is_empty());
/// ```
#[derive(Clone)]
pub struct MarkingWorklist {
    inner: Arc<Inner>,
}

struct Inner {
    shared: ArrayQueue<ObjectReference>,
    bailout: SegQueue<ObjectReference>,
}

impl MarkingWorklist {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                shared: ArrayQueue::new(capacity),
                bailout: SegQueue::new(),
            }),
        }
    }

    /// Append a grey object. Returns false when the deque is full; the
    /// caller is expected to fall back (black-to-grey, or in-place scan).
    pub fn push(&self, object: ObjectReference) -> bool {
        self.inner.shared.push(object).is_ok()
    }

    /// Hand an object back to the main marker. Never fails; used by
    /// concurrent workers that cannot finish scanning an object.
    pub fn push_bailout(&self, object: ObjectReference) {
        self.inner.bailout.push(object);
    }

    /// Remove some grey (or formerly grey) object, bailout entries first.
    pub fn pop(&self) -> Option<ObjectReference> {
        self.inner
            .bailout
            .pop()
            .or_else(|| self.inner.shared.pop())
    }

    /// Remove an entry from the shared deque only. Background workers use
    /// this so bailout entries are re-delivered to the main marker alone.
    pub fn pop_shared(&self) -> Option<ObjectReference> {
        self.inner.shared.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.bailout.is_empty() && self.inner.shared.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.shared.is_full()
    }

    pub fn len(&self) -> usize {
        self.inner.bailout.len() + self.inner.shared.len()
    }

    /// Rewrite every entry through `f`: `Some(new)` keeps (possibly
    /// redirected), `None` drops. Runs after a scavenge has moved objects.
    ///
    /// Not safe to run concurrently with producers or consumers; the caller
    /// holds both sides quiescent (scavenging stops marking work).
    pub fn update<F>(&self, mut f: F)
    where
        F: FnMut(ObjectReference) -> Option<ObjectReference>,
    {
        let mut kept_bailout = Vec::new();
        while let Some(object) = self.inner.bailout.pop() {
            if let Some(updated) = f(object) {
                kept_bailout.push(updated);
            }
        }
        for object in kept_bailout {
            self.inner.bailout.push(object);
        }

        let mut kept_shared = Vec::new();
        while let Some(object) = self.inner.shared.pop() {
            if let Some(updated) = f(object) {
                kept_shared.push(updated);
            }
        }
        for object in kept_shared {
            // The deque cannot be fuller than before the drain.
            let _ = self.inner.shared.push(object);
        }
    }

    /// Reset per-cycle state before a new marking cycle.
    pub fn start_using(&self) {
        while self.inner.bailout.pop().is_some() {}
        while self.inner.shared.pop().is_some() {}
    }
}
