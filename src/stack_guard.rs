//! Asynchronous GC completion requests.
//!
//! The marker cannot finish a cycle from inside a record-write context, so
//! completion is signalled here and picked up by the embedding loop at its
//! next interrupt check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};

pub struct StackGuard {
    gc_requested: AtomicBool,
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl StackGuard {
    pub fn new() -> Self {
        let (tx, rx) = flume::bounded(1);
        Self {
            gc_requested: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    /// Post an asynchronous GC request.
    pub fn request_gc(&self) {
        self.gc_requested.store(true, Ordering::Release);
        match self.tx.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => unreachable!("receiver lives as long as sender"),
        }
    }

    /// Rescind a pending request.
    pub fn clear_gc(&self) {
        self.gc_requested.store(false, Ordering::Release);
        while self.rx.try_recv().is_ok() {}
    }

    pub fn gc_requested(&self) -> bool {
        self.gc_requested.load(Ordering::Acquire)
    }

    /// Block until a request arrives or `timeout` passes.
    pub fn wait_for_request(&self, timeout: Duration) -> bool {
        if self.gc_requested() {
            return true;
        }
        self.rx.recv_timeout(timeout).is_ok()
    }
}

impl Default for StackGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_and_clear() {
        let guard = StackGuard::new();
        assert!(!guard.gc_requested());
        guard.request_gc();
        guard.request_gc();
        assert!(guard.gc_requested());
        assert!(guard.wait_for_request(Duration::from_millis(1)));
        guard.clear_gc();
        assert!(!guard.gc_requested());
        assert!(!guard.wait_for_request(Duration::from_millis(1)));
    }
}
