//! Fixtures shared by the integration tests.

use std::sync::Arc;

use crate::config::MarkingConfig;
use crate::controller::{
    CompletionAction, ForceCompletionAction, GcRequestType, IncrementalMarking, StepOrigin,
};
use crate::embedder::{EmbedderTracer, NoopEmbedderTracer};
use crate::heap::{Heap, HeapConfig, InstanceKind, SpaceId};
use crate::types::ObjectReference;

/// A deterministic, single-threaded configuration for tests; concurrency
/// is opted into per test.
pub fn test_config() -> MarkingConfig {
    MarkingConfig {
        concurrent_marking: false,
        marker_threads: 1,
        trace_incremental_marking: false,
        ..MarkingConfig::default()
    }
}

/// Heap plus controller plus the common maps tests allocate with.
pub struct TestFixture {
    pub heap: Arc<Heap>,
    pub marking: Arc<IncrementalMarking>,
    pub plain_map: ObjectReference,
    pub array_map: ObjectReference,
}

impl TestFixture {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: MarkingConfig) -> Self {
        Self::with_config_and_embedder(config, Arc::new(NoopEmbedderTracer))
    }

    pub fn with_config_and_embedder(
        config: MarkingConfig,
        embedder: Arc<dyn EmbedderTracer>,
    ) -> Self {
        let heap = Heap::new(HeapConfig::default());
        let marking = IncrementalMarking::new(&heap, config, embedder);
        let plain_map = heap.new_map(InstanceKind::Plain).expect("map space full");
        let array_map = heap
            .new_map(InstanceKind::FixedArray)
            .expect("map space full");
        Self {
            heap,
            marking,
            plain_map,
            array_map,
        }
    }

    /// Allocate a plain object with `fields` pointer slots.
    pub fn new_plain(&self, space: SpaceId, fields: usize) -> ObjectReference {
        self.heap
            .allocate_plain(space, self.plain_map, fields)
            .expect("allocation failed")
    }

    /// Store `value` into `host.field` and run the write barrier, the way
    /// mutator code does it.
    pub fn write_with_barrier(
        &self,
        host: ObjectReference,
        index: usize,
        value: ObjectReference,
    ) {
        self.heap.write_field(host, index, Some(value));
        let slot = self.heap.slot_address(host, index);
        self.marking.record_write(host, Some(slot), Some(value));
    }

    /// Step with an effectively unbounded budget until the cycle reaches
    /// `Complete`, servicing finalization requests like the embedding loop
    /// would. Panics if the cycle fails to converge.
    pub fn drive_to_completion(&self) {
        for _ in 0..64 {
            if self.marking.is_complete() {
                return;
            }
            self.marking.step(
                usize::MAX / 2,
                CompletionAction::GcViaStackGuard,
                ForceCompletionAction::ForceCompletion,
                StepOrigin::Mutator,
            );
            if self.marking.request_type() == GcRequestType::Finalization {
                self.marking.clear_request();
                self.marking.finalize_incrementally();
            }
        }
        panic!("marking did not reach Complete");
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}
