//! greymark — the incremental mark phase of a tri-color, mostly-concurrent
//! garbage collector.
//!
//! The crate centers on [`controller::IncrementalMarking`]: the tri-color
//! state machine, the write-barrier contract, the step scheduler, black
//! allocation, the finalization handshake with the scavenger, and the
//! post-scavenge worklist rewrite. The [`heap`] module provides the object,
//! page, and space model the controller is exercised against; the real
//! allocator, compactor, and scavenger are peers behind narrow interfaces.

pub mod barrier;
pub mod black_alloc;
pub mod compactor;
pub mod concurrent;
pub mod config;
pub mod controller;
pub mod embedder;
pub mod error;
pub mod heap;
pub mod marking;
pub mod stack_guard;
pub mod stats;
pub mod test_support;
pub mod types;

pub use barrier::{RecordWriteStub, StubMode};
pub use black_alloc::BlackAllocator;
pub use compactor::{CompactingCollector, RelocInfo};
pub use concurrent::ConcurrentMarker;
pub use config::MarkingConfig;
pub use controller::{
    CompletionAction, ForceCompletionAction, GcReason, GcRequestType, IncrementalMarking,
    MarkingState, StepOrigin,
};
pub use embedder::{EmbedderTracer, NoopEmbedderTracer};
pub use error::{GcError, GcResult};
pub use heap::{Heap, HeapConfig, InstanceKind, PageFlags, SpaceId};
pub use marking::{AccessMode, Color, MarkBitmap, MarkingWorklist};
pub use stack_guard::StackGuard;
pub use stats::MarkingStats;
pub use types::{Address, ObjectReference};
