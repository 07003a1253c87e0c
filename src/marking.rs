//! Tri-color marking primitives: mark bitmap, worklist, and object visitor.

pub mod bitmap;
pub mod visitor;
pub mod worklist;

pub use bitmap::{AccessMode, Color, MarkBitmap};
pub use visitor::{MarkingVisitor, ScanOutcome, PROGRESS_BAR_SCANNING_CHUNK};
pub use worklist::MarkingWorklist;
