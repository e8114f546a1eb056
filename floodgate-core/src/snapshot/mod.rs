//! Distributed snapshot coordination on one member.
//!
//! - [`SnapshotContext`]: per-execution bookkeeping of which tasklets still owe a snapshot.
//! - [`SnapshotCompletion`]: single-resolution handle returned to the coordinator.
//! - [`BarrierAligner`]: barrier alignment for tasklets with inputs.
//! - [`SnapshotWriter`] / [`InMemorySnapshotStore`]: where snapshot pairs go.

mod aligner;
mod completion;
mod context;
mod store;

pub use aligner::*;
pub use completion::*;
pub use context::*;
pub use store::*;

#[cfg(test)]
#[path = "tests/context_tests.rs"]
mod context_tests;

#[cfg(test)]
#[path = "tests/aligner_tests.rs"]
mod aligner_tests;

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod store_tests;
