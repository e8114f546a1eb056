//! The processor execution contract.
//!
//! A processor moves through
//! `created → initialized → {processing ⇄ snapshotting} → completing → snapshotting(final) → terminated`.
//! Every lifecycle call made on a cooperative processor must return quickly and
//! must make progress: take from the inbox, put to the outbox, or report done.
//!
//! ```ignore
//! struct Upper;
//!
//! impl Processor for Upper {
//!     type In = String;
//!     type Out = String;
//!     type Key = ();
//!     type Value = ();
//!
//!     fn process(&mut self, _ordinal: usize, inbox: &mut Inbox<String>, outbox: &mut ProcessorOutbox<Self>) -> Result<()> {
//!         while let Some(item) = inbox.peek() {
//!             if !outbox.offer(0, item.to_uppercase()) {
//!                 break;
//!             }
//!             inbox.remove();
//!         }
//!         Ok(())
//!     }
//! }
//! ```

use crate::types::{ExecutionId, JobId, ProcessingGuarantee};
use anyhow::{anyhow, bail, Result};
use std::fmt::Debug;
use std::hash::Hash;

mod builtin;
mod inbox;
mod outbox;

pub use builtin::*;
pub use inbox::*;
pub use outbox::*;

/// The outbox type a processor `P` writes to.
pub type ProcessorOutbox<P> =
    Outbox<<P as Processor>::Out, <P as Processor>::Key, <P as Processor>::Value>;

/// A processing unit of the dataflow graph.
///
/// The engine never looks inside a processor; it only drives these calls, strictly
/// one at a time per instance.
pub trait Processor: Send {
    type In: Send;
    type Out: Send;
    /// Key of the processor's snapshot pairs; unique within one `save_snapshot` cycle.
    type Key: Eq + Hash + Clone + Debug + Send;
    type Value: Send;

    /// Cooperative processors share worker threads and get a time budget per call.
    /// Queried once, before `init`.
    fn is_cooperative(&self) -> bool {
        true
    }

    /// One-time setup, called once on a freshly constructed instance.
    fn init(&mut self, _outbox: &mut ProcessorOutbox<Self>, _ctx: &ProcessorContext) -> Result<()> {
        Ok(())
    }

    /// Handle items of the input edge `ordinal`.
    ///
    /// Items left in the inbox are offered again on the next call.
    fn process(
        &mut self,
        ordinal: usize,
        inbox: &mut Inbox<Self::In>,
        outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()>;

    /// Called after all inputs are exhausted, until it returns `true`.
    ///
    /// Sources do all their emission here.
    fn complete(&mut self, _outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        Ok(true)
    }

    /// Write state to the snapshot queue, until it returns `true`.
    fn save_snapshot(&mut self, _outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        Ok(true)
    }

    /// Consume snapshot pairs from `inbox`; called until the inbox is empty.
    fn restore_snapshot(
        &mut self,
        _inbox: &mut Inbox<(Self::Key, Self::Value)>,
        _outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        bail!("processor saved snapshot state but does not implement restore_snapshot()")
    }

    /// Called after all restored pairs were consumed, until it returns `true`.
    /// Skipped when nothing was restored.
    fn finish_snapshot_restore(&mut self, _outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        Ok(true)
    }
}

/// What a processor instance learns about its environment in `init`.
#[derive(Debug, Clone)]
pub struct ProcessorContext {
    pub job_id: JobId,
    pub execution_id: ExecutionId,
    pub vertex_name: String,
    /// Index of this instance among all instances of the vertex in the cluster.
    pub global_processor_index: usize,
    pub total_parallelism: usize,
    pub processing_guarantee: ProcessingGuarantee,
}

impl ProcessorContext {
    pub fn new(job_id: JobId, execution_id: ExecutionId, vertex_name: impl Into<String>) -> Self {
        Self {
            job_id,
            execution_id,
            vertex_name: vertex_name.into(),
            global_processor_index: 0,
            total_parallelism: 1,
            processing_guarantee: ProcessingGuarantee::None,
        }
    }

    pub fn with_index(mut self, global_processor_index: usize, total_parallelism: usize) -> Self {
        self.global_processor_index = global_processor_index;
        self.total_parallelism = total_parallelism;
        self
    }

    pub fn with_guarantee(mut self, processing_guarantee: ProcessingGuarantee) -> Self {
        self.processing_guarantee = processing_guarantee;
        self
    }

    pub fn snapshotting_enabled(&self) -> bool {
        self.processing_guarantee.snapshotting_enabled()
    }

    /// `vertex#index`, used to name tasklets and snapshot partitions.
    pub fn instance_name(&self) -> String {
        format!("{}#{}", self.vertex_name, self.global_processor_index)
    }
}

impl Default for ProcessorContext {
    fn default() -> Self {
        Self::new(JobId(0), ExecutionId(0), "test")
    }
}

/// How processor instances are obtained.
///
/// Restoring from a snapshot needs a fresh instance, so only a factory supports it.
pub enum ProcessorSupplier<P> {
    Factory(Box<dyn FnMut() -> P + Send>),
    Instance(Option<P>),
}

impl<P> ProcessorSupplier<P> {
    pub fn from_fn(f: impl FnMut() -> P + Send + 'static) -> Self {
        Self::Factory(Box::new(f))
    }

    pub fn instance(processor: P) -> Self {
        Self::Instance(Some(processor))
    }

    pub fn get(&mut self) -> Result<P> {
        match self {
            Self::Factory(f) => Ok(f()),
            Self::Instance(slot) => slot
                .take()
                .ok_or_else(|| anyhow!("single processor instance was already taken")),
        }
    }

    pub fn supports_snapshot_restore(&self) -> bool {
        matches!(self, Self::Factory(_))
    }
}

#[cfg(test)]
#[path = "tests/outbox_tests.rs"]
mod outbox_tests;

#[cfg(test)]
#[path = "tests/builtin_tests.rs"]
mod builtin_tests;
