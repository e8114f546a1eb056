//! Verification harness for [`Processor`] implementations.
//!
//! Drives a processor through its whole lifecycle on a single thread, checks the
//! progress rule after every call and compares the emitted items with the
//! expected output:
//!
//! ```ignore
//! ProcessorVerifier::from_fn(|| map(|s: &String| s.to_uppercase()))
//!     .expect_output(vec!["foo".into(), "bar".into()], vec!["FOO".into(), "BAR".into()])?;
//! ```
//!
//! With snapshots enabled, the processor's state is saved and restored into a
//! fresh instance before the first item, whenever the inbox empties and after
//! every `complete()` call. The output must not change because of it.

use crate::config::CooperativeTimeLimits;
use crate::error::ProtocolViolation;
use crate::processor::{
    Inbox, Outbox, Processor, ProcessorContext, ProcessorOutbox, ProcessorSupplier, UNBOUNDED,
};
use anyhow::{bail, Result};
use std::fmt::Debug;

/// Compares `(expected, actual)` output.
pub type OutputChecker<T> = Box<dyn Fn(&[T], &[T]) -> bool + Send>;

/// Output checker accepting any permutation of the expected items.
pub fn same_items_any_order<T: PartialEq>(expected: &[T], actual: &[T]) -> bool {
    if expected.len() != actual.len() {
        return false;
    }
    let mut matched = vec![false; actual.len()];
    expected.iter().all(|item| {
        let found = actual
            .iter()
            .enumerate()
            .position(|(i, candidate)| !matched[i] && candidate == item);
        match found {
            Some(i) => {
                matched[i] = true;
                true
            }
            None => false,
        }
    })
}

pub struct ProcessorVerifier<P: Processor> {
    supplier: ProcessorSupplier<P>,
    context: ProcessorContext,
    assert_progress: bool,
    do_snapshots: bool,
    log_input_output: bool,
    call_complete: bool,
    output_checker: OutputChecker<P::Out>,
    time_limits: CooperativeTimeLimits,
}

impl<P> ProcessorVerifier<P>
where
    P: Processor,
    P::In: Clone + Debug,
    P::Out: PartialEq + Debug,
{
    pub fn new(supplier: ProcessorSupplier<P>) -> Self {
        Self {
            supplier,
            context: ProcessorContext::default(),
            assert_progress: true,
            do_snapshots: true,
            log_input_output: false,
            call_complete: true,
            output_checker: Box::new(|expected: &[P::Out], actual: &[P::Out]| expected == actual),
            time_limits: CooperativeTimeLimits::default(),
        }
    }

    pub fn from_fn(f: impl FnMut() -> P + Send + 'static) -> Self {
        Self::new(ProcessorSupplier::from_fn(f))
    }

    /// Verify a single pre-built instance. Snapshot cycles need fresh instances
    /// and are therefore disabled.
    pub fn instance(processor: P) -> Self {
        Self::new(ProcessorSupplier::instance(processor))
    }

    /// Fail when a lifecycle call makes no progress. On by default.
    pub fn assert_progress(mut self, assert_progress: bool) -> Self {
        self.assert_progress = assert_progress;
        self
    }

    /// Run snapshot+restore cycles. On by default; the verification then also
    /// runs once without them.
    pub fn do_snapshots(mut self, do_snapshots: bool) -> Self {
        self.do_snapshots = do_snapshots;
        self
    }

    pub fn log_input_output(mut self, log_input_output: bool) -> Self {
        self.log_input_output = log_input_output;
        self
    }

    /// Whether to drive `complete()`. Turn off for streaming processors whose
    /// flushing code must not run.
    pub fn call_complete(mut self, call_complete: bool) -> Self {
        self.call_complete = call_complete;
        self
    }

    pub fn output_checker(
        mut self,
        checker: impl Fn(&[P::Out], &[P::Out]) -> bool + Send + 'static,
    ) -> Self {
        self.output_checker = Box::new(checker);
        self
    }

    pub fn time_limits(mut self, time_limits: CooperativeTimeLimits) -> Self {
        self.time_limits = time_limits;
        self
    }

    pub fn context(mut self, context: ProcessorContext) -> Self {
        self.context = context;
        self
    }

    /// Feed `input` to the processor on ordinal 0 and check what it emits.
    pub fn expect_output(mut self, input: Vec<P::In>, expected: Vec<P::Out>) -> Result<()> {
        let snapshots = self.do_snapshots && self.supplier.supports_snapshot_restore();
        if self.do_snapshots && !snapshots {
            tracing::info!("snapshot cycles disabled: only a single processor instance is available");
        }
        if snapshots {
            tracing::info!("running the verification without snapshots");
            self.verify(&input, &expected, false)?;
            tracing::info!("running the verification with snapshots");
        }
        self.verify(&input, &expected, snapshots)
    }

    fn verify(&mut self, input: &[P::In], expected: &[P::Out], snapshots: bool) -> Result<()> {
        let call_complete = self.call_complete;
        let mut run = Run::start(self, snapshots)?;
        run.snapshot_and_restore()?;
        run.process_all(input)?;
        if call_complete {
            run.complete()?;
        }
        let actual = run.into_output();
        if !(self.output_checker)(expected, &actual) {
            bail!(
                "processor output doesn't match\n  expected: {:?}\n  actual:   {:?}",
                expected,
                actual
            );
        }
        Ok(())
    }
}

/// One pass over the input with one processor slot, replaced on every restore.
struct Run<'a, P: Processor> {
    supplier: &'a mut ProcessorSupplier<P>,
    context: &'a ProcessorContext,
    processor: P,
    outbox: ProcessorOutbox<P>,
    actual: Vec<P::Out>,
    name: String,
    cooperative: bool,
    snapshots: bool,
    assert_progress: bool,
    log_input_output: bool,
    time_limits: CooperativeTimeLimits,
}

impl<'a, P> Run<'a, P>
where
    P: Processor,
    P::In: Clone + Debug,
    P::Out: Debug,
{
    fn start(verifier: &'a mut ProcessorVerifier<P>, snapshots: bool) -> Result<Self> {
        let mut processor = verifier.supplier.get()?;
        let cooperative = processor.is_cooperative();
        // A cooperative processor must cope with a full outbox at every call.
        let capacity = if cooperative { 1 } else { UNBOUNDED };
        let mut outbox = Outbox::with_capacity(1, capacity);
        processor.init(&mut outbox, &verifier.context)?;
        Ok(Self {
            name: verifier.context.instance_name(),
            supplier: &mut verifier.supplier,
            context: &verifier.context,
            processor,
            outbox,
            actual: Vec::new(),
            cooperative,
            snapshots,
            assert_progress: verifier.assert_progress,
            log_input_output: verifier.log_input_output,
            time_limits: verifier.time_limits,
        })
    }

    fn process_all(&mut self, input: &[P::In]) -> Result<()> {
        let mut inbox = Inbox::new();
        let mut items = input.iter().cloned();
        loop {
            if inbox.is_empty() {
                let Some(item) = items.next() else {
                    break;
                };
                if self.log_input_output {
                    tracing::info!("Input: {:?}", item);
                }
                inbox.add(item);
            }

            self.process(&mut inbox)?;
            self.check_progress("process", inbox.is_empty() || self.outbox.queue_len(0) > 0)?;
            if self.cooperative && !self.outbox.has_room(0) && !inbox.is_empty() {
                // Called again with the outbox full: must not emit nor lose the item.
                self.process(&mut inbox)?;
                self.check_progress("process", true)?;
            }
            self.drain_outbox();
            if inbox.is_empty() {
                self.snapshot_and_restore()?;
            }
        }
        Ok(())
    }

    fn process(&mut self, inbox: &mut Inbox<P::In>) -> Result<()> {
        self.time_limits.run(self.cooperative, "process", &self.name, || {
            self.processor.process(0, inbox, &mut self.outbox)
        })
    }

    fn complete(&mut self) -> Result<()> {
        loop {
            let done = self.time_limits.run(self.cooperative, "complete", &self.name, || {
                self.processor.complete(&mut self.outbox)
            })?;
            self.check_progress("complete", done || self.outbox.queue_len(0) > 0)?;
            self.drain_outbox();
            self.snapshot_and_restore()?;
            if done {
                return Ok(());
            }
        }
    }

    /// Save the state, replace the processor with a fresh instance and restore it.
    fn snapshot_and_restore(&mut self) -> Result<()> {
        if !self.snapshots {
            return Ok(());
        }

        let mut saved = Vec::new();
        self.outbox.begin_snapshot_cycle();
        loop {
            let done = self
                .time_limits
                .run(self.cooperative, "save_snapshot", &self.name, || {
                    self.processor.save_snapshot(&mut self.outbox)
                })?;
            if let Some(violation) = self.outbox.take_violation() {
                return Err(violation.into());
            }
            let progress =
                done || self.outbox.snapshot_len() > 0 || self.outbox.queue_len(0) > 0;
            saved.extend(self.outbox.drain_snapshot_queue());
            self.check_progress("save_snapshot", progress)?;
            self.drain_outbox();
            if done {
                break;
            }
        }

        self.processor = self.supplier.get()?;
        self.processor.init(&mut self.outbox, self.context)?;
        if saved.is_empty() {
            return Ok(());
        }

        let mut restored: Inbox<(P::Key, P::Value)> = saved.into_iter().collect();
        while !restored.is_empty() {
            let before = restored.len();
            self.time_limits
                .run(self.cooperative, "restore_snapshot", &self.name, || {
                    self.processor
                        .restore_snapshot(&mut restored, &mut self.outbox)
                })?;
            self.check_progress(
                "restore_snapshot",
                restored.len() < before || self.outbox.queue_len(0) > 0,
            )?;
            self.drain_outbox();
        }
        loop {
            let done = self.time_limits.run(
                self.cooperative,
                "finish_snapshot_restore",
                &self.name,
                || self.processor.finish_snapshot_restore(&mut self.outbox),
            )?;
            self.check_progress("finish_snapshot_restore", done || self.outbox.queue_len(0) > 0)?;
            self.drain_outbox();
            if done {
                return Ok(());
            }
        }
    }

    fn into_output(self) -> Vec<P::Out> {
        self.actual
    }

    /// Fails on a violation the outbox latched during the call, then on missing progress.
    fn check_progress(&mut self, call: &'static str, progress: bool) -> Result<()> {
        if let Some(violation) = self.outbox.take_violation() {
            return Err(violation.into());
        }
        if self.assert_progress && !progress {
            return Err(ProtocolViolation::MissingProgress { call }.into());
        }
        Ok(())
    }

    fn drain_outbox(&mut self) {
        while let Some(item) = self.outbox.pop_front(0) {
            if self.log_input_output {
                tracing::info!("Output: {:?}", item);
            }
            self.actual.push(item);
        }
    }
}

#[cfg(test)]
#[path = "tests/verifier_tests.rs"]
mod tests;
