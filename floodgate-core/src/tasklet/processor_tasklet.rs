use super::{ProgressState, Tasklet};
use crate::config::{CooperativeTimeLimits, EngineConfig};
use crate::conduit::{ConduitReceiver, ConduitSender, TrySend};
use crate::processor::{Inbox, Outbox, Processor, ProcessorContext, ProcessorOutbox, UNBOUNDED};
use crate::snapshot::{AlignOutcome, BarrierAligner, SnapshotContext, SnapshotWriter};
use crate::types::{SnapshotId, StreamElement, NO_SNAPSHOT};
use anyhow::{anyhow, bail, Result};
use std::collections::VecDeque;
use std::sync::Arc;

/// One output edge: the conduit plus control elements not yet accepted by it.
struct OutboundEdge<T> {
    sender: ConduitSender<T>,
    pending: VecDeque<StreamElement<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SnapshotPhase {
    /// Calling `save_snapshot` until done and moving the pairs to the writer.
    Save { processor_done: bool },
    EmitBarrier,
    BeginFlush,
    AwaitFlush,
}

/// Where to continue once the snapshot is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resume {
    Processing,
    Complete,
    FinalSnapshot,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Uninitialized,
    Restore,
    FinishRestore,
    Processing,
    Snapshot {
        snapshot_id: SnapshotId,
        phase: SnapshotPhase,
        emit_barrier: bool,
        resume: Resume,
    },
    Complete,
    FinalSnapshot,
    EmitEnd,
    ReportDone,
    Done,
}

impl From<Resume> for State {
    fn from(resume: Resume) -> Self {
        match resume {
            Resume::Processing => State::Processing,
            Resume::Complete => State::Complete,
            Resume::FinalSnapshot => State::FinalSnapshot,
            Resume::Done => State::Done,
        }
    }
}

/// Drives one [`Processor`] instance through its lifecycle.
///
/// Moves items from input conduits to the inbox, drains the outbox to output
/// conduits, aligns barriers, saves snapshots through a [`SnapshotWriter`] and
/// reports to the member's [`SnapshotContext`].
///
/// A tasklet without inputs is a source: it starts a snapshot when it sees the
/// context's current snapshot id move past its own, and injects the barrier.
pub struct ProcessorTasklet<P: Processor> {
    name: String,
    processor: P,
    context: ProcessorContext,
    cooperative: bool,
    higher_priority: bool,
    time_limits: CooperativeTimeLimits,
    inbox_batch_size: usize,

    inputs: Vec<ConduitReceiver<P::In>>,
    next_input: usize,
    inbox: Inbox<P::In>,
    inbox_ordinal: usize,
    outputs: Vec<OutboundEdge<P::Out>>,
    outbox: ProcessorOutbox<P>,

    snapshot_context: Arc<SnapshotContext>,
    snapshot_writer: Option<Box<dyn SnapshotWriter<P::Key, P::Value>>>,
    aligner: BarrierAligner,
    aligned_snapshot_id: Option<SnapshotId>,
    last_snapshot_id: SnapshotId,
    restore_inbox: Inbox<(P::Key, P::Value)>,

    state: State,
}

impl<P: Processor> ProcessorTasklet<P> {
    pub fn new(
        processor: P,
        context: ProcessorContext,
        inputs: Vec<ConduitReceiver<P::In>>,
        outputs: Vec<ConduitSender<P::Out>>,
        snapshot_context: Arc<SnapshotContext>,
        config: &EngineConfig,
    ) -> Self {
        let guarantee = snapshot_context.processing_guarantee();
        let context = context.with_guarantee(guarantee);
        let cooperative = processor.is_cooperative();
        // Non-cooperative processors run on their own thread and may emit freely.
        let capacity = if cooperative {
            config.outbox_capacity
        } else {
            UNBOUNDED
        };
        Self {
            name: context.instance_name(),
            processor,
            cooperative,
            higher_priority: false,
            time_limits: config.time_limits,
            inbox_batch_size: config.inbox_batch_size.max(1),
            aligner: BarrierAligner::new(inputs.len(), guarantee),
            next_input: 0,
            inbox: Inbox::new(),
            inbox_ordinal: 0,
            outbox: Outbox::with_capacity(outputs.len(), capacity),
            outputs: outputs
                .into_iter()
                .map(|sender| OutboundEdge {
                    sender,
                    pending: VecDeque::new(),
                })
                .collect(),
            inputs,
            context,
            snapshot_context,
            snapshot_writer: None,
            aligned_snapshot_id: None,
            last_snapshot_id: NO_SNAPSHOT,
            restore_inbox: Inbox::new(),
            state: State::Uninitialized,
        }
    }

    pub fn with_snapshot_writer(
        mut self,
        writer: impl SnapshotWriter<P::Key, P::Value> + 'static,
    ) -> Self {
        self.snapshot_writer = Some(Box::new(writer));
        self
    }

    /// Pairs to hand to `restore_snapshot` before any item is processed.
    pub fn with_restored_state(mut self, pairs: Vec<(P::Key, P::Value)>) -> Self {
        self.restore_inbox = pairs.into_iter().collect();
        self
    }

    /// Snapshots on the member wait until this tasklet is done.
    pub fn higher_priority(mut self) -> Self {
        self.higher_priority = true;
        self
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn last_snapshot_id(&self) -> SnapshotId {
        self.last_snapshot_id
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    fn is_source(&self) -> bool {
        self.inputs.is_empty()
    }

    fn restore_step(&mut self) -> Result<bool> {
        let pairs_before = self.restore_inbox.len();
        let data_before = self.outbox.data_len();
        self.time_limits.run(
            self.cooperative,
            "restore_snapshot",
            &self.name,
            || {
                self.processor
                    .restore_snapshot(&mut self.restore_inbox, &mut self.outbox)
            },
        )?;
        if self.restore_inbox.is_empty() {
            self.state = State::FinishRestore;
        }
        Ok(self.restore_inbox.len() < pairs_before || self.outbox.data_len() > data_before)
    }

    fn finish_restore_step(&mut self) -> Result<bool> {
        let data_before = self.outbox.data_len();
        let done = self.time_limits.run(
            self.cooperative,
            "finish_snapshot_restore",
            &self.name,
            || self.processor.finish_snapshot_restore(&mut self.outbox),
        )?;
        if done {
            tracing::debug!("{} restored its state", self.name);
            self.state = State::Processing;
        }
        Ok(done || self.outbox.data_len() > data_before)
    }

    fn processing_step(&mut self) -> Result<bool> {
        if self.is_source() {
            self.state = State::Complete;
            return Ok(true);
        }

        let mut progress = false;
        if self.inbox.is_empty() {
            if let Some(snapshot_id) = self.aligned_snapshot_id.take() {
                self.begin_snapshot(snapshot_id, true, Resume::Processing);
                return Ok(true);
            }
            progress |= self.fill_inbox()?;
        }
        if self.inbox.is_empty() {
            if let Some(snapshot_id) = self.aligned_snapshot_id.take() {
                self.begin_snapshot(snapshot_id, true, Resume::Processing);
                return Ok(true);
            }
            if self.aligner.all_ended() {
                self.state = State::Complete;
                return Ok(true);
            }
            return Ok(progress);
        }

        let items_before = self.inbox.len();
        let data_before = self.outbox.data_len();
        let ordinal = self.inbox_ordinal;
        self.time_limits.run(
            self.cooperative,
            "process",
            &self.name,
            || {
                self.processor
                    .process(ordinal, &mut self.inbox, &mut self.outbox)
            },
        )?;
        Ok(progress
            || self.inbox.len() < items_before
            || self.outbox.data_len() > data_before)
    }

    /// Fill the inbox from the next input that has items, round-robin.
    ///
    /// Stops at the first barrier or end marker of an input so the inbox only
    /// ever holds items of one ordinal that precede any barrier.
    fn fill_inbox(&mut self) -> Result<bool> {
        let num_inputs = self.inputs.len();
        let expected = self.last_snapshot_id + 1;
        let snapshotting = self.context.snapshotting_enabled();
        let mut progress = false;

        for step in 0..num_inputs {
            let ordinal = (self.next_input + step) % num_inputs;
            if self.aligner.is_ended(ordinal) || self.aligner.is_blocked(ordinal) {
                continue;
            }
            while self.inbox.len() < self.inbox_batch_size {
                let Some(element) = self.inputs[ordinal].try_recv()? else {
                    break;
                };
                progress = true;
                match element {
                    StreamElement::Record(item) => self.inbox.add(item),
                    StreamElement::Barrier(barrier) => {
                        if !snapshotting {
                            tracing::debug!(
                                "{} ignores barrier {} on input {}, snapshots are disabled",
                                self.name,
                                barrier.snapshot_id,
                                ordinal
                            );
                            continue;
                        }
                        if let AlignOutcome::Aligned(snapshot_id) =
                            self.aligner
                                .on_barrier(ordinal, barrier.snapshot_id, expected)?
                        {
                            self.aligned_snapshot_id = Some(snapshot_id);
                        }
                        break;
                    }
                    StreamElement::End => {
                        if let AlignOutcome::Aligned(snapshot_id) = self.aligner.on_end(ordinal)? {
                            self.aligned_snapshot_id = Some(snapshot_id);
                        }
                        break;
                    }
                }
            }
            if !self.inbox.is_empty() {
                self.inbox_ordinal = ordinal;
                self.next_input = (ordinal + 1) % num_inputs;
                break;
            }
            if self.aligned_snapshot_id.is_some() {
                break;
            }
        }
        Ok(progress)
    }

    fn begin_snapshot(&mut self, snapshot_id: SnapshotId, emit_barrier: bool, resume: Resume) {
        tracing::debug!("{} starts snapshot {}", self.name, snapshot_id);
        self.outbox.begin_snapshot_cycle();
        self.state = State::Snapshot {
            snapshot_id,
            phase: SnapshotPhase::Save {
                processor_done: false,
            },
            emit_barrier,
            resume,
        };
    }

    fn snapshot_step(
        &mut self,
        snapshot_id: SnapshotId,
        phase: SnapshotPhase,
        emit_barrier: bool,
        resume: Resume,
    ) -> Result<bool> {
        let next_phase = |phase| State::Snapshot {
            snapshot_id,
            phase,
            emit_barrier,
            resume,
        };

        match phase {
            SnapshotPhase::Save { processor_done } => {
                let mut progress = self.move_snapshot_pairs(snapshot_id)?;
                let mut done = processor_done;
                if !done {
                    let pairs_before = self.outbox.snapshot_len();
                    let data_before = self.outbox.data_len();
                    done = self.time_limits.run(
                        self.cooperative,
                        "save_snapshot",
                        &self.name,
                        || self.processor.save_snapshot(&mut self.outbox),
                    )?;
                    if let Some(violation) = self.outbox.take_violation() {
                        return Err(violation.into());
                    }
                    progress |= done
                        || self.outbox.snapshot_len() > pairs_before
                        || self.outbox.data_len() > data_before;
                    progress |= self.move_snapshot_pairs(snapshot_id)?;
                }
                self.state = if done && self.outbox.snapshot_len() == 0 {
                    if emit_barrier {
                        next_phase(SnapshotPhase::EmitBarrier)
                    } else {
                        next_phase(SnapshotPhase::BeginFlush)
                    }
                } else {
                    next_phase(SnapshotPhase::Save {
                        processor_done: done,
                    })
                };
                Ok(progress)
            }
            SnapshotPhase::EmitBarrier => {
                // Data emitted before the barrier must leave first.
                if self.outbox.data_len() > 0 {
                    return Ok(false);
                }
                for edge in &mut self.outputs {
                    edge.pending.push_back(StreamElement::barrier(snapshot_id));
                }
                self.state = next_phase(SnapshotPhase::BeginFlush);
                Ok(true)
            }
            SnapshotPhase::BeginFlush => {
                self.writer()?.begin_flush(snapshot_id)?;
                self.state = next_phase(SnapshotPhase::AwaitFlush);
                Ok(true)
            }
            SnapshotPhase::AwaitFlush => {
                if !self.writer()?.poll_flush()? {
                    return Ok(false);
                }
                self.last_snapshot_id = snapshot_id;
                self.aligner.reset();
                self.snapshot_context.snapshot_done_for_tasklet()?;
                tracing::debug!("{} finished snapshot {}", self.name, snapshot_id);
                if resume == Resume::Done && self.outbox.data_len() > 0 {
                    bail!(
                        "{} emitted {} items while saving snapshot {} after its outputs were closed",
                        self.name,
                        self.outbox.data_len(),
                        snapshot_id
                    );
                }
                self.state = resume.into();
                Ok(true)
            }
        }
    }

    fn move_snapshot_pairs(&mut self, snapshot_id: SnapshotId) -> Result<bool> {
        let writer = self
            .snapshot_writer
            .as_mut()
            .ok_or_else(|| anyhow!("{} has no snapshot writer", self.name))?;
        let mut moved = false;
        while writer.has_capacity() {
            let Some((key, value)) = self.outbox.pop_snapshot() else {
                break;
            };
            writer.write(snapshot_id, key, value)?;
            moved = true;
        }
        Ok(moved)
    }

    fn writer(&mut self) -> Result<&mut Box<dyn SnapshotWriter<P::Key, P::Value>>> {
        self.snapshot_writer
            .as_mut()
            .ok_or_else(|| anyhow!("{} has no snapshot writer", self.name))
    }

    /// A source snapshots whenever the member armed a snapshot it has not taken.
    fn armed_snapshot(&self) -> Option<SnapshotId> {
        if !self.is_source() || !self.context.snapshotting_enabled() {
            return None;
        }
        let current = self.snapshot_context.current_snapshot_id();
        (current > self.last_snapshot_id).then_some(current)
    }

    fn complete_step(&mut self) -> Result<bool> {
        if let Some(snapshot_id) = self.armed_snapshot() {
            self.begin_snapshot(snapshot_id, true, Resume::Complete);
            return Ok(true);
        }
        let data_before = self.outbox.data_len();
        let done = self.time_limits.run(
            self.cooperative,
            "complete",
            &self.name,
            || self.processor.complete(&mut self.outbox),
        )?;
        if done {
            self.state = State::FinalSnapshot;
        }
        Ok(done || self.outbox.data_len() > data_before)
    }

    fn final_snapshot_step(&mut self) -> Result<bool> {
        if let Some(snapshot_id) = self.armed_snapshot() {
            self.begin_snapshot(snapshot_id, true, Resume::FinalSnapshot);
            return Ok(true);
        }
        self.state = State::EmitEnd;
        Ok(true)
    }

    fn emit_end_step(&mut self) -> Result<bool> {
        if self.outbox.data_len() > 0 {
            return Ok(false);
        }
        for edge in &mut self.outputs {
            edge.pending.push_back(StreamElement::End);
        }
        self.state = State::ReportDone;
        Ok(true)
    }

    fn report_done_step(&mut self) -> Result<bool> {
        if self.outputs.iter().any(|edge| !edge.pending.is_empty()) {
            return Ok(false);
        }
        let owed = self
            .snapshot_context
            .tasklet_done(self.last_snapshot_id, self.higher_priority)?;
        match owed {
            Some(snapshot_id) => {
                // Outputs are closed; the snapshot is saved without a barrier.
                self.begin_snapshot(snapshot_id, false, Resume::Done);
            }
            None => {
                tracing::debug!("{} is done", self.name);
                self.state = State::Done;
            }
        }
        Ok(true)
    }

    /// Move pending control elements, then outbox items, into the output conduits.
    fn flush_outputs(&mut self) -> Result<bool> {
        let mut progress = false;
        for (ordinal, edge) in self.outputs.iter_mut().enumerate() {
            while let Some(element) = edge.pending.pop_front() {
                match edge.sender.try_send(element)? {
                    TrySend::Sent => progress = true,
                    TrySend::Full(element) => {
                        edge.pending.push_front(element);
                        break;
                    }
                }
            }
            if !edge.pending.is_empty() {
                continue;
            }
            while let Some(item) = self.outbox.pop_front(ordinal) {
                match edge.sender.try_send(StreamElement::Record(item))? {
                    TrySend::Sent => progress = true,
                    TrySend::Full(element) => {
                        if let StreamElement::Record(item) = element {
                            self.outbox.push_front(ordinal, item);
                        }
                        break;
                    }
                }
            }
        }
        Ok(progress)
    }
}

impl<P: Processor> Tasklet for ProcessorTasklet<P> {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    fn is_higher_priority(&self) -> bool {
        self.higher_priority
    }

    fn init(&mut self) -> Result<()> {
        if self.state != State::Uninitialized {
            bail!("{} initialized twice", self.name);
        }
        if self.context.snapshotting_enabled() && self.snapshot_writer.is_none() {
            bail!(
                "{} needs a snapshot writer for {} processing",
                self.name,
                self.context.processing_guarantee
            );
        }
        self.time_limits.run(
            self.cooperative,
            "init",
            &self.name,
            || self.processor.init(&mut self.outbox, &self.context),
        )?;
        self.state = if self.restore_inbox.is_empty() {
            State::Processing
        } else {
            State::Restore
        };
        tracing::debug!(
            "{} initialized with {} inputs and {} outputs",
            self.name,
            self.inputs.len(),
            self.outputs.len()
        );
        Ok(())
    }

    fn call(&mut self) -> Result<ProgressState> {
        let mut progress = self.flush_outputs()?;
        progress |= match self.state {
            State::Uninitialized => bail!("{} called before init", self.name),
            State::Restore => self.restore_step()?,
            State::FinishRestore => self.finish_restore_step()?,
            State::Processing => self.processing_step()?,
            State::Snapshot {
                snapshot_id,
                phase,
                emit_barrier,
                resume,
            } => self.snapshot_step(snapshot_id, phase, emit_barrier, resume)?,
            State::Complete => self.complete_step()?,
            State::FinalSnapshot => self.final_snapshot_step()?,
            State::EmitEnd => self.emit_end_step()?,
            State::ReportDone => self.report_done_step()?,
            State::Done => return Ok(ProgressState::Done),
        };
        if let Some(violation) = self.outbox.take_violation() {
            return Err(violation.into());
        }
        progress |= self.flush_outputs()?;
        if self.state == State::Done {
            return Ok(ProgressState::Done);
        }
        Ok(progress.into())
    }
}
