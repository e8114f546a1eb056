use crate::error::ProtocolViolation;
use crate::types::{ProcessingGuarantee, SnapshotId};
use anyhow::{anyhow, Result};

/// Barrier alignment result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignOutcome {
    /// Still waiting for the barrier on some inputs.
    Pending,
    /// Every input delivered the barrier or ended: the snapshot can be taken.
    Aligned(SnapshotId),
}

/// Barrier bookkeeping for a tasklet with one or more inputs.
///
/// With exactly-once, an input that delivered the barrier is blocked until all
/// inputs delivered it, so no post-barrier item is processed before the snapshot.
/// With at-least-once inputs are never blocked. Ended inputs count as aligned.
#[derive(Debug)]
pub struct BarrierAligner {
    guarantee: ProcessingGuarantee,
    current: Option<SnapshotId>,
    barriers_received: Vec<bool>,
    ended: Vec<bool>,
}

impl BarrierAligner {
    pub fn new(num_inputs: usize, guarantee: ProcessingGuarantee) -> Self {
        Self {
            guarantee,
            current: None,
            barriers_received: vec![false; num_inputs],
            ended: vec![false; num_inputs],
        }
    }

    pub fn num_inputs(&self) -> usize {
        self.ended.len()
    }

    /// Snapshot id being aligned, if any input already delivered its barrier.
    pub fn current(&self) -> Option<SnapshotId> {
        self.current
    }

    pub fn is_ended(&self, ordinal: usize) -> bool {
        self.ended.get(ordinal).copied().unwrap_or(true)
    }

    pub fn all_ended(&self) -> bool {
        self.ended.iter().all(|e| *e)
    }

    /// Whether items of `ordinal` must not be read right now.
    pub fn is_blocked(&self, ordinal: usize) -> bool {
        self.guarantee == ProcessingGuarantee::ExactlyOnce
            && self.current.is_some()
            && self.barriers_received.get(ordinal).copied().unwrap_or(false)
    }

    /// A barrier arrived on `ordinal`.
    ///
    /// `expected` is the only snapshot id the tasklet may see next.
    pub fn on_barrier(
        &mut self,
        ordinal: usize,
        snapshot_id: SnapshotId,
        expected: SnapshotId,
    ) -> Result<AlignOutcome> {
        self.check_ordinal(ordinal)?;
        if snapshot_id != expected || self.current.is_some_and(|c| c != snapshot_id) {
            return Err(ProtocolViolation::UnexpectedBarrier {
                ordinal,
                expected,
                received: snapshot_id,
            }
            .into());
        }
        if self.barriers_received[ordinal] {
            return Err(ProtocolViolation::DuplicateBarrier {
                ordinal,
                snapshot_id,
            }
            .into());
        }
        self.current = Some(snapshot_id);
        self.barriers_received[ordinal] = true;
        Ok(self.outcome())
    }

    /// The input `ordinal` delivered its end marker.
    pub fn on_end(&mut self, ordinal: usize) -> Result<AlignOutcome> {
        self.check_ordinal(ordinal)?;
        self.ended[ordinal] = true;
        Ok(self.outcome())
    }

    /// The aligned snapshot was taken; unblock every input.
    pub fn reset(&mut self) {
        self.current = None;
        self.barriers_received.fill(false);
    }

    fn outcome(&self) -> AlignOutcome {
        match self.current {
            Some(id)
                if self
                    .barriers_received
                    .iter()
                    .zip(&self.ended)
                    .all(|(received, ended)| *received || *ended) =>
            {
                AlignOutcome::Aligned(id)
            }
            _ => AlignOutcome::Pending,
        }
    }

    fn check_ordinal(&self, ordinal: usize) -> Result<()> {
        if ordinal >= self.num_inputs() {
            return Err(anyhow!("input ordinal {} out of bounds", ordinal));
        }
        Ok(())
    }
}
