use super::SnapshotCompletion;
use crate::error::ProtocolViolation;
use crate::types::{format_ids, ExecutionId, JobId, ProcessingGuarantee, SnapshotId, NO_SNAPSHOT};
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;

/// Fields that change together; guarded by one lock.
#[derive(Debug)]
struct CoordinationState {
    /// Tasklets of this member that have not finished the job. `None` until set.
    num_tasklets: Option<usize>,
    /// Higher-priority tasklets that have not finished; snapshots wait for zero.
    num_higher_priority_tasklets: usize,
    /// Id of the last "start snapshot" command accepted, armed or not.
    last_requested_snapshot_id: SnapshotId,
    /// Requested snapshot waiting for the higher-priority tasklets to drain.
    postponed_snapshot_id: Option<SnapshotId>,
    completion: Option<(SnapshotId, oneshot::Sender<SnapshotId>)>,
}

/// Snapshot bookkeeping of one job execution attempt on one member.
///
/// The external coordinator calls [`SnapshotContext::start_new_snapshot`]; tasklets
/// poll [`SnapshotContext::current_snapshot_id`] lock-free, report each flushed
/// snapshot with [`SnapshotContext::snapshot_done_for_tasklet`] and report the
/// end of the job with [`SnapshotContext::tasklet_done`].
///
/// ```text
///            start_new_snapshot(id)
///   Idle ─────────────────────────────► Armed ──(last snapshot_done)──► Idle
///     │                                   ▲
///     │ higher-priority tasklets active   │ last higher-priority tasklet_done
///     └──────────────► Postponed ─────────┘
/// ```
#[derive(Debug)]
pub struct SnapshotContext {
    job_id: JobId,
    execution_id: ExecutionId,
    guarantee: ProcessingGuarantee,
    /// Armed snapshot id. Monotonic, so tasklets may read it without the lock.
    current_snapshot_id: AtomicI64,
    /// Tasklets still owing a report for the in-flight snapshot.
    num_remaining_tasklets: AtomicUsize,
    state: Mutex<CoordinationState>,
}

impl SnapshotContext {
    pub fn new(job_id: JobId, execution_id: ExecutionId, guarantee: ProcessingGuarantee) -> Self {
        Self {
            job_id,
            execution_id,
            guarantee,
            current_snapshot_id: AtomicI64::new(NO_SNAPSHOT),
            num_remaining_tasklets: AtomicUsize::new(0),
            state: Mutex::new(CoordinationState {
                num_tasklets: None,
                num_higher_priority_tasklets: 0,
                last_requested_snapshot_id: NO_SNAPSHOT,
                postponed_snapshot_id: None,
                completion: None,
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    pub fn processing_guarantee(&self) -> ProcessingGuarantee {
        self.guarantee
    }

    /// Id of the armed snapshot; source tasklets start snapshotting when it changes.
    pub fn current_snapshot_id(&self) -> SnapshotId {
        self.current_snapshot_id.load(Ordering::Acquire)
    }

    pub fn num_remaining_tasklets(&self) -> usize {
        self.num_remaining_tasklets.load(Ordering::Acquire)
    }

    pub fn num_tasklets(&self) -> Result<Option<usize>> {
        Ok(self.lock()?.num_tasklets)
    }

    pub fn num_higher_priority_tasklets(&self) -> Result<usize> {
        Ok(self.lock()?.num_higher_priority_tasklets)
    }

    pub fn postponed_snapshot_id(&self) -> Result<Option<SnapshotId>> {
        Ok(self.lock()?.postponed_snapshot_id)
    }

    /// Register the member's tasklets. Must be called exactly once, before any snapshot.
    pub fn init_tasklet_count(&self, total: usize, higher_priority: usize) -> Result<()> {
        let mut state = self.lock()?;
        if state.num_tasklets.is_some() {
            return Err(ProtocolViolation::TaskletCountAlreadySet.into());
        }
        if total == 0 || higher_priority > total {
            return Err(ProtocolViolation::InvalidTaskletCount {
                total,
                higher_priority,
            }
            .into());
        }
        state.num_tasklets = Some(total);
        state.num_higher_priority_tasklets = higher_priority;
        Ok(())
    }

    /// The member received the command to start snapshot `snapshot_id`.
    ///
    /// Ids must arrive in steps of one and a snapshot may only start after the
    /// previous one resolved. The snapshot is armed right away unless
    /// higher-priority tasklets are still running, in which case it is postponed
    /// until the last of them finishes.
    pub fn start_new_snapshot(&self, snapshot_id: SnapshotId) -> Result<SnapshotCompletion> {
        let mut state = self.lock()?;
        let num_tasklets = state
            .num_tasklets
            .ok_or(ProtocolViolation::TaskletCountNotInitialized)?;
        if snapshot_id != state.last_requested_snapshot_id + 1 {
            return Err(ProtocolViolation::SnapshotIdOutOfOrder {
                previous: state.last_requested_snapshot_id,
                requested: snapshot_id,
            }
            .into());
        }

        // Also covers a finished member whose last tasklet still owes the
        // snapshot it armed in `tasklet_done`.
        if let Some((in_flight, _)) = &state.completion {
            return Err(ProtocolViolation::OverlappingSnapshot {
                in_flight: *in_flight,
                remaining: self.num_remaining_tasklets(),
            }
            .into());
        }

        if num_tasklets == 0 {
            // The member finished the job before the coordinator knew; nothing to do.
            state.last_requested_snapshot_id = snapshot_id;
            self.current_snapshot_id
                .store(snapshot_id, Ordering::Release);
            tracing::debug!(
                "snapshot {} for {} completed immediately, all tasklets are done",
                snapshot_id,
                format_ids(self.job_id, self.execution_id)
            );
            return Ok(SnapshotCompletion::resolved(snapshot_id));
        }

        self.num_remaining_tasklets
            .compare_exchange(0, num_tasklets, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|remaining| ProtocolViolation::OverlappingSnapshot {
                in_flight: state.last_requested_snapshot_id,
                remaining,
            })?;

        state.last_requested_snapshot_id = snapshot_id;
        let (sender, completion) = SnapshotCompletion::channel(snapshot_id);
        state.completion = Some((snapshot_id, sender));

        if state.num_higher_priority_tasklets == 0 {
            self.current_snapshot_id
                .store(snapshot_id, Ordering::Release);
            tracing::debug!(
                "snapshot {} for {} started on {} tasklets",
                snapshot_id,
                format_ids(self.job_id, self.execution_id),
                num_tasklets
            );
        } else {
            state.postponed_snapshot_id = Some(snapshot_id);
            tracing::warn!(
                "Snapshot {} for {} is postponed until all higher priority vertices are completed (number of vertices = {})",
                snapshot_id,
                format_ids(self.job_id, self.execution_id),
                state.num_higher_priority_tasklets
            );
        }
        Ok(completion)
    }

    /// A tasklet finished the whole job.
    ///
    /// `last_snapshot_id` is the last snapshot the tasklet reported. A tasklet that
    /// will never report the in-flight snapshot is counted as done for it. When
    /// the last higher-priority tasklet finishes, the postponed snapshot is armed
    /// and its id returned: that tasklet still takes part in it and must report
    /// it with [`SnapshotContext::snapshot_done_for_tasklet`].
    pub fn tasklet_done(
        &self,
        last_snapshot_id: SnapshotId,
        is_higher_priority: bool,
    ) -> Result<Option<SnapshotId>> {
        let mut state = self.lock()?;
        let num_tasklets = state
            .num_tasklets
            .ok_or(ProtocolViolation::TaskletCountNotInitialized)?;
        if num_tasklets == 0 {
            return Err(ProtocolViolation::TaskletCountUnderflow.into());
        }
        let current = self.current_snapshot_id();
        if last_snapshot_id > current {
            return Err(ProtocolViolation::TaskletAheadOfSnapshot {
                last: last_snapshot_id,
                current,
            }
            .into());
        }
        if is_higher_priority && state.num_higher_priority_tasklets == 0 {
            return Err(ProtocolViolation::HigherPriorityUnderflow.into());
        }

        state.num_tasklets = Some(num_tasklets - 1);
        let postponed_on_entry = state.postponed_snapshot_id;
        let mut armed = None;
        if is_higher_priority {
            state.num_higher_priority_tasklets -= 1;
            if state.num_higher_priority_tasklets == 0 {
                if let Some(snapshot_id) = state.postponed_snapshot_id.take() {
                    self.current_snapshot_id
                        .store(snapshot_id, Ordering::Release);
                    tracing::info!(
                        "Postponed snapshot {} for {} started",
                        snapshot_id,
                        format_ids(self.job_id, self.execution_id)
                    );
                    armed = Some(snapshot_id);
                }
            }
        }

        let never_reports = match postponed_on_entry {
            Some(_) => armed.is_none(),
            None => last_snapshot_id < current && self.num_remaining_tasklets() > 0,
        };
        drop(state);

        if never_reports {
            self.snapshot_done_for_tasklet()?;
        }
        Ok(armed)
    }

    /// A tasklet flushed its part of the in-flight snapshot.
    ///
    /// The report that brings the remaining count to zero resolves the completion
    /// handle; the lock is not held while resolving.
    pub fn snapshot_done_for_tasklet(&self) -> Result<()> {
        let previous = self
            .num_remaining_tasklets
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| ProtocolViolation::NoSnapshotInProgress)?;
        if previous != 1 {
            return Ok(());
        }

        let completion = self.lock()?.completion.take();
        let (snapshot_id, sender) = completion.ok_or(ProtocolViolation::CompletionAlreadyResolved {
            snapshot_id: self.current_snapshot_id(),
        })?;
        tracing::debug!(
            "snapshot {} for {} done on this member",
            snapshot_id,
            format_ids(self.job_id, self.execution_id)
        );
        // A coordinator that dropped its handle is not interested in the outcome.
        let _ = sender.send(snapshot_id);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, CoordinationState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("snapshot context lock poisoned"))
    }
}
