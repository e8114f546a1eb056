use super::{ExecutionHandle, ExecutionService};
use crate::snapshot::{SnapshotCompletion, SnapshotContext};
use crate::tasklet::Tasklet;
use crate::types::{format_ids, ExecutionId, JobId, ProcessingGuarantee, SnapshotId};
use anyhow::{anyhow, bail, Result};
use std::sync::Arc;

/// One execution attempt of a job on this member.
///
/// Build the tasklets with [`JobExecution::snapshot_context`], hand them to
/// [`JobExecution::start`], then drive snapshots with
/// [`JobExecution::start_snapshot`] as the coordinator requests them.
pub struct JobExecution {
    snapshot_context: Arc<SnapshotContext>,
    handle: Option<ExecutionHandle>,
}

impl JobExecution {
    pub fn new(job_id: JobId, execution_id: ExecutionId, guarantee: ProcessingGuarantee) -> Self {
        Self {
            snapshot_context: Arc::new(SnapshotContext::new(job_id, execution_id, guarantee)),
            handle: None,
        }
    }

    pub fn snapshot_context(&self) -> Arc<SnapshotContext> {
        self.snapshot_context.clone()
    }

    pub fn job_id(&self) -> JobId {
        self.snapshot_context.job_id()
    }

    pub fn execution_id(&self) -> ExecutionId {
        self.snapshot_context.execution_id()
    }

    /// Register the tasklets with the snapshot context and start running them.
    pub fn start(&mut self, service: &ExecutionService, tasklets: Vec<Box<dyn Tasklet>>) -> Result<()> {
        if self.handle.is_some() {
            bail!("{} already started", self.describe());
        }
        let total = tasklets.len();
        let higher_priority = tasklets.iter().filter(|t| t.is_higher_priority()).count();
        self.snapshot_context
            .init_tasklet_count(total, higher_priority)?;
        tracing::info!(
            "starting {} with {} tasklets ({} higher priority), guarantee {}",
            self.describe(),
            total,
            higher_priority,
            self.snapshot_context.processing_guarantee()
        );
        let name = format!("job-{}", self.job_id());
        self.handle = Some(service.submit(&name, tasklets)?);
        Ok(())
    }

    /// The coordinator asks this member to take snapshot `snapshot_id`.
    pub fn start_snapshot(&self, snapshot_id: SnapshotId) -> Result<SnapshotCompletion> {
        if !self
            .snapshot_context
            .processing_guarantee()
            .snapshotting_enabled()
        {
            bail!("snapshots are disabled for {}", self.describe());
        }
        self.snapshot_context.start_new_snapshot(snapshot_id)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_some_and(ExecutionHandle::is_finished)
    }

    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.cancel();
        }
    }

    /// Wait until every tasklet finished.
    pub fn join(self) -> Result<()> {
        let description = self.describe();
        let handle = self
            .handle
            .ok_or_else(|| anyhow!("{description} was never started"))?;
        handle.join()?;
        tracing::info!("{} completed", description);
        Ok(())
    }

    fn describe(&self) -> String {
        format_ids(self.job_id(), self.execution_id())
    }
}
