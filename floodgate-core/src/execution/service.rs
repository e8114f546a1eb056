use crate::config::{EngineConfig, IdleConfig};
use crate::tasklet::{ProgressState, Tasklet};
use anyhow::{anyhow, Context, Result};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// A worker stopped because the execution was cancelled, not because it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution cancelled")]
pub struct ExecutionCancelled;

/// Runs tasklets on worker threads.
///
/// Cooperative tasklets are spread round-robin over a fixed number of worker
/// threads, each calling its tasklets in turn. Non-cooperative tasklets get a
/// thread each. A worker whose full pass made no progress parks with
/// exponential back-off (see [`IdleConfig`]).
#[derive(Debug, Clone, Default)]
pub struct ExecutionService {
    config: EngineConfig,
}

impl ExecutionService {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start running `tasklets`. The first tasklet error cancels every worker.
    pub fn submit(&self, name: &str, tasklets: Vec<Box<dyn Tasklet>>) -> Result<ExecutionHandle> {
        let (cooperative, dedicated): (Vec<_>, Vec<_>) =
            tasklets.into_iter().partition(|t| t.is_cooperative());

        let worker_count = self.config.cooperative_thread_count.max(1).min(cooperative.len());
        let mut groups: Vec<Vec<Box<dyn Tasklet>>> = (0..worker_count).map(|_| Vec::new()).collect();
        for (i, tasklet) in cooperative.into_iter().enumerate() {
            groups[i % worker_count].push(tasklet);
        }

        tracing::info!(
            "{}: starting {} cooperative worker(s) and {} dedicated thread(s)",
            name,
            worker_count,
            dedicated.len()
        );

        let cancelled = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(worker_count + dedicated.len());
        for (i, group) in groups.into_iter().enumerate() {
            threads.push(spawn_worker(
                format!("{name}-coop-{i}"),
                group,
                cancelled.clone(),
                self.config.idle,
            )?);
        }
        for tasklet in dedicated {
            let thread_name = format!("{name}-{}", tasklet.name());
            threads.push(spawn_worker(
                thread_name,
                vec![tasklet],
                cancelled.clone(),
                self.config.idle,
            )?);
        }

        Ok(ExecutionHandle {
            name: name.to_string(),
            threads,
            cancelled,
        })
    }
}

fn spawn_worker(
    thread_name: String,
    tasklets: Vec<Box<dyn Tasklet>>,
    cancelled: Arc<AtomicBool>,
    idle: IdleConfig,
) -> Result<JoinHandle<Result<()>>> {
    let worker_name = thread_name.clone();
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                run_worker(tasklets, &cancelled, idle)
            }))
            .unwrap_or_else(|_| Err(anyhow!("{worker_name} panicked")));
            if let Err(err) = &result {
                if err.downcast_ref::<ExecutionCancelled>().is_none() {
                    tracing::error!("{} failed: {:#}", worker_name, err);
                    cancelled.store(true, Ordering::Release);
                }
            }
            result
        })
        .with_context(|| format!("spawn worker thread {thread_name}"))
}

fn run_worker(
    mut tasklets: Vec<Box<dyn Tasklet>>,
    cancelled: &AtomicBool,
    idle: IdleConfig,
) -> Result<()> {
    for tasklet in &mut tasklets {
        let name = tasklet.name().to_string();
        tasklet
            .init()
            .with_context(|| format!("init of tasklet {name}"))?;
    }

    let mut idle_passes = 0u32;
    while !tasklets.is_empty() {
        if cancelled.load(Ordering::Acquire) {
            return Err(ExecutionCancelled.into());
        }
        let mut progress = false;
        let mut i = 0;
        while i < tasklets.len() {
            match tasklets[i].call() {
                Ok(ProgressState::Done) => {
                    let done = tasklets.swap_remove(i);
                    tracing::debug!("tasklet {} finished", done.name());
                    progress = true;
                    continue;
                }
                Ok(state) => progress |= state.made_progress(),
                Err(err) => {
                    let name = tasklets[i].name().to_string();
                    return Err(err.context(format!("tasklet {name} failed")));
                }
            }
            i += 1;
        }
        if progress {
            idle_passes = 0;
        } else {
            thread::park_timeout(idle.park_time(idle_passes));
            idle_passes = idle_passes.saturating_add(1);
        }
    }
    Ok(())
}

/// Handle of tasklets submitted to an [`ExecutionService`].
#[derive(Debug)]
pub struct ExecutionHandle {
    name: String,
    threads: Vec<JoinHandle<Result<()>>>,
    cancelled: Arc<AtomicBool>,
}

impl ExecutionHandle {
    /// Ask every worker to stop after its current call.
    pub fn cancel(&self) {
        tracing::info!("{}: cancelling", self.name);
        self.cancelled.store(true, Ordering::Release);
        for handle in &self.threads {
            handle.thread().unpark();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.threads.iter().all(JoinHandle::is_finished)
    }

    /// Wait for every worker.
    ///
    /// Returns the first failure; if workers only stopped because of
    /// [`ExecutionHandle::cancel`], returns [`ExecutionCancelled`].
    pub fn join(self) -> Result<()> {
        let mut failure = None;
        let mut was_cancelled = false;
        for handle in self.threads {
            let result = handle
                .join()
                .map_err(|_| anyhow!("{}: worker thread died", self.name))
                .and_then(|result| result);
            match result {
                Ok(()) => {}
                Err(err) if err.downcast_ref::<ExecutionCancelled>().is_some() => {
                    was_cancelled = true;
                }
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None if was_cancelled => Err(ExecutionCancelled.into()),
            None => {
                tracing::debug!("{}: all workers finished", self.name);
                Ok(())
            }
        }
    }
}
