use super::*;
use crate::conduit::conduit;
use crate::config::EngineConfig;
use crate::processor::{map, CollectSink, ListSource, ProcessorContext};
use crate::snapshot::InMemorySnapshotStore;
use crate::tasklet::{ProcessorTasklet, ProgressState, Tasklet};
use crate::types::{ExecutionId, JobId, ProcessingGuarantee};
use anyhow::{bail, Result};
use std::sync::{Arc, Mutex};

/// Test tasklet: finishes after `done_after` calls, or fails after `fail_after`.
struct Scripted {
    name: String,
    cooperative: bool,
    calls: usize,
    done_after: Option<usize>,
    fail_after: Option<usize>,
}

impl Scripted {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            cooperative: true,
            calls: 0,
            done_after: None,
            fail_after: None,
        }
    }
}

impl Tasklet for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    fn call(&mut self) -> Result<ProgressState> {
        self.calls += 1;
        if self.fail_after.is_some_and(|n| self.calls >= n) {
            bail!("{} gave up", self.name);
        }
        if self.done_after.is_some_and(|n| self.calls >= n) {
            return Ok(ProgressState::Done);
        }
        Ok(ProgressState::NoProgress)
    }
}

fn service(threads: usize) -> ExecutionService {
    ExecutionService::new(EngineConfig {
        cooperative_thread_count: threads,
        ..EngineConfig::default()
    })
}

#[test]
fn test_service_runs_tasklets_to_completion() {
    let tasklets: Vec<Box<dyn Tasklet>> = (0..5)
        .map(|i| {
            let mut t = Scripted::new(&format!("t{i}"));
            t.done_after = Some(3 + i);
            t.cooperative = i % 2 == 0;
            Box::new(t) as Box<dyn Tasklet>
        })
        .collect();
    let handle = service(2).submit("test", tasklets).unwrap();
    handle.join().unwrap();
}

#[test]
fn test_empty_submission_finishes_immediately() {
    let handle = service(2).submit("empty", Vec::new()).unwrap();
    assert!(handle.is_finished());
    handle.join().unwrap();
}

#[test]
fn test_first_error_cancels_other_workers() {
    let mut failing = Scripted::new("failing");
    failing.fail_after = Some(5);
    let endless = Scripted::new("endless");
    let mut dedicated = Scripted::new("dedicated");
    dedicated.cooperative = false;

    let handle = service(2)
        .submit(
            "failing",
            vec![Box::new(failing), Box::new(endless), Box::new(dedicated)],
        )
        .unwrap();
    let err = handle.join().unwrap_err();
    assert!(err.downcast_ref::<ExecutionCancelled>().is_none());
    assert!(format!("{err:#}").contains("failing gave up"), "unexpected error: {err:#}");
}

#[test]
fn test_cancel_stops_workers() {
    let handle = service(1)
        .submit("cancel", vec![Box::new(Scripted::new("endless"))])
        .unwrap();
    handle.cancel();
    assert!(handle.is_cancelled());
    let err = handle.join().unwrap_err();
    assert!(err.downcast_ref::<ExecutionCancelled>().is_some());
}

#[test]
fn test_init_failure_is_reported() {
    struct FailsInit;

    impl Tasklet for FailsInit {
        fn name(&self) -> &str {
            "fails-init"
        }

        fn is_cooperative(&self) -> bool {
            true
        }

        fn init(&mut self) -> Result<()> {
            bail!("no resources")
        }

        fn call(&mut self) -> Result<ProgressState> {
            Ok(ProgressState::Done)
        }
    }

    let err = service(1)
        .submit("init", vec![Box::new(FailsInit)])
        .unwrap()
        .join()
        .unwrap_err();
    assert!(format!("{err:#}").contains("no resources"));
}

fn pipeline(
    job: &JobExecution,
    items: Vec<String>,
    target: Arc<Mutex<Vec<String>>>,
    store: &InMemorySnapshotStore,
) -> Vec<Box<dyn Tasklet>> {
    let config = EngineConfig::default();
    let ctx = job.snapshot_context();
    let (source_tx, source_rx) = conduit(8);
    let (map_tx, map_rx) = conduit(8);

    let source = ProcessorTasklet::new(
        ListSource::new(items).with_max_per_call(4),
        ProcessorContext::new(job.job_id(), job.execution_id(), "source"),
        Vec::new(),
        vec![source_tx],
        ctx.clone(),
        &config,
    )
    .with_snapshot_writer(store.writer::<String, usize>("source#0"));
    let upper = ProcessorTasklet::new(
        map(|s: &String| s.to_uppercase()),
        ProcessorContext::new(job.job_id(), job.execution_id(), "upper"),
        vec![source_rx],
        vec![map_tx],
        ctx.clone(),
        &config,
    )
    .with_snapshot_writer(store.writer::<(), ()>("upper#0"));
    let sink = ProcessorTasklet::new(
        CollectSink::new(target),
        ProcessorContext::new(job.job_id(), job.execution_id(), "sink"),
        vec![map_rx],
        Vec::new(),
        ctx,
        &config,
    )
    .with_snapshot_writer(store.writer::<(), ()>("sink#0"));

    vec![Box::new(source), Box::new(upper), Box::new(sink)]
}

#[test]
fn test_job_execution_runs_pipeline_with_snapshot() {
    let mut job = JobExecution::new(JobId(9), ExecutionId(1), ProcessingGuarantee::ExactlyOnce);
    let store = InMemorySnapshotStore::new();
    let target = Arc::new(Mutex::new(Vec::new()));
    let items: Vec<String> = (0..200).map(|i| format!("w{i}")).collect();
    let tasklets = pipeline(&job, items.clone(), target.clone(), &store);

    job.start(&service(2), tasklets).unwrap();
    let completion = job.start_snapshot(0).unwrap();
    assert_eq!(completion.wait().unwrap(), 0);
    job.join().unwrap();

    let expected: Vec<String> = items.iter().map(|s| s.to_uppercase()).collect();
    assert_eq!(*target.lock().unwrap(), expected);

    // The snapshot either ran on every tasklet or on none of them.
    let partitions = store.partitions(0).unwrap();
    assert!(partitions.is_empty() || partitions.len() == 3, "{partitions:?}");
}

#[test]
fn test_job_execution_rejects_second_start() {
    let mut job = JobExecution::new(JobId(1), ExecutionId(1), ProcessingGuarantee::None);
    let store = InMemorySnapshotStore::new();
    let target = Arc::new(Mutex::new(Vec::new()));
    let service = service(1);

    let tasklets = pipeline(&job, vec!["a".to_string()], target.clone(), &store);
    job.start(&service, tasklets).unwrap();
    let again = pipeline(&job, Vec::new(), target, &store);
    assert!(job.start(&service, again).is_err());
    assert!(job.start_snapshot(0).is_err());
    job.join().unwrap();
}

#[test]
fn test_job_execution_join_without_start_fails() {
    let job = JobExecution::new(JobId(1), ExecutionId(1), ProcessingGuarantee::None);
    assert!(!job.is_finished());
    assert!(job.join().is_err());
}
