use super::*;
use crate::conduit::{conduit, ConduitReceiver};
use crate::config::EngineConfig;
use crate::error::ProtocolViolation;
use crate::processor::{
    map, CollectSink, Inbox, ListSource, Processor, ProcessorContext, ProcessorOutbox,
};
use crate::snapshot::{InMemorySnapshotStore, SnapshotContext};
use crate::types::{ExecutionId, JobId, ProcessingGuarantee, StreamElement};
use anyhow::Result;
use std::sync::{Arc, Mutex};

fn snapshot_context(
    guarantee: ProcessingGuarantee,
    total: usize,
    higher_priority: usize,
) -> Arc<SnapshotContext> {
    let ctx = Arc::new(SnapshotContext::new(JobId(7), ExecutionId(1), guarantee));
    ctx.init_tasklet_count(total, higher_priority).unwrap();
    ctx
}

fn processor_context(name: &str) -> ProcessorContext {
    ProcessorContext::new(JobId(7), ExecutionId(1), name)
}

fn drain<T>(receiver: &ConduitReceiver<T>) -> Vec<StreamElement<T>> {
    let mut elements = Vec::new();
    while let Some(element) = receiver.try_recv().unwrap() {
        elements.push(element);
    }
    elements
}

fn run_until_done(tasklet: &mut impl Tasklet) {
    for _ in 0..10_000 {
        if tasklet.call().unwrap().is_done() {
            return;
        }
    }
    panic!("tasklet {} did not finish", tasklet.name());
}

fn call_times(tasklet: &mut impl Tasklet, times: usize) {
    for _ in 0..times {
        tasklet.call().unwrap();
    }
}

fn records(elements: &[StreamElement<String>]) -> Vec<&str> {
    elements
        .iter()
        .filter_map(|e| match e {
            StreamElement::Record(s) => Some(s.as_str()),
            _ => None,
        })
        .collect()
}

fn upper() -> impl Processor<In = String, Out = String, Key = (), Value = ()> {
    map(|s: &String| s.to_uppercase())
}

#[test]
fn test_map_tasklet_forwards_items_and_end() {
    let ctx = snapshot_context(ProcessingGuarantee::None, 1, 0);
    let (in_tx, in_rx) = conduit(16);
    let (out_tx, out_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        upper(),
        processor_context("upper"),
        vec![in_rx],
        vec![out_tx],
        ctx.clone(),
        &EngineConfig::default(),
    );
    assert_eq!(tasklet.name(), "upper#0");
    assert!(tasklet.is_cooperative());
    tasklet.init().unwrap();

    in_tx.send(StreamElement::record("foo".to_string())).unwrap();
    in_tx.send(StreamElement::record("bar".to_string())).unwrap();
    in_tx.send(StreamElement::End).unwrap();
    run_until_done(&mut tasklet);

    assert_eq!(
        drain(&out_rx),
        vec![
            StreamElement::record("FOO".to_string()),
            StreamElement::record("BAR".to_string()),
            StreamElement::End,
        ]
    );
    assert_eq!(ctx.num_tasklets().unwrap(), Some(0));
    assert_eq!(tasklet.call().unwrap(), ProgressState::Done);
}

#[test]
fn test_call_before_init_fails() {
    let ctx = snapshot_context(ProcessingGuarantee::None, 1, 0);
    let (_in_tx, in_rx) = conduit::<String>(4);
    let mut tasklet = ProcessorTasklet::new(
        upper(),
        processor_context("upper"),
        vec![in_rx],
        Vec::new(),
        ctx,
        &EngineConfig::default(),
    );
    assert!(tasklet.call().is_err());
}

#[test]
fn test_snapshotting_requires_writer() {
    let ctx = snapshot_context(ProcessingGuarantee::AtLeastOnce, 1, 0);
    let mut tasklet = ProcessorTasklet::new(
        ListSource::new(vec![1]),
        processor_context("source"),
        Vec::new(),
        Vec::new(),
        ctx,
        &EngineConfig::default(),
    );
    let err = tasklet.init().unwrap_err();
    assert!(err.to_string().contains("snapshot writer"), "unexpected error: {err}");
}

#[test]
fn test_output_backpressure_keeps_items_in_outbox() {
    let ctx = snapshot_context(ProcessingGuarantee::None, 1, 0);
    let (in_tx, in_rx) = conduit(16);
    let (out_tx, out_rx) = conduit(1);
    let mut tasklet = ProcessorTasklet::new(
        upper(),
        processor_context("upper"),
        vec![in_rx],
        vec![out_tx],
        ctx,
        &EngineConfig::default(),
    );
    tasklet.init().unwrap();
    for s in ["a", "b", "c"] {
        in_tx.send(StreamElement::record(s.to_string())).unwrap();
    }
    in_tx.send(StreamElement::End).unwrap();

    let mut stalled = false;
    for _ in 0..20 {
        if tasklet.call().unwrap() == ProgressState::NoProgress {
            stalled = true;
            break;
        }
    }
    assert!(stalled);
    assert_eq!(out_rx.len(), 1);

    let mut received = Vec::new();
    for _ in 0..100 {
        received.extend(drain(&out_rx));
        if tasklet.call().unwrap().is_done() {
            break;
        }
    }
    received.extend(drain(&out_rx));
    assert_eq!(records(&received), vec!["A", "B", "C"]);
    assert_eq!(received.last(), Some(&StreamElement::End));
}

#[test]
fn test_exactly_once_blocks_input_until_barrier_aligned() {
    let ctx = snapshot_context(ProcessingGuarantee::ExactlyOnce, 1, 0);
    let store = InMemorySnapshotStore::new();
    let (in0_tx, in0_rx) = conduit(16);
    let (in1_tx, in1_rx) = conduit(16);
    let (out_tx, out_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        upper(),
        processor_context("upper"),
        vec![in0_rx, in1_rx],
        vec![out_tx],
        ctx.clone(),
        &EngineConfig::default(),
    )
    .with_snapshot_writer(store.writer::<(), ()>("upper#0"));
    tasklet.init().unwrap();

    let mut completion = ctx.start_new_snapshot(0).unwrap();
    in0_tx.send(StreamElement::record("a".to_string())).unwrap();
    in0_tx.send(StreamElement::barrier(0)).unwrap();
    in0_tx.send(StreamElement::record("b".to_string())).unwrap();
    in1_tx.send(StreamElement::record("c".to_string())).unwrap();

    call_times(&mut tasklet, 10);
    let before = drain(&out_rx);
    assert_eq!(records(&before), vec!["A", "C"]);
    assert!(completion.try_result().is_none());

    in1_tx.send(StreamElement::barrier(0)).unwrap();
    in1_tx.send(StreamElement::record("d".to_string())).unwrap();
    call_times(&mut tasklet, 10);

    assert_eq!(
        drain(&out_rx),
        vec![
            StreamElement::barrier(0),
            StreamElement::record("B".to_string()),
            StreamElement::record("D".to_string()),
        ]
    );
    assert_eq!(completion.try_result().unwrap().unwrap(), 0);
    assert_eq!(tasklet.last_snapshot_id(), 0);
    assert_eq!(store.partitions(0).unwrap(), vec!["upper#0".to_string()]);

    in0_tx.send(StreamElement::End).unwrap();
    in1_tx.send(StreamElement::End).unwrap();
    run_until_done(&mut tasklet);
    assert_eq!(drain(&out_rx), vec![StreamElement::End]);
}

#[test]
fn test_at_least_once_keeps_reading_after_barrier() {
    let ctx = snapshot_context(ProcessingGuarantee::AtLeastOnce, 1, 0);
    let store = InMemorySnapshotStore::new();
    let (in0_tx, in0_rx) = conduit(16);
    let (in1_tx, in1_rx) = conduit(16);
    let (out_tx, out_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        upper(),
        processor_context("upper"),
        vec![in0_rx, in1_rx],
        vec![out_tx],
        ctx.clone(),
        &EngineConfig::default(),
    )
    .with_snapshot_writer(store.writer::<(), ()>("upper#0"));
    tasklet.init().unwrap();

    let _completion = ctx.start_new_snapshot(0).unwrap();
    in0_tx.send(StreamElement::record("a".to_string())).unwrap();
    in0_tx.send(StreamElement::barrier(0)).unwrap();
    in0_tx.send(StreamElement::record("b".to_string())).unwrap();
    in1_tx.send(StreamElement::record("c".to_string())).unwrap();

    call_times(&mut tasklet, 10);
    let out = drain(&out_rx);
    assert_eq!(records(&out), vec!["A", "C", "B"]);
    assert!(out.iter().all(|e| !e.is_control()));
}

#[test]
fn test_unexpected_barrier_id_fails() {
    let ctx = snapshot_context(ProcessingGuarantee::ExactlyOnce, 1, 0);
    let store = InMemorySnapshotStore::new();
    let (in_tx, in_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        upper(),
        processor_context("upper"),
        vec![in_rx],
        Vec::new(),
        ctx,
        &EngineConfig::default(),
    )
    .with_snapshot_writer(store.writer::<(), ()>("upper#0"));
    tasklet.init().unwrap();

    in_tx.send(StreamElement::barrier(3)).unwrap();
    let err = tasklet.call().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ProtocolViolation>(),
        Some(ProtocolViolation::UnexpectedBarrier {
            expected: 0,
            received: 3,
            ..
        })
    ));
}

#[test]
fn test_source_snapshots_when_context_armed() {
    let ctx = snapshot_context(ProcessingGuarantee::ExactlyOnce, 1, 0);
    let store = InMemorySnapshotStore::new();
    let (out_tx, out_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        ListSource::new(vec![1, 2, 3, 4, 5]).with_max_per_call(2),
        processor_context("source"),
        Vec::new(),
        vec![out_tx],
        ctx.clone(),
        &EngineConfig::default(),
    )
    .with_snapshot_writer(store.writer::<String, usize>("source#0").with_flush_polls(2));
    tasklet.init().unwrap();

    call_times(&mut tasklet, 2);
    let mut completion = ctx.start_new_snapshot(0).unwrap();
    run_until_done(&mut tasklet);
    assert_eq!(completion.try_result().unwrap().unwrap(), 0);

    let out = drain(&out_rx);
    let barrier_at = out
        .iter()
        .position(|e| *e == StreamElement::barrier(0))
        .unwrap();
    let saved: Vec<(String, usize)> = store.load(0, "source#0").unwrap();
    assert_eq!(saved, vec![("offset".to_string(), barrier_at)]);
    assert_eq!(out.len(), 7);
    assert_eq!(out.last(), Some(&StreamElement::End));
}

#[test]
fn test_source_resumes_from_restored_state() {
    let ctx = snapshot_context(ProcessingGuarantee::None, 1, 0);
    let (out_tx, out_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        ListSource::new(vec![1, 2, 3, 4, 5]),
        processor_context("source"),
        Vec::new(),
        vec![out_tx],
        ctx,
        &EngineConfig::default(),
    )
    .with_restored_state(vec![("offset".to_string(), 3)]);
    tasklet.init().unwrap();
    run_until_done(&mut tasklet);

    assert_eq!(
        drain(&out_rx),
        vec![
            StreamElement::record(4),
            StreamElement::record(5),
            StreamElement::End
        ]
    );
}

#[test]
fn test_higher_priority_tasklet_takes_postponed_snapshot_at_the_end() {
    let ctx = snapshot_context(ProcessingGuarantee::ExactlyOnce, 1, 1);
    let store = InMemorySnapshotStore::new();
    let (out_tx, out_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        ListSource::new(vec![1, 2, 3]),
        processor_context("hp"),
        Vec::new(),
        vec![out_tx],
        ctx.clone(),
        &EngineConfig::default(),
    )
    .with_snapshot_writer(store.writer::<String, usize>("hp#0"))
    .higher_priority();
    assert!(tasklet.is_higher_priority());
    tasklet.init().unwrap();

    let mut completion = ctx.start_new_snapshot(0).unwrap();
    assert_eq!(ctx.postponed_snapshot_id().unwrap(), Some(0));
    run_until_done(&mut tasklet);

    assert_eq!(completion.try_result().unwrap().unwrap(), 0);
    assert_eq!(tasklet.last_snapshot_id(), 0);
    // Outputs were closed before the snapshot was armed: no barrier.
    assert_eq!(
        drain(&out_rx),
        vec![
            StreamElement::record(1),
            StreamElement::record(2),
            StreamElement::record(3),
            StreamElement::End
        ]
    );
    let saved: Vec<(String, usize)> = store.load(0, "hp#0").unwrap();
    assert_eq!(saved, vec![("offset".to_string(), 3)]);
}

struct DuplicateKeys;

impl Processor for DuplicateKeys {
    type In = ();
    type Out = ();
    type Key = String;
    type Value = u8;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<()>,
        _outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        inbox.clear();
        Ok(())
    }

    fn complete(&mut self, _outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        Ok(false)
    }

    fn save_snapshot(&mut self, outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        outbox.offer_to_snapshot("k".to_string(), 1)?;
        // The error of the second offer is swallowed on purpose.
        let _ = outbox.offer_to_snapshot("k".to_string(), 2);
        Ok(true)
    }
}

#[test]
fn test_swallowed_duplicate_snapshot_key_still_fails() {
    let ctx = snapshot_context(ProcessingGuarantee::AtLeastOnce, 1, 0);
    let store = InMemorySnapshotStore::new();
    let mut tasklet = ProcessorTasklet::new(
        DuplicateKeys,
        processor_context("dup"),
        Vec::new(),
        Vec::new(),
        ctx.clone(),
        &EngineConfig::default(),
    )
    .with_snapshot_writer(store.writer::<String, u8>("dup#0"));
    tasklet.init().unwrap();
    call_times(&mut tasklet, 2);

    let _completion = ctx.start_new_snapshot(0).unwrap();
    let err = (0..10)
        .find_map(|_| tasklet.call().err())
        .unwrap();
    assert!(matches!(
        err.downcast_ref::<ProtocolViolation>(),
        Some(ProtocolViolation::DuplicateSnapshotKey { .. })
    ));
}

#[test]
fn test_non_cooperative_sink_collects_everything() {
    let ctx = snapshot_context(ProcessingGuarantee::None, 1, 0);
    let target = Arc::new(Mutex::new(Vec::new()));
    let (in_tx, in_rx) = conduit(16);
    let mut tasklet = ProcessorTasklet::new(
        CollectSink::new(target.clone()).non_cooperative(),
        processor_context("sink"),
        vec![in_rx],
        Vec::new(),
        ctx,
        &EngineConfig::default(),
    );
    assert!(!tasklet.is_cooperative());
    tasklet.init().unwrap();

    for i in 0..5 {
        in_tx.send(StreamElement::record(i)).unwrap();
    }
    in_tx.send(StreamElement::End).unwrap();
    run_until_done(&mut tasklet);
    assert_eq!(*target.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[test]
fn test_tasklet_without_outputs_drops_broadcast_items() {
    let ctx = snapshot_context(ProcessingGuarantee::None, 1, 0);
    let (in_tx, in_rx) = conduit(4);
    let mut tasklet = ProcessorTasklet::new(
        upper(),
        processor_context("upper"),
        vec![in_rx],
        Vec::new(),
        ctx.clone(),
        &EngineConfig::default(),
    );
    tasklet.init().unwrap();

    in_tx.send(StreamElement::record("a".to_string())).unwrap();
    in_tx.send(StreamElement::End).unwrap();
    run_until_done(&mut tasklet);
    assert_eq!(ctx.num_tasklets().unwrap(), Some(0));
}

/// Emits to an output ordinal it does not have.
struct WrongOrdinal;

impl Processor for WrongOrdinal {
    type In = i32;
    type Out = i32;
    type Key = ();
    type Value = ();

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<i32>,
        outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        while let Some(item) = inbox.poll() {
            outbox.offer(3, item);
        }
        Ok(())
    }
}

#[test]
fn test_offer_to_unknown_ordinal_fails_the_tasklet() {
    let ctx = snapshot_context(ProcessingGuarantee::None, 1, 0);
    let (in_tx, in_rx) = conduit(4);
    let (out_tx, _out_rx) = conduit(4);
    let mut tasklet = ProcessorTasklet::new(
        WrongOrdinal,
        processor_context("wrong"),
        vec![in_rx],
        vec![out_tx],
        ctx,
        &EngineConfig::default(),
    );
    tasklet.init().unwrap();
    in_tx.send(StreamElement::record(1)).unwrap();

    let err = (0..10)
        .find_map(|_| tasklet.call().err())
        .expect("tasklet should fail");
    assert_eq!(
        err.downcast_ref::<ProtocolViolation>(),
        Some(&ProtocolViolation::UnknownOrdinal {
            ordinal: 3,
            bucket_count: 1
        })
    );
}
