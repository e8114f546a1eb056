//! Protocol violations.
//!
//! Every variant is fatal for the job attempt: the scheduler thread that hits one
//! tears the attempt down and the job falls back to the last completed snapshot.
//! Violations travel inside [`anyhow::Error`]; use `downcast_ref::<ProtocolViolation>()`
//! to tell them apart from ordinary failures.

use crate::types::SnapshotId;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    #[error("tasklet count already set once")]
    TaskletCountAlreadySet,

    #[error("invalid tasklet count: total={total}, higher_priority={higher_priority}")]
    InvalidTaskletCount {
        total: usize,
        higher_priority: usize,
    },

    #[error("tasklet count was not initialized")]
    TaskletCountNotInitialized,

    #[error("new snapshot id not incremented by 1: previous={previous}, new={requested}")]
    SnapshotIdOutOfOrder {
        previous: SnapshotId,
        requested: SnapshotId,
    },

    #[error("previous snapshot {in_flight} was not finished, remaining tasklets={remaining}")]
    OverlappingSnapshot {
        in_flight: SnapshotId,
        remaining: usize,
    },

    #[error("more tasklets reported done than were registered")]
    TaskletCountUnderflow,

    #[error("more higher-priority tasklets reported done than were registered")]
    HigherPriorityUnderflow,

    #[error("tasklet reports snapshot {last} but the current snapshot is {current}")]
    TaskletAheadOfSnapshot {
        last: SnapshotId,
        current: SnapshotId,
    },

    #[error("snapshot done reported while no snapshot is in progress")]
    NoSnapshotInProgress,

    #[error("completion of snapshot {snapshot_id} already resolved")]
    CompletionAlreadyResolved { snapshot_id: SnapshotId },

    #[error("duplicate key produced in save_snapshot(): {key}")]
    DuplicateSnapshotKey { key: String },

    #[error("offer to output ordinal {ordinal}, but the outbox has {bucket_count} queues")]
    UnknownOrdinal {
        ordinal: usize,
        bucket_count: usize,
    },

    #[error("{call}() call without progress")]
    MissingProgress { call: &'static str },

    #[error("call to {call}() took {elapsed:?}, it should be < {limit:?}")]
    CooperativeTimeLimitExceeded {
        call: &'static str,
        elapsed: Duration,
        limit: Duration,
    },

    #[error("unexpected barrier {received} on input {ordinal}, expected {expected}")]
    UnexpectedBarrier {
        ordinal: usize,
        expected: SnapshotId,
        received: SnapshotId,
    },

    #[error("duplicate barrier {snapshot_id} on input {ordinal}")]
    DuplicateBarrier {
        ordinal: usize,
        snapshot_id: SnapshotId,
    },
}
