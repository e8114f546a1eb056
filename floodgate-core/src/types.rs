use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier of a distributed snapshot. Ids start at 0 and grow by exactly one.
pub type SnapshotId = i64;

/// Sentinel meaning "no snapshot has been started yet".
pub const NO_SNAPSHOT: SnapshotId = -1;

/// Identifier of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Identifier of one execution attempt of a job.
///
/// A job gets a fresh execution id every time it is (re)started from a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionId(pub u64);

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Formats a job/execution pair for log lines.
pub fn format_ids(job_id: JobId, execution_id: ExecutionId) -> String {
    format!("job {job_id}, execution {execution_id}")
}

/// Consistency level the snapshot protocol upholds for a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessingGuarantee {
    /// Snapshots are never taken.
    #[default]
    None,
    /// Barriers are tracked but inputs are never blocked while aligning.
    AtLeastOnce,
    /// Inputs that delivered a barrier are blocked until every input delivered it.
    ExactlyOnce,
}

impl ProcessingGuarantee {
    pub fn snapshotting_enabled(self) -> bool {
        self != ProcessingGuarantee::None
    }
}

impl FromStr for ProcessingGuarantee {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "at-least-once" => Ok(Self::AtLeastOnce),
            "exactly-once" => Ok(Self::ExactlyOnce),
            other => Err(anyhow::anyhow!("unknown processing guarantee: {other}")),
        }
    }
}

impl fmt::Display for ProcessingGuarantee {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::AtLeastOnce => "at-least-once",
            Self::ExactlyOnce => "exactly-once",
        })
    }
}

/// Snapshot barrier travelling between tasklets in-band with the data.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Barrier {
    pub snapshot_id: SnapshotId,
}

impl Barrier {
    pub fn new(snapshot_id: SnapshotId) -> Self {
        Self { snapshot_id }
    }
}

impl fmt::Display for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Barrier({})", self.snapshot_id)
    }
}

/// The unit flowing through a conduit: data items, snapshot barriers and the end marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum StreamElement<T> {
    /// User data item.
    Record(T),
    /// Snapshot barrier: everything before it belongs to the snapshot.
    Barrier(Barrier),
    /// The upstream tasklet finished; nothing follows.
    End,
}

impl<T> StreamElement<T> {
    pub fn record(value: T) -> Self {
        Self::Record(value)
    }

    pub fn barrier(snapshot_id: SnapshotId) -> Self {
        Self::Barrier(Barrier::new(snapshot_id))
    }

    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Record(_))
    }
}
