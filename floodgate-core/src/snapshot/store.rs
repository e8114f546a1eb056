use crate::types::SnapshotId;
use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard};

/// Destination of one tasklet's snapshot pairs.
///
/// Persistence happens outside the tasklet's thread: the tasklet starts a flush
/// with [`SnapshotWriter::begin_flush`] and polls it on later calls, it never waits.
pub trait SnapshotWriter<K, V>: Send {
    /// Whether [`SnapshotWriter::write`] may be called now.
    fn has_capacity(&self) -> bool;
    fn write(&mut self, snapshot_id: SnapshotId, key: K, value: V) -> Result<()>;
    /// Start persisting everything written for `snapshot_id`.
    fn begin_flush(&mut self, snapshot_id: SnapshotId) -> Result<()>;
    /// `true` once the flush started by [`SnapshotWriter::begin_flush`] is durable.
    fn poll_flush(&mut self) -> Result<bool>;
}

type Partition = (SnapshotId, String);
type EncodedPairs = Vec<(Vec<u8>, Vec<u8>)>;

/// In-memory snapshot storage for tests and local single-process execution.
///
/// Pairs are bincode-encoded and stored per (snapshot id, partition), where the
/// partition is the writing tasklet's instance name.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStore {
    partitions: Arc<Mutex<HashMap<Partition, EncodedPairs>>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writer<K, V>(&self, partition: impl Into<String>) -> InMemorySnapshotWriter<K, V>
    where
        K: Serialize + Send,
        V: Serialize + Send,
    {
        InMemorySnapshotWriter {
            store: self.clone(),
            partition: partition.into(),
            buffer: Vec::new(),
            buffered_snapshot_id: None,
            in_flight: None,
            flush_polls: 0,
            polls_remaining: 0,
            _marker: PhantomData,
        }
    }

    /// Decode the pairs one partition wrote for `snapshot_id`.
    pub fn load<K, V>(&self, snapshot_id: SnapshotId, partition: &str) -> Result<Vec<(K, V)>>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
    {
        let guard = self.lock()?;
        let pairs = guard
            .get(&(snapshot_id, partition.to_string()))
            .ok_or_else(|| {
                anyhow!(
                    "partition {} not found in snapshot {}",
                    partition,
                    snapshot_id
                )
            })?;
        pairs
            .iter()
            .map(|(k, v)| {
                let key = bincode::deserialize(k).context("decode snapshot key")?;
                let value = bincode::deserialize(v).context("decode snapshot value")?;
                Ok((key, value))
            })
            .collect()
    }

    /// Ids of all snapshots with at least one committed partition, ascending.
    pub fn snapshot_ids(&self) -> Result<Vec<SnapshotId>> {
        let mut ids: Vec<_> = self.lock()?.keys().map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }

    pub fn partitions(&self, snapshot_id: SnapshotId) -> Result<Vec<String>> {
        let mut names: Vec<_> = self
            .lock()?
            .keys()
            .filter(|(id, _)| *id == snapshot_id)
            .map(|(_, name)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Drop all but the newest `keep_last_n` snapshots. `purge(0)` drops everything.
    pub fn purge(&self, keep_last_n: usize) -> Result<()> {
        let ids = self.snapshot_ids()?;
        if ids.len() <= keep_last_n {
            return Ok(());
        }
        let oldest_kept = ids.get(ids.len() - keep_last_n).copied();
        self.lock()?
            .retain(|(id, _), _| oldest_kept.is_some_and(|oldest| *id >= oldest));
        Ok(())
    }

    fn commit(&self, snapshot_id: SnapshotId, partition: &str, pairs: EncodedPairs) -> Result<()> {
        self.lock()?
            .entry((snapshot_id, partition.to_string()))
            .or_default()
            .extend(pairs);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Partition, EncodedPairs>>> {
        self.partitions
            .lock()
            .map_err(|_| anyhow!("snapshot store lock poisoned"))
    }
}

/// [`SnapshotWriter`] of one partition of an [`InMemorySnapshotStore`].
pub struct InMemorySnapshotWriter<K, V> {
    store: InMemorySnapshotStore,
    partition: String,
    buffer: EncodedPairs,
    buffered_snapshot_id: Option<SnapshotId>,
    in_flight: Option<(SnapshotId, EncodedPairs)>,
    flush_polls: u32,
    polls_remaining: u32,
    _marker: PhantomData<fn(K, V)>,
}

impl<K, V> InMemorySnapshotWriter<K, V> {
    /// Make each flush report "not yet durable" for `polls` polls before committing.
    pub fn with_flush_polls(mut self, polls: u32) -> Self {
        self.flush_polls = polls;
        self
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }
}

impl<K, V> SnapshotWriter<K, V> for InMemorySnapshotWriter<K, V>
where
    K: Serialize + Send,
    V: Serialize + Send,
{
    fn has_capacity(&self) -> bool {
        self.in_flight.is_none()
    }

    fn write(&mut self, snapshot_id: SnapshotId, key: K, value: V) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(anyhow!(
                "write to partition {} while a flush is in progress",
                self.partition
            ));
        }
        match self.buffered_snapshot_id {
            Some(id) if id != snapshot_id => {
                return Err(anyhow!(
                    "write for snapshot {} while snapshot {} is buffered",
                    snapshot_id,
                    id
                ))
            }
            _ => self.buffered_snapshot_id = Some(snapshot_id),
        }
        let key = bincode::serialize(&key).context("encode snapshot key")?;
        let value = bincode::serialize(&value).context("encode snapshot value")?;
        self.buffer.push((key, value));
        Ok(())
    }

    fn begin_flush(&mut self, snapshot_id: SnapshotId) -> Result<()> {
        if self.in_flight.is_some() {
            return Err(anyhow!(
                "flush of partition {} already in progress",
                self.partition
            ));
        }
        if self.buffered_snapshot_id.is_some_and(|id| id != snapshot_id) {
            return Err(anyhow!(
                "flush of snapshot {} but the buffer holds another snapshot",
                snapshot_id
            ));
        }
        self.buffered_snapshot_id = None;
        self.in_flight = Some((snapshot_id, std::mem::take(&mut self.buffer)));
        self.polls_remaining = self.flush_polls;
        Ok(())
    }

    fn poll_flush(&mut self) -> Result<bool> {
        if self.in_flight.is_none() {
            return Err(anyhow!("no flush in progress for partition {}", self.partition));
        }
        if self.polls_remaining > 0 {
            self.polls_remaining -= 1;
            return Ok(false);
        }
        if let Some((snapshot_id, pairs)) = self.in_flight.take() {
            self.store.commit(snapshot_id, &self.partition, pairs)?;
        }
        Ok(true)
    }
}
