use crate::error::ProtocolViolation;
use ahash::AHashSet;
use anyhow::Result;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::hash::Hash;

/// Capacity meaning "bounded only by memory".
pub const UNBOUNDED: usize = usize::MAX;

/// Bounded, multi-destination conduit a processor writes to.
///
/// Holds one queue per output ordinal plus one queue of snapshot `(key, value)`
/// pairs. Offering to a full queue never blocks and never drops: it returns
/// `false` and the processor must retry on a later call.
///
/// Snapshot keys must be unique within one snapshot cycle (see
/// [`Outbox::begin_snapshot_cycle`]).
#[derive(Debug)]
pub struct Outbox<T, K, V> {
    buckets: Vec<VecDeque<T>>,
    capacities: Vec<usize>,
    snapshot_queue: VecDeque<(K, V)>,
    snapshot_capacity: usize,
    snapshot_keys: AHashSet<K>,
    violation: Option<ProtocolViolation>,
}

impl<T, K, V> Outbox<T, K, V>
where
    K: Eq + Hash + Clone + Debug,
{
    /// Create an outbox with one data queue per entry of `capacities`.
    pub fn new(capacities: Vec<usize>, snapshot_capacity: usize) -> Self {
        Self {
            buckets: capacities.iter().map(|_| VecDeque::new()).collect(),
            capacities,
            snapshot_queue: VecDeque::new(),
            snapshot_capacity,
            snapshot_keys: AHashSet::new(),
            violation: None,
        }
    }

    /// Create an outbox whose queues all share the same capacity.
    pub fn with_capacity(bucket_count: usize, capacity: usize) -> Self {
        Self::new(vec![capacity; bucket_count], capacity)
    }

    pub fn unbounded(bucket_count: usize) -> Self {
        Self::with_capacity(bucket_count, UNBOUNDED)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Offer an item to the queue of `ordinal`.
    ///
    /// Returns `false` if that queue is full. An ordinal without a queue is
    /// refused and latched as [`ProtocolViolation::UnknownOrdinal`].
    pub fn offer(&mut self, ordinal: usize, item: T) -> bool {
        let bucket_count = self.buckets.len();
        let Some(bucket) = self.buckets.get_mut(ordinal) else {
            self.violation
                .get_or_insert(ProtocolViolation::UnknownOrdinal {
                    ordinal,
                    bucket_count,
                });
            return false;
        };
        if bucket.len() >= self.capacities[ordinal] {
            return false;
        }
        bucket.push_back(item);
        true
    }

    /// Offer an item to every queue, or to none of them.
    ///
    /// With no queues at all the item is accepted and dropped.
    pub fn offer_to_all(&mut self, item: T) -> bool
    where
        T: Clone,
    {
        if !(0..self.buckets.len()).all(|o| self.has_room(o)) {
            return false;
        }
        let Some((last, rest)) = self.buckets.split_last_mut() else {
            return true;
        };
        for bucket in rest {
            bucket.push_back(item.clone());
        }
        last.push_back(item);
        true
    }

    /// Offer a snapshot pair.
    ///
    /// Returns `Ok(false)` if the snapshot queue is full. A key already offered in
    /// the current snapshot cycle is rejected with
    /// [`ProtocolViolation::DuplicateSnapshotKey`], which is also latched for
    /// [`Outbox::take_violation`].
    pub fn offer_to_snapshot(&mut self, key: K, value: V) -> Result<bool> {
        if !self.has_snapshot_room() {
            return Ok(false);
        }
        if !self.snapshot_keys.insert(key.clone()) {
            let violation = ProtocolViolation::DuplicateSnapshotKey {
                key: format!("{key:?}"),
            };
            self.violation.get_or_insert(violation.clone());
            return Err(violation.into());
        }
        self.snapshot_queue.push_back((key, value));
        Ok(true)
    }

    /// `false` for a full queue and for an ordinal without a queue.
    pub fn has_room(&self, ordinal: usize) -> bool {
        self.buckets
            .get(ordinal)
            .is_some_and(|bucket| bucket.len() < self.capacities[ordinal])
    }

    pub fn has_snapshot_room(&self) -> bool {
        self.snapshot_queue.len() < self.snapshot_capacity
    }

    pub fn queue_len(&self, ordinal: usize) -> usize {
        self.buckets.get(ordinal).map_or(0, VecDeque::len)
    }

    /// Total number of data items waiting in all queues.
    pub fn data_len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn snapshot_len(&self) -> usize {
        self.snapshot_queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data_len() == 0 && self.snapshot_queue.is_empty()
    }

    pub fn drain_queue(&mut self, ordinal: usize) -> impl Iterator<Item = T> + '_ {
        self.buckets
            .get_mut(ordinal)
            .into_iter()
            .flat_map(|bucket| bucket.drain(..))
    }

    pub fn pop_front(&mut self, ordinal: usize) -> Option<T> {
        self.buckets.get_mut(ordinal)?.pop_front()
    }

    /// Put back an item taken with [`Outbox::pop_front`] that could not be delivered.
    pub fn push_front(&mut self, ordinal: usize, item: T) {
        if let Some(bucket) = self.buckets.get_mut(ordinal) {
            bucket.push_front(item);
        }
    }

    pub fn drain_snapshot_queue(&mut self) -> impl Iterator<Item = (K, V)> + '_ {
        self.snapshot_queue.drain(..)
    }

    pub fn pop_snapshot(&mut self) -> Option<(K, V)> {
        self.snapshot_queue.pop_front()
    }

    /// Start a new snapshot cycle: keys of the previous cycle may be reused.
    pub fn begin_snapshot_cycle(&mut self) {
        self.snapshot_keys.clear();
    }

    /// The first violation recorded since the last call, if any.
    pub fn take_violation(&mut self) -> Option<ProtocolViolation> {
        self.violation.take()
    }
}
