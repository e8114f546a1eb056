//! Built-in processors.

use super::{Inbox, Processor, ProcessorOutbox};
use ahash::AHashMap;
use anyhow::{anyhow, bail, Result};
use std::fmt::Debug;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};

// ============================================================================
// Map
// ============================================================================

/// Stateless one-to-one transformation, emitted to every output.
pub struct Map<I, O, F> {
    f: F,
    _marker: PhantomData<fn(&I) -> O>,
}

pub fn map<I, O, F>(f: F) -> Map<I, O, F>
where
    F: FnMut(&I) -> O + Send,
{
    Map {
        f,
        _marker: PhantomData,
    }
}

impl<I, O, F> Processor for Map<I, O, F>
where
    I: Send,
    O: Clone + Send,
    F: FnMut(&I) -> O + Send,
{
    type In = I;
    type Out = O;
    type Key = ();
    type Value = ();

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<I>,
        outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        // The item stays in the inbox until its result fits into the outbox.
        while let Some(item) = inbox.peek() {
            let mapped = (self.f)(item);
            if !outbox.offer_to_all(mapped) {
                break;
            }
            inbox.remove();
        }
        Ok(())
    }
}

// ============================================================================
// ListSource
// ============================================================================

const OFFSET_KEY: &str = "offset";

/// Source emitting a fixed list from `complete()`. Snapshots its read offset.
pub struct ListSource<T> {
    items: Vec<T>,
    position: usize,
    max_per_call: usize,
}

impl<T: Clone + Send> ListSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items,
            position: 0,
            max_per_call: 1024,
        }
    }

    /// Limit emission per `complete()` call so snapshots can interleave.
    pub fn with_max_per_call(mut self, max_per_call: usize) -> Self {
        self.max_per_call = max_per_call.max(1);
        self
    }

    pub fn position(&self) -> usize {
        self.position
    }
}

impl<T: Clone + Send> Processor for ListSource<T> {
    type In = ();
    type Out = T;
    type Key = String;
    type Value = usize;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<()>,
        _outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        inbox.clear();
        Ok(())
    }

    fn complete(&mut self, outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        let mut emitted = 0;
        while self.position < self.items.len() && emitted < self.max_per_call {
            if !outbox.offer_to_all(self.items[self.position].clone()) {
                break;
            }
            self.position += 1;
            emitted += 1;
        }
        Ok(self.position == self.items.len())
    }

    fn save_snapshot(&mut self, outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        outbox.offer_to_snapshot(OFFSET_KEY.to_string(), self.position)
    }

    fn restore_snapshot(
        &mut self,
        inbox: &mut Inbox<(String, usize)>,
        _outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        while let Some((key, offset)) = inbox.poll() {
            if key != OFFSET_KEY {
                bail!("unexpected snapshot key for list source: {key}");
            }
            if offset > self.items.len() {
                bail!(
                    "restored offset {} beyond list of {} items",
                    offset,
                    self.items.len()
                );
            }
            self.position = offset;
        }
        Ok(())
    }
}

// ============================================================================
// CountPerKey
// ============================================================================

/// Counts items per key and emits `(key, count)` totals from `complete()`.
///
/// Snapshot holds one pair per key still to be emitted.
pub struct CountPerKey<K> {
    counts: AHashMap<K, u64>,
    snapshot_cursor: Option<Vec<(K, u64)>>,
}

impl<K> Default for CountPerKey<K> {
    fn default() -> Self {
        Self {
            counts: AHashMap::new(),
            snapshot_cursor: None,
        }
    }
}

impl<K> CountPerKey<K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, key: &K) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }
}

impl<K> Processor for CountPerKey<K>
where
    K: Eq + Hash + Clone + Debug + Send,
{
    type In = K;
    type Out = (K, u64);
    type Key = K;
    type Value = u64;

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<K>,
        _outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        while let Some(key) = inbox.poll() {
            *self.counts.entry(key).or_insert(0) += 1;
        }
        Ok(())
    }

    fn complete(&mut self, outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        // Emitted totals leave the state right away so a snapshot taken between
        // calls never replays them.
        loop {
            let Some((key, count)) = self.counts.iter().next().map(|(k, c)| (k.clone(), *c)) else {
                break;
            };
            if !outbox.offer_to_all((key.clone(), count)) {
                return Ok(false);
            }
            self.counts.remove(&key);
        }
        Ok(true)
    }

    fn save_snapshot(&mut self, outbox: &mut ProcessorOutbox<Self>) -> Result<bool> {
        let cursor = self
            .snapshot_cursor
            .get_or_insert_with(|| self.counts.iter().map(|(k, c)| (k.clone(), *c)).collect());
        while let Some((key, count)) = cursor.pop() {
            if !outbox.offer_to_snapshot(key.clone(), count)? {
                cursor.push((key, count));
                return Ok(false);
            }
        }
        self.snapshot_cursor = None;
        Ok(true)
    }

    fn restore_snapshot(
        &mut self,
        inbox: &mut Inbox<(K, u64)>,
        _outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        while let Some((key, count)) = inbox.poll() {
            *self.counts.entry(key).or_insert(0) += count;
        }
        Ok(())
    }
}

// ============================================================================
// CollectSink
// ============================================================================

/// Sink appending every item to a shared vector.
pub struct CollectSink<T> {
    target: Arc<Mutex<Vec<T>>>,
    cooperative: bool,
}

impl<T: Send> CollectSink<T> {
    pub fn new(target: Arc<Mutex<Vec<T>>>) -> Self {
        Self {
            target,
            cooperative: true,
        }
    }

    /// Run the sink on a dedicated thread instead of the cooperative pool.
    pub fn non_cooperative(mut self) -> Self {
        self.cooperative = false;
        self
    }
}

impl<T: Send> Processor for CollectSink<T> {
    type In = T;
    type Out = ();
    type Key = ();
    type Value = ();

    fn is_cooperative(&self) -> bool {
        self.cooperative
    }

    fn process(
        &mut self,
        _ordinal: usize,
        inbox: &mut Inbox<T>,
        _outbox: &mut ProcessorOutbox<Self>,
    ) -> Result<()> {
        let mut target = self
            .target
            .lock()
            .map_err(|_| anyhow!("collect sink lock poisoned"))?;
        while let Some(item) = inbox.poll() {
            target.push(item);
        }
        Ok(())
    }
}
