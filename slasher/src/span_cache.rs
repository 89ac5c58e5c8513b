use core::convert::Infallible as Never;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

use anyhow::{ensure, Context as _, Result};
use itertools::Itertools as _;
use log::{debug, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::{
    sync::{watch, Notify},
    time::Instant,
};

use crate::{
    primitives::{Epoch, EpochSpanMap, ValidatorIndex},
    slasher_config::SpanCacheConfig,
    span_pair::SpanPair,
    span_storage::{self, SpanStorage},
    surround_detector::SpanUpdate,
};

#[derive(Debug, Error)]
#[error("failed to flush cached spans (epochs: {epochs:?})")]
pub struct FlushError {
    pub epochs: Vec<Epoch>,
}

// Flushes and deletes are serialized by `SpanCache.backend_writes`.
// Seeing one of these means that no longer holds.
#[derive(Debug, Error)]
pub enum ConsistencyViolation {
    #[error("epoch {epoch} was removed from the span cache while being flushed")]
    FlushedEntryMissing { epoch: Epoch },
    #[error("epoch {epoch} stopped being flushed before its flush completed")]
    FlushedEntryChanged { epoch: Epoch },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum EntryState {
    Dirty,
    Flushing,
    Clean,
    Deleting,
}

struct CacheEntry {
    spans: Arc<EpochSpanMap>,
    state: EntryState,
    // Incremented on every write. Lets a flush tell whether its snapshot is still current.
    version: u64,
    // Set while `spans` only holds writes made after a delete started.
    partial: bool,
}

impl CacheEntry {
    fn dirty(spans: EpochSpanMap) -> Self {
        Self {
            spans: Arc::new(spans),
            state: EntryState::Dirty,
            version: 0,
            partial: false,
        }
    }

    fn deleting() -> Self {
        Self {
            spans: Arc::default(),
            state: EntryState::Deleting,
            version: 0,
            partial: true,
        }
    }

    const fn is_dirty(&self) -> bool {
        matches!(self.state, EntryState::Dirty | EntryState::Flushing)
    }

    fn replace(&mut self, spans: EpochSpanMap) {
        self.spans = Arc::new(spans);
        self.partial = false;
        self.mark_written();
    }

    fn update(&mut self, spans: &[(ValidatorIndex, SpanPair)]) {
        Arc::make_mut(&mut self.spans).extend(spans.iter().copied());
        self.mark_written();
    }

    // Puts the writes made during a failed delete on top of the spans that survived it.
    fn rebase(&mut self, mut base: EpochSpanMap) {
        if self.partial {
            base.extend(self.spans.iter().map(|(index, pair)| (*index, *pair)));
            self.spans = Arc::new(base);
            self.partial = false;
            self.mark_written();
        }
    }

    fn mark_written(&mut self) {
        self.version += 1;

        // A flushing entry is resolved by the flush itself once the write completes.
        if self.state != EntryState::Flushing {
            self.state = EntryState::Dirty;
        }
    }
}

// Keeps a running count of dirty entries so that writes never scan the whole map.
#[derive(Default)]
struct Entries {
    map: HashMap<Epoch, CacheEntry>,
    dirty_count: usize,
}

impl Entries {
    fn get(&self, epoch: Epoch) -> Option<&CacheEntry> {
        self.map.get(&epoch)
    }

    fn contains(&self, epoch: Epoch) -> bool {
        self.map.contains_key(&epoch)
    }

    fn insert(&mut self, epoch: Epoch, entry: CacheEntry) -> Option<CacheEntry> {
        if entry.is_dirty() {
            self.dirty_count += 1;
        }

        let previous = self.map.insert(epoch, entry);

        if previous.as_ref().is_some_and(CacheEntry::is_dirty) {
            self.dirty_count -= 1;
        }

        previous
    }

    fn remove(&mut self, epoch: Epoch) -> Option<CacheEntry> {
        let removed = self.map.remove(&epoch);

        if removed.as_ref().is_some_and(CacheEntry::is_dirty) {
            self.dirty_count -= 1;
        }

        removed
    }

    fn modify<T>(
        &mut self,
        epoch: Epoch,
        modify: impl FnOnce(&mut CacheEntry) -> T,
    ) -> Option<T> {
        let entry = self.map.get_mut(&epoch)?;
        let was_dirty = entry.is_dirty();
        let output = modify(entry);

        match (was_dirty, entry.is_dirty()) {
            (false, true) => self.dirty_count += 1,
            (true, false) => self.dirty_count -= 1,
            _ => {}
        }

        Some(output)
    }
}

/// Write-back cache of spans in front of another [`SpanStorage`].
///
/// Writes are kept in memory and persisted by [`SpanCache::flush`], [`SpanCache::flush_all`]
/// or the background task started with [`SpanCache::run`]. Reads through the cache always
/// observe preceding writes through the cache, flushed or not.
///
/// Writes that have not been flushed are lost if the process crashes.
pub struct SpanCache<S> {
    config: SpanCacheConfig,
    backend: S,
    entries: Mutex<Entries>,
    // Held for every write to `backend` and for reads that seed new entries.
    // Must be acquired before `entries` when both are needed.
    backend_writes: Mutex<()>,
    flush_requested: Notify,
    completed_flush_cycles: watch::Sender<u64>,
}

impl<S: SpanStorage> SpanCache<S> {
    #[must_use]
    pub fn new(config: SpanCacheConfig, backend: S) -> Self {
        Self {
            config,
            backend,
            entries: Mutex::default(),
            backend_writes: Mutex::default(),
            flush_requested: Notify::new(),
            completed_flush_cycles: watch::Sender::new(0),
        }
    }

    #[must_use]
    pub const fn backend(&self) -> &S {
        &self.backend
    }

    /// Returns a receiver that is notified after every flush cycle of [`SpanCache::run`].
    ///
    /// The value is the number of cycles completed so far, including failed ones.
    #[must_use]
    pub fn flush_events(&self) -> watch::Receiver<u64> {
        self.completed_flush_cycles.subscribe()
    }

    pub async fn run(self: Arc<Self>) -> Result<Never>
    where
        S: 'static,
    {
        let period = self.config.flush_interval;

        ensure!(!period.is_zero(), "span cache flush interval must be nonzero");

        let mut interval = tokio::time::interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                () = self.flush_requested.notified() => {
                    debug!("flushing span cache early because too many epochs are dirty");
                }
            }

            let cache = Arc::clone(&self);

            if let Err(error) = tokio::task::spawn_blocking(move || cache.flush_cycle()).await? {
                warn!(
                    "failed to flush span cache, {} epochs remain dirty: {error:?}",
                    self.dirty_count(),
                );
            }

            self.completed_flush_cycles.send_modify(|cycles| *cycles += 1);
        }
    }

    fn flush_cycle(&self) -> Result<()> {
        let result = self.flush_all();
        self.evict_clean_entries();
        result
    }

    // Callers must hold `backend_writes`.
    fn flush_entry(&self, epoch: Epoch) -> Result<()> {
        let snapshot = self.entries.lock().modify(epoch, |entry| {
            (entry.state == EntryState::Dirty).then(|| {
                entry.state = EntryState::Flushing;
                (entry.version, Arc::clone(&entry.spans))
            })
        });

        let Some((version, snapshot)) = snapshot.flatten() else {
            return Ok(());
        };

        let result = self.backend.put(epoch, EpochSpanMap::clone(&snapshot));

        self.entries
            .lock()
            .modify(epoch, |entry| {
                ensure!(
                    entry.state == EntryState::Flushing,
                    ConsistencyViolation::FlushedEntryChanged { epoch },
                );

                entry.state = if result.is_ok() && entry.version == version {
                    EntryState::Clean
                } else {
                    EntryState::Dirty
                };

                Ok(())
            })
            .ok_or(ConsistencyViolation::FlushedEntryMissing { epoch })??;

        result
    }

    fn evict_clean_entries(&self) {
        let mut entries = self.entries.lock();

        let clean_epochs = entries
            .map
            .iter()
            .filter(|(_, entry)| entry.state == EntryState::Clean)
            .map(|(epoch, _)| *epoch)
            .sorted_unstable()
            .collect_vec();

        let excess = clean_epochs
            .len()
            .saturating_sub(self.config.max_clean_epochs);

        for epoch in clean_epochs.into_iter().take(excess) {
            entries.remove(epoch);
        }
    }

    fn cached_spans(&self, epoch: Epoch) -> Option<Arc<EpochSpanMap>> {
        self.entries
            .lock()
            .get(epoch)
            .map(|entry| Arc::clone(&entry.spans))
    }

    fn try_update_cached(&self, epoch: Epoch, spans: &[(ValidatorIndex, SpanPair)]) -> bool {
        let mut entries = self.entries.lock();

        if entries.modify(epoch, |entry| entry.update(spans)).is_none() {
            return false;
        }

        self.request_flush_if_full(&entries);

        true
    }

    // Entries are flushed as whole maps, so a new entry has to start from the persisted one.
    // Callers must hold `backend_writes`, which keeps a concurrent delete from making the loaded
    // map stale.
    fn seed_entry(&self, epoch: Epoch, spans: &[(ValidatorIndex, SpanPair)]) -> Result<()> {
        if self.try_update_cached(epoch, spans) {
            return Ok(());
        }

        let mut persisted = self.backend.get(epoch)?;

        let mut entries = self.entries.lock();

        // A full write landed while the persisted map was being read. It takes precedence.
        if entries.modify(epoch, |entry| entry.update(spans)).is_none() {
            persisted.extend(spans.iter().copied());
            entries.insert(epoch, CacheEntry::dirty(persisted));
        }

        self.request_flush_if_full(&entries);

        Ok(())
    }

    fn request_flush_if_full(&self, entries: &Entries) {
        if entries.dirty_count >= self.config.max_dirty_epochs {
            self.flush_requested.notify_one();
        }
    }

    fn dirty_epochs(&self) -> Vec<Epoch> {
        self.entries
            .lock()
            .map
            .iter()
            .filter(|(_, entry)| entry.is_dirty())
            .map(|(epoch, _)| *epoch)
            .sorted_unstable()
            .collect()
    }
}

impl<S: SpanStorage> SpanStorage for SpanCache<S> {
    fn get(&self, epoch: Epoch) -> Result<EpochSpanMap> {
        match self.cached_spans(epoch) {
            Some(spans) => Ok(EpochSpanMap::clone(&spans)),
            None => self.backend.get(epoch),
        }
    }

    fn validator_span(&self, epoch: Epoch, validator_index: ValidatorIndex) -> Result<SpanPair> {
        match self.cached_spans(epoch) {
            Some(spans) => Ok(spans.get(&validator_index).copied().unwrap_or_default()),
            None => self.backend.validator_span(epoch, validator_index),
        }
    }

    fn put(&self, epoch: Epoch, spans: EpochSpanMap) -> Result<()> {
        let mut entries = self.entries.lock();

        if entries.contains(epoch) {
            entries.modify(epoch, |entry| entry.replace(spans));
        } else {
            entries.insert(epoch, CacheEntry::dirty(spans));
        }

        self.request_flush_if_full(&entries);

        Ok(())
    }

    fn put_validator_spans(
        &self,
        epoch: Epoch,
        spans: &[(ValidatorIndex, SpanPair)],
    ) -> Result<()> {
        if self.try_update_cached(epoch, spans) {
            return Ok(());
        }

        let _backend_writes = self.backend_writes.lock();

        self.seed_entry(epoch, spans)
    }

    // Cached epochs are updated under one lock. Uncached ones are then seeded together.
    fn put_span_updates(&self, updates: &[SpanUpdate]) -> Result<()> {
        let mut uncached = vec![];

        {
            let mut entries = self.entries.lock();

            for (epoch, spans) in span_storage::group_by_epoch(updates) {
                if entries.modify(epoch, |entry| entry.update(&spans)).is_none() {
                    uncached.push((epoch, spans));
                }
            }

            self.request_flush_if_full(&entries);
        }

        if uncached.is_empty() {
            return Ok(());
        }

        let _backend_writes = self.backend_writes.lock();

        for (epoch, spans) in uncached {
            self.seed_entry(epoch, &spans)?;
        }

        Ok(())
    }

    fn delete(&self, epoch: Epoch) -> Result<()> {
        // Waits for any flush in progress, so the flushed data is deleted along with the rest.
        let _backend_writes = self.backend_writes.lock();

        let previous = self.entries.lock().insert(epoch, CacheEntry::deleting());

        let result = self.backend.delete(epoch);

        let mut entries = self.entries.lock();

        let written_during_delete = entries
            .get(epoch)
            .is_some_and(|entry| entry.state != EntryState::Deleting);

        if !written_during_delete {
            match (&result, previous) {
                (Err(_), Some(previous)) => {
                    entries.insert(epoch, previous);
                }
                _ => {
                    entries.remove(epoch);
                }
            }

            return result;
        }

        // Writes made while the delete was in progress replaced the tombstone and must be kept.
        let Err(error) = result else {
            entries.modify(epoch, |entry| entry.partial = false);
            return Ok(());
        };

        if !entries.get(epoch).is_some_and(|entry| entry.partial) {
            return Err(error);
        }

        // The backend still holds the spans the delete was meant to remove.
        let base = match previous {
            Some(previous) => Ok(EpochSpanMap::clone(&previous.spans)),
            None => {
                drop(entries);
                let base = self.backend.get(epoch);
                entries = self.entries.lock();
                base
            }
        };

        match base {
            Ok(base) => {
                entries.modify(epoch, |entry| entry.rebase(base));
                Err(error)
            }
            Err(load_error) => {
                if entries.get(epoch).is_some_and(|entry| entry.partial) {
                    entries.remove(epoch);
                }

                Err(error.context(format!(
                    "spans written during the delete were dropped because the persisted spans \
                     could not be read: {load_error:?}",
                )))
            }
        }
    }

    fn epochs(&self) -> Result<Vec<Epoch>> {
        let mut epochs = self.backend.epochs()?.into_iter().collect::<BTreeSet<_>>();

        for (epoch, entry) in &self.entries.lock().map {
            if entry.spans.is_empty() {
                epochs.remove(epoch);
            } else {
                epochs.insert(*epoch);
            }
        }

        Ok(epochs.into_iter().collect())
    }

    fn flush(&self, epoch: Epoch) -> Result<()> {
        let _backend_writes = self.backend_writes.lock();

        self.flush_entry(epoch)
            .context(FlushError {
                epochs: vec![epoch],
            })
    }

    fn flush_all(&self) -> Result<()> {
        let _backend_writes = self.backend_writes.lock();

        let mut failed_epochs = vec![];
        let mut first_error = None;

        for epoch in self.dirty_epochs() {
            if let Err(error) = self.flush_entry(epoch) {
                debug!("failed to flush spans (epoch: {epoch}): {error:?}");

                failed_epochs.push(epoch);
                first_error.get_or_insert(error);
            }
        }

        match first_error {
            Some(error) => Err(error.context(FlushError {
                epochs: failed_epochs,
            })),
            None => Ok(()),
        }
    }

    fn dirty_count(&self) -> usize {
        self.entries.lock().dirty_count
    }
}
