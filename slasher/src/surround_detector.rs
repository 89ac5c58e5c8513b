use std::sync::Arc;

use anyhow::{ensure, Result};
use derive_more::Constructor;
use log::debug;
use parking_lot::Mutex;
use thiserror::Error;

use crate::{
    primitives::{Epoch, ValidatorIndex},
    span_pair::SpanPair,
    span_storage::SpanStorage,
    status::{AttesterSlashingReason, ExplainedAttesterSlashing},
};

#[derive(Debug, Error)]
#[error("attestation source epoch {source_epoch} is after its target epoch {target_epoch}")]
pub struct InvalidAttestation {
    pub source_epoch: Epoch,
    pub target_epoch: Epoch,
}

/// A vote by one validator, already verified by the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Constructor)]
pub struct AttestationRecord {
    pub validator_index: ValidatorIndex,
    pub source: Epoch,
    pub target: Epoch,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SpanUpdate {
    pub epoch: Epoch,
    pub validator_index: ValidatorIndex,
    pub span_pair: SpanPair,
}

#[derive(PartialEq, Eq, Debug)]
pub struct AttestationVerdict {
    pub slashing: Option<ExplainedAttesterSlashing>,
    pub span_updates: Vec<SpanUpdate>,
}

// Min-max surround detection as described in https://hackmd.io/@sproul/min-max-slasher.
//
// `process` reads spans and writes them back in separate steps. `process_lock` serializes calls
// so that one vote cannot overwrite the updates of another.
pub struct SurroundDetector {
    storage: Arc<dyn SpanStorage>,
    history_length: u64,
    process_lock: Mutex<()>,
}

impl SurroundDetector {
    #[must_use]
    pub fn new(storage: Arc<dyn SpanStorage>, history_length: u64) -> Self {
        Self {
            storage,
            history_length,
            process_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn storage(&self) -> &dyn SpanStorage {
        self.storage.as_ref()
    }

    /// Checks `record` against recorded spans and records it.
    ///
    /// Spans are updated even if the vote is slashable.
    pub fn process(&self, record: AttestationRecord) -> Result<AttestationVerdict> {
        debug!(
            "processing attestation record (validator_index: {}, source: {}, target: {})",
            record.validator_index, record.source, record.target,
        );

        let _process_guard = self.process_lock.lock();

        let slashing = self.check(record)?;
        let span_updates = self.span_updates(record)?;

        self.storage.put_span_updates(&span_updates)?;

        Ok(AttestationVerdict {
            slashing,
            span_updates,
        })
    }

    pub fn check(&self, record: AttestationRecord) -> Result<Option<ExplainedAttesterSlashing>> {
        let distance = Self::distance(record)?;

        let AttestationRecord {
            validator_index,
            source,
            target,
        } = record;

        let span_pair = self.storage.validator_span(source, validator_index)?;

        let explain = |span: u16, reason| ExplainedAttesterSlashing {
            validator_index,
            source,
            target,
            existing_target: source.saturating_add(span.into()),
            reason,
        };

        if span_pair.min_span != 0 && distance > span_pair.min_span {
            return Ok(Some(explain(
                span_pair.min_span,
                AttesterSlashingReason::Surrounding,
            )));
        }

        if span_pair.max_span != 0 && distance < span_pair.max_span {
            return Ok(Some(explain(
                span_pair.max_span,
                AttesterSlashingReason::Surrounded,
            )));
        }

        Ok(None)
    }

    /// Computes the spans that change once `record` is recorded without writing them.
    pub fn span_updates(&self, record: AttestationRecord) -> Result<Vec<SpanUpdate>> {
        Self::distance(record)?;

        let mut updates = self.min_span_updates(record)?;
        updates.extend(self.max_span_updates(record)?);

        Ok(updates)
    }

    fn distance(record: AttestationRecord) -> Result<u16> {
        let AttestationRecord { source, target, .. } = record;

        ensure!(
            source <= target,
            InvalidAttestation {
                source_epoch: source,
                target_epoch: target,
            },
        );

        Ok(SpanPair::saturating_distance(target - source))
    }

    // Every epoch before the source now has a vote with a later source targeting `target`.
    fn min_span_updates(&self, record: AttestationRecord) -> Result<Vec<SpanUpdate>> {
        let AttestationRecord {
            validator_index,
            source,
            target,
        } = record;

        let min_epoch = target.saturating_sub(self.history_length);
        let mut epoch = source;
        let mut updates = vec![];

        while epoch > min_epoch {
            epoch -= 1;

            let span_pair = self.storage.validator_span(epoch, validator_index)?;
            let min_span = SpanPair::saturating_distance(target - epoch);

            if span_pair.min_span != 0 && span_pair.min_span <= min_span {
                break;
            }

            updates.push(SpanUpdate {
                epoch,
                validator_index,
                span_pair: span_pair.with_min_span(min_span),
            });
        }

        Ok(updates)
    }

    // Every epoch strictly between source and target is now inside a vote.
    // Epochs before `target - history_length` are pruned, so they are not updated either.
    fn max_span_updates(&self, record: AttestationRecord) -> Result<Vec<SpanUpdate>> {
        let AttestationRecord {
            validator_index,
            source,
            target,
        } = record;

        let start = source
            .saturating_add(1)
            .max(target.saturating_sub(self.history_length));

        let mut updates = vec![];

        for epoch in start..target {
            let span_pair = self.storage.validator_span(epoch, validator_index)?;
            let max_span = SpanPair::saturating_distance(target - epoch);

            if span_pair.max_span >= max_span {
                break;
            }

            updates.push(SpanUpdate {
                epoch,
                validator_index,
                span_pair: span_pair.with_max_span(max_span),
            });
        }

        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;

    use database::Database;
    use test_case::test_case;

    use crate::{
        primitives::EpochSpanMap, slasher_config::SpanCacheConfig, span_cache::SpanCache,
        span_store::SpanStore,
    };

    use super::*;

    const HISTORY_LENGTH: u64 = 54000;
    const VALIDATOR_INDEX: ValidatorIndex = 7;

    type Constructor = fn() -> Arc<dyn SpanStorage>;

    fn build_store() -> Arc<dyn SpanStorage> {
        Arc::new(SpanStore::new(Database::in_memory()))
    }

    fn build_cache() -> Arc<dyn SpanStorage> {
        Arc::new(SpanCache::new(
            SpanCacheConfig::default(),
            SpanStore::new(Database::in_memory()),
        ))
    }

    struct CountingStorage {
        store: SpanStore,
        span_update_batches: AtomicUsize,
        validator_span_writes: AtomicUsize,
    }

    impl CountingStorage {
        fn new() -> Self {
            Self {
                store: SpanStore::new(Database::in_memory()),
                span_update_batches: AtomicUsize::new(0),
                validator_span_writes: AtomicUsize::new(0),
            }
        }
    }

    impl SpanStorage for CountingStorage {
        fn get(&self, epoch: Epoch) -> Result<EpochSpanMap> {
            self.store.get(epoch)
        }

        fn validator_span(
            &self,
            epoch: Epoch,
            validator_index: ValidatorIndex,
        ) -> Result<SpanPair> {
            self.store.validator_span(epoch, validator_index)
        }

        fn put(&self, epoch: Epoch, spans: EpochSpanMap) -> Result<()> {
            self.store.put(epoch, spans)
        }

        fn put_validator_spans(
            &self,
            epoch: Epoch,
            spans: &[(ValidatorIndex, SpanPair)],
        ) -> Result<()> {
            self.validator_span_writes.fetch_add(1, Ordering::SeqCst);
            self.store.put_validator_spans(epoch, spans)
        }

        fn put_span_updates(&self, updates: &[SpanUpdate]) -> Result<()> {
            self.span_update_batches.fetch_add(1, Ordering::SeqCst);
            self.store.put_span_updates(updates)
        }

        fn delete(&self, epoch: Epoch) -> Result<()> {
            self.store.delete(epoch)
        }

        fn epochs(&self) -> Result<Vec<Epoch>> {
            self.store.epochs()
        }
    }

    fn vote(source: Epoch, target: Epoch) -> AttestationRecord {
        AttestationRecord::new(VALIDATOR_INDEX, source, target)
    }

    fn detector_with_votes(
        constructor: Constructor,
        votes: &[(Epoch, Epoch)],
    ) -> Result<SurroundDetector> {
        let detector = SurroundDetector::new(constructor(), HISTORY_LENGTH);

        for (source, target) in votes.iter().copied() {
            let verdict = detector.process(vote(source, target))?;
            assert_eq!(verdict.slashing, None);
        }

        Ok(detector)
    }

    #[test_case(build_store)]
    #[test_case(build_cache)]
    fn surround_detector_finds_surrounding_vote(constructor: Constructor) -> Result<()> {
        let detector = detector_with_votes(constructor, &[(2, 5), (10, 11), (4, 9)])?;

        assert_eq!(
            detector.check(vote(1, 6))?,
            Some(ExplainedAttesterSlashing {
                validator_index: VALIDATOR_INDEX,
                source: 1,
                target: 6,
                existing_target: 5,
                reason: AttesterSlashingReason::Surrounding,
            }),
        );

        Ok(())
    }

    #[test_case(build_store)]
    #[test_case(build_cache)]
    fn surround_detector_finds_surrounded_vote(constructor: Constructor) -> Result<()> {
        let detector = detector_with_votes(constructor, &[(2, 5), (10, 11), (4, 9)])?;

        assert_eq!(
            detector.check(vote(7, 8))?,
            Some(ExplainedAttesterSlashing {
                validator_index: VALIDATOR_INDEX,
                source: 7,
                target: 8,
                existing_target: 9,
                reason: AttesterSlashingReason::Surrounded,
            }),
        );

        Ok(())
    }

    #[test_case(1, 5; "same target as an earlier vote")]
    #[test_case(2, 5; "repeated vote")]
    #[test_case(5, 9; "same target, later source")]
    #[test_case(11, 12; "after all votes")]
    #[test_case(0, 1; "before all votes")]
    fn surround_detector_accepts_non_surround_votes(source: Epoch, target: Epoch) -> Result<()> {
        let detector = detector_with_votes(build_store, &[(2, 5), (10, 11), (4, 9)])?;

        assert_eq!(detector.check(vote(source, target))?, None);

        Ok(())
    }

    #[test]
    fn surround_detector_ignores_other_validators() -> Result<()> {
        let detector = detector_with_votes(build_store, &[(2, 5)])?;

        assert_eq!(detector.check(AttestationRecord::new(8, 1, 6))?, None);

        Ok(())
    }

    #[test]
    fn surround_detector_records_spans() -> Result<()> {
        let detector = SurroundDetector::new(build_store(), HISTORY_LENGTH);

        let verdict = detector.process(vote(2, 5))?;

        assert_eq!(
            verdict,
            AttestationVerdict {
                slashing: None,
                span_updates: vec![
                    SpanUpdate {
                        epoch: 1,
                        validator_index: VALIDATOR_INDEX,
                        span_pair: SpanPair::new(4, 0),
                    },
                    SpanUpdate {
                        epoch: 0,
                        validator_index: VALIDATOR_INDEX,
                        span_pair: SpanPair::new(5, 0),
                    },
                    SpanUpdate {
                        epoch: 3,
                        validator_index: VALIDATOR_INDEX,
                        span_pair: SpanPair::new(0, 2),
                    },
                    SpanUpdate {
                        epoch: 4,
                        validator_index: VALIDATOR_INDEX,
                        span_pair: SpanPair::new(0, 1),
                    },
                ],
            },
        );

        let storage = detector.storage();

        assert_eq!(storage.validator_span(0, VALIDATOR_INDEX)?, SpanPair::new(5, 0));
        assert_eq!(storage.validator_span(1, VALIDATOR_INDEX)?, SpanPair::new(4, 0));
        assert_eq!(storage.validator_span(2, VALIDATOR_INDEX)?, SpanPair::default());
        assert_eq!(storage.validator_span(3, VALIDATOR_INDEX)?, SpanPair::new(0, 2));
        assert_eq!(storage.validator_span(4, VALIDATOR_INDEX)?, SpanPair::new(0, 1));
        assert_eq!(storage.validator_span(5, VALIDATOR_INDEX)?, SpanPair::default());

        Ok(())
    }

    #[test]
    fn surround_detector_stops_at_tighter_spans() -> Result<()> {
        let detector = detector_with_votes(build_store, &[(2, 5), (10, 11)])?;

        let storage = detector.storage();

        // Epochs before 2 already have a tighter bound from the first vote.
        assert_eq!(storage.validator_span(1, VALIDATOR_INDEX)?, SpanPair::new(4, 0));
        assert_eq!(storage.validator_span(2, VALIDATOR_INDEX)?, SpanPair::new(9, 0));
        assert_eq!(storage.validator_span(3, VALIDATOR_INDEX)?, SpanPair::new(8, 2));
        assert_eq!(storage.validator_span(9, VALIDATOR_INDEX)?, SpanPair::new(2, 0));

        Ok(())
    }

    #[test]
    fn surround_detector_updates_spans_of_slashable_votes() -> Result<()> {
        let detector = detector_with_votes(build_store, &[(2, 5)])?;

        let verdict = detector.process(vote(1, 6))?;

        assert!(verdict.slashing.is_some());
        assert!(!verdict.span_updates.is_empty());
        assert_eq!(
            detector.storage().validator_span(5, VALIDATOR_INDEX)?,
            SpanPair::new(0, 1),
        );

        Ok(())
    }

    #[test]
    fn surround_detector_limits_min_spans_to_history() -> Result<()> {
        let detector = SurroundDetector::new(build_store(), 3);

        detector.process(vote(8, 10))?;

        assert_eq!(detector.storage().epochs()?, [7, 9]);
        assert_eq!(
            detector.storage().validator_span(7, VALIDATOR_INDEX)?,
            SpanPair::new(3, 0),
        );

        Ok(())
    }

    #[test]
    fn surround_detector_limits_max_spans_to_history() -> Result<()> {
        let detector = SurroundDetector::new(build_store(), 3);

        let verdict = detector.process(vote(0, 10))?;

        let updated_epochs = verdict
            .span_updates
            .iter()
            .map(|update| update.epoch)
            .collect::<Vec<_>>();

        assert_eq!(updated_epochs, [7, 8, 9]);
        assert_eq!(detector.storage().epochs()?, [7, 8, 9]);
        assert_eq!(
            detector.storage().validator_span(7, VALIDATOR_INDEX)?,
            SpanPair::new(0, 3),
        );

        Ok(())
    }

    #[test]
    fn surround_detector_writes_all_span_updates_at_once() -> Result<()> {
        let storage = Arc::new(CountingStorage::new());
        let detector_storage = Arc::clone(&storage);
        let detector = SurroundDetector::new(detector_storage, HISTORY_LENGTH);

        // The first vote of a validator updates min spans across the whole history.
        let verdict = detector.process(vote(60000, 60001))?;

        assert_eq!(verdict.span_updates.len(), 53999);
        assert_eq!(storage.span_update_batches.load(Ordering::SeqCst), 1);
        assert_eq!(storage.validator_span_writes.load(Ordering::SeqCst), 0);
        assert_eq!(
            storage.validator_span(6001, VALIDATOR_INDEX)?,
            SpanPair::new(54000, 0),
        );
        assert_eq!(
            storage.validator_span(6000, VALIDATOR_INDEX)?,
            SpanPair::default(),
        );
        assert_eq!(
            storage.validator_span(59999, VALIDATOR_INDEX)?,
            SpanPair::new(2, 0),
        );

        Ok(())
    }

    #[test_case(build_store)]
    #[test_case(build_cache)]
    fn surround_detector_concurrent_votes_match_sequential_ones(
        constructor: Constructor,
    ) -> Result<()> {
        let votes = [(2, 5), (10, 11), (4, 9), (1, 3), (6, 12), (0, 2), (8, 9), (3, 7)];

        let sequential = SurroundDetector::new(constructor(), HISTORY_LENGTH);

        for (source, target) in votes {
            sequential.process(vote(source, target))?;
        }

        let concurrent = SurroundDetector::new(constructor(), HISTORY_LENGTH);
        let barrier = Barrier::new(votes.len());

        std::thread::scope(|scope| {
            let concurrent = &concurrent;
            let barrier = &barrier;

            let handles = votes
                .into_iter()
                .map(|(source, target)| {
                    scope.spawn(move || {
                        barrier.wait();
                        concurrent.process(vote(source, target)).map(drop)
                    })
                })
                .collect::<Vec<_>>();

            for handle in handles {
                handle.join().expect("processing thread should not panic")?;
            }

            Ok::<_, anyhow::Error>(())
        })?;

        for epoch in 0..=12 {
            assert_eq!(
                concurrent.storage().validator_span(epoch, VALIDATOR_INDEX)?,
                sequential.storage().validator_span(epoch, VALIDATOR_INDEX)?,
            );
        }

        Ok(())
    }

    #[test]
    fn surround_detector_saturates_surrounded_distance() -> Result<()> {
        let detector = SurroundDetector::new(build_store(), HISTORY_LENGTH);

        // Recorded for an earlier vote whose target is 65539 epochs after epoch 1.
        // Wrapping would have stored 3 instead.
        detector
            .storage()
            .put_validator_spans(1, &[(VALIDATOR_INDEX, SpanPair::new(0, u16::MAX))])?;

        let slashing = detector
            .check(vote(1, 10))?
            .expect("vote should be surrounded");

        assert_eq!(slashing.reason, AttesterSlashingReason::Surrounded);
        assert_eq!(slashing.existing_target, 1 + u64::from(u16::MAX));

        Ok(())
    }

    #[test]
    fn surround_detector_saturates_surrounding_distance() -> Result<()> {
        let detector = SurroundDetector::new(build_store(), HISTORY_LENGTH);

        detector
            .storage()
            .put_validator_spans(1, &[(VALIDATOR_INDEX, SpanPair::new(5, 0))])?;

        // 65538 epochs would wrap to 2 and compare as smaller than 5.
        let slashing = detector
            .check(vote(1, 65539))?
            .expect("vote should be surrounding");

        assert_eq!(slashing.reason, AttesterSlashingReason::Surrounding);
        assert_eq!(slashing.existing_target, 6);

        Ok(())
    }

    #[test]
    fn surround_detector_rejects_source_after_target() {
        let detector = SurroundDetector::new(build_store(), HISTORY_LENGTH);

        let error = detector
            .process(vote(5, 4))
            .expect_err("source after target should be rejected");

        assert!(matches!(
            error.downcast_ref::<InvalidAttestation>(),
            Some(InvalidAttestation {
                source_epoch: 5,
                target_epoch: 4,
            }),
        ));
    }
}
