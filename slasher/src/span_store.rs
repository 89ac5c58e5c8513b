use anyhow::{Context as _, Result};
use database::Database;
use derive_more::Constructor;
use thiserror::Error;

use crate::{
    primitives::{Epoch, EpochSpanMap, ValidatorIndex},
    span_pair::SpanPair,
    span_storage::SpanStorage,
    surround_detector::SpanUpdate,
};

const EPOCH_SIZE: usize = size_of::<Epoch>();
const VALIDATOR_INDEX_SIZE: usize = size_of::<ValidatorIndex>();
const SPAN_KEY_LENGTH: usize = EPOCH_SIZE + VALIDATOR_INDEX_SIZE;

// Epoch,ValidatorIndex -> SpanPair
//
// Big-endian so that keys of one epoch are contiguous and sorted by validator index.
type SpanKey = [u8; SPAN_KEY_LENGTH];
type EpochPrefix = [u8; EPOCH_SIZE];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to read spans (epoch: {epoch})")]
    Get { epoch: Epoch },
    #[error("failed to read span (epoch: {epoch}, validator_index: {validator_index})")]
    GetValidatorSpan {
        epoch: Epoch,
        validator_index: ValidatorIndex,
    },
    #[error("failed to write spans (epoch: {epoch})")]
    Put { epoch: Epoch },
    #[error("failed to write {count} span updates")]
    PutSpanUpdates { count: usize },
    #[error("failed to delete spans (epoch: {epoch})")]
    Delete { epoch: Epoch },
    #[error("failed to list epochs with spans")]
    Epochs,
}

/// Spans persisted in a [`Database`], one row per epoch and validator.
#[derive(Constructor)]
pub struct SpanStore {
    db: Database,
}

impl SpanStore {
    fn key(epoch: Epoch, validator_index: ValidatorIndex) -> SpanKey {
        let mut key = [0; SPAN_KEY_LENGTH];
        key[..EPOCH_SIZE].copy_from_slice(&epoch.to_be_bytes());
        key[EPOCH_SIZE..].copy_from_slice(&validator_index.to_be_bytes());
        key
    }

    // Upper bounds are exclusive, so `Epoch::MAX` needs a prefix one byte longer than any key.
    fn epoch_range(epoch: Epoch) -> core::ops::Range<Vec<u8>> {
        let start = epoch.to_be_bytes().to_vec();

        let end = match epoch.checked_add(1) {
            Some(next_epoch) => next_epoch.to_be_bytes().to_vec(),
            None => vec![u8::MAX; SPAN_KEY_LENGTH + 1],
        };

        start..end
    }

    fn parse_key(key: &[u8]) -> Result<(Epoch, ValidatorIndex)> {
        let key = SpanKey::try_from(key)?;
        let (epoch_bytes, validator_index_bytes) = key.split_at(EPOCH_SIZE);

        let epoch = Epoch::from_be_bytes(EpochPrefix::try_from(epoch_bytes)?);
        let validator_index = ValidatorIndex::from_be_bytes(validator_index_bytes.try_into()?);

        Ok((epoch, validator_index))
    }

    fn read_epoch(&self, epoch: Epoch) -> Result<EpochSpanMap> {
        let pairs = self.db.iterator_range(Self::epoch_range(epoch))?;

        itertools::process_results(pairs, |pairs| {
            pairs
                .map(|(key, value)| {
                    let (_, validator_index) = Self::parse_key(&key)?;
                    let span_pair = SpanPair::from_bytes(&value)?;
                    Ok((validator_index, span_pair))
                })
                .collect()
        })?
    }

    fn read_epochs(&self) -> Result<Vec<Epoch>> {
        let mut epochs = vec![];
        let mut next_key = Self::key(0, 0).to_vec();

        while let Some((key, _)) = self.db.next(&next_key)? {
            let (epoch, _) = Self::parse_key(&key)?;

            epochs.push(epoch);

            match epoch.checked_add(1) {
                Some(next_epoch) => next_key = Self::key(next_epoch, 0).to_vec(),
                None => break,
            }
        }

        Ok(epochs)
    }
}

impl SpanStorage for SpanStore {
    fn get(&self, epoch: Epoch) -> Result<EpochSpanMap> {
        self.read_epoch(epoch)
            .context(StorageError::Get { epoch })
    }

    fn validator_span(&self, epoch: Epoch, validator_index: ValidatorIndex) -> Result<SpanPair> {
        let key = Self::key(epoch, validator_index);

        self.db
            .get(key)
            .and_then(|bytes| match bytes {
                Some(bytes) => SpanPair::from_bytes(&bytes),
                None => Ok(SpanPair::default()),
            })
            .context(StorageError::GetValidatorSpan {
                epoch,
                validator_index,
            })
    }

    fn put(&self, epoch: Epoch, spans: EpochSpanMap) -> Result<()> {
        let rows = spans
            .into_iter()
            .map(|(validator_index, span_pair)| {
                (Self::key(epoch, validator_index), span_pair.to_bytes())
            });

        self.db
            .replace_range(Self::epoch_range(epoch), rows)
            .context(StorageError::Put { epoch })
    }

    fn put_validator_spans(
        &self,
        epoch: Epoch,
        spans: &[(ValidatorIndex, SpanPair)],
    ) -> Result<()> {
        let rows = spans.iter().map(|(validator_index, span_pair)| {
            (Self::key(epoch, *validator_index), span_pair.to_bytes())
        });

        self.db
            .put_batch(rows)
            .context(StorageError::Put { epoch })
    }

    // All epochs go into one transaction.
    fn put_span_updates(&self, updates: &[SpanUpdate]) -> Result<()> {
        let rows = updates.iter().map(|update| {
            (
                Self::key(update.epoch, update.validator_index),
                update.span_pair.to_bytes(),
            )
        });

        self.db
            .put_batch(rows)
            .context(StorageError::PutSpanUpdates {
                count: updates.len(),
            })
    }

    fn delete(&self, epoch: Epoch) -> Result<()> {
        self.db
            .delete_range(Self::epoch_range(epoch))
            .context(StorageError::Delete { epoch })
    }

    fn epochs(&self) -> Result<Vec<Epoch>> {
        self.read_epochs().context(StorageError::Epochs)
    }
}
