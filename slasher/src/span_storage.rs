use anyhow::Result;
use itertools::Itertools as _;

use crate::{
    primitives::{Epoch, EpochSpanMap, ValidatorIndex},
    span_pair::SpanPair,
    surround_detector::SpanUpdate,
};

/// Read/write access to spans, implemented by [`SpanStore`] and [`SpanCache`].
///
/// [`SpanStore`]: crate::SpanStore
/// [`SpanCache`]: crate::SpanCache
pub trait SpanStorage: Send + Sync {
    /// Returns every span recorded at `epoch`, or an empty map if there are none.
    fn get(&self, epoch: Epoch) -> Result<EpochSpanMap>;

    /// Returns the span of one validator at `epoch`, or the zero pair if there is none.
    fn validator_span(&self, epoch: Epoch, validator_index: ValidatorIndex) -> Result<SpanPair>;

    /// Replaces all spans recorded at `epoch`.
    fn put(&self, epoch: Epoch, spans: EpochSpanMap) -> Result<()>;

    /// Overwrites the spans of the given validators at `epoch`, keeping those of other validators.
    fn put_validator_spans(&self, epoch: Epoch, spans: &[(ValidatorIndex, SpanPair)])
        -> Result<()>;

    /// Writes span updates that may cover many epochs.
    ///
    /// The default implementation writes each epoch separately.
    fn put_span_updates(&self, updates: &[SpanUpdate]) -> Result<()> {
        for (epoch, spans) in group_by_epoch(updates) {
            self.put_validator_spans(epoch, &spans)?;
        }

        Ok(())
    }

    /// Removes all spans recorded at `epoch`. Deleting an epoch with no spans is not an error.
    fn delete(&self, epoch: Epoch) -> Result<()>;

    /// Returns epochs that have spans recorded, in ascending order.
    fn epochs(&self) -> Result<Vec<Epoch>>;

    /// Returns validators with a nonzero span at `epoch`, in ascending order.
    fn validators_with_spans(&self, epoch: Epoch) -> Result<Vec<ValidatorIndex>> {
        let mut validator_indices = self
            .get(epoch)?
            .into_iter()
            .filter(|(_, span_pair)| !span_pair.is_zero())
            .map(|(validator_index, _)| validator_index)
            .collect::<Vec<_>>();

        validator_indices.sort_unstable();

        Ok(validator_indices)
    }

    fn flush(&self, _epoch: Epoch) -> Result<()> {
        Ok(())
    }

    fn flush_all(&self) -> Result<()> {
        Ok(())
    }

    /// Number of epochs with writes that have not been persisted yet.
    fn dirty_count(&self) -> usize {
        0
    }
}

pub fn group_by_epoch(
    updates: &[SpanUpdate],
) -> impl Iterator<Item = (Epoch, Vec<(ValidatorIndex, SpanPair)>)> {
    updates
        .iter()
        .map(|update| (update.epoch, (update.validator_index, update.span_pair)))
        .into_group_map()
        .into_iter()
        .sorted_unstable_by_key(|(epoch, _)| *epoch)
}
