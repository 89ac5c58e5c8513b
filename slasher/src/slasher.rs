use core::convert::Infallible as Never;
use std::sync::Arc;

use anyhow::Result;
use database::Database;
use futures::{
    channel::mpsc::{UnboundedReceiver, UnboundedSender},
    select,
    stream::StreamExt as _,
};
use log::{debug, info, warn};

use crate::{
    messages::{AttestationToSlasher, SlasherToValidator, ValidatorToSlasher},
    primitives::Epoch,
    slasher_config::SlasherConfig,
    span_cache::SpanCache,
    span_storage::SpanStorage,
    span_store::SpanStore,
    surround_detector::{AttestationRecord, SurroundDetector},
};

pub struct Channels {
    pub slasher_to_validator_tx: UnboundedSender<SlasherToValidator>,
    pub attestation_to_slasher_rx: UnboundedReceiver<AttestationToSlasher>,
    pub validator_to_slasher_rx: UnboundedReceiver<ValidatorToSlasher>,
}

pub struct Slasher {
    config: SlasherConfig,
    detector: SurroundDetector,
    slasher_to_validator_tx: UnboundedSender<SlasherToValidator>,
    attestation_to_slasher_rx: UnboundedReceiver<AttestationToSlasher>,
    validator_to_slasher_rx: UnboundedReceiver<ValidatorToSlasher>,
}

impl Slasher {
    #[must_use]
    pub fn new(config: SlasherConfig, storage: Arc<dyn SpanStorage>, channels: Channels) -> Self {
        let Channels {
            slasher_to_validator_tx,
            attestation_to_slasher_rx,
            validator_to_slasher_rx,
        } = channels;

        Self {
            config,
            detector: SurroundDetector::new(storage, config.slashing_history_limit),
            slasher_to_validator_tx,
            attestation_to_slasher_rx,
            validator_to_slasher_rx,
        }
    }

    /// Processes messages until the attestation channel is closed or pruning fails.
    ///
    /// Spans written through a cache are flushed before returning, including after a failure.
    pub async fn run(mut self) -> Result<()> {
        let result = self.process_messages().await;

        info!("flushing spans before shutting down slasher");

        let flush_result = self.detector.storage().flush_all();

        match (result, flush_result) {
            (Ok(()), flush_result) => flush_result,
            (Err(error), Ok(())) => Err(error),
            (Err(error), Err(flush_error)) => Err(error.context(format!(
                "spans could not be flushed after the slasher stopped: {flush_error:?}",
            ))),
        }
    }

    async fn process_messages(&mut self) -> Result<()> {
        loop {
            select! {
                message = self.attestation_to_slasher_rx.next() => match message {
                    Some(AttestationToSlasher::Attestation(record)) => {
                        if let Err(error) = self.process_attestation(record) {
                            warn!("failed to process attestation record {record:?}: {error:?}");
                        }
                    }
                    None => {
                        info!("attestation channel closed");
                        return Ok(());
                    }
                },

                validator_message = self.validator_to_slasher_rx.select_next_some() => {
                    match validator_message {
                        ValidatorToSlasher::Epoch(epoch) => self.cleanup(epoch)?,
                    }
                },
            }
        }
    }

    fn process_attestation(&self, record: AttestationRecord) -> Result<()> {
        let verdict = self.detector.process(record)?;

        debug!(
            "attestation record processed (record: {record:?}, span_updates: {})",
            verdict.span_updates.len(),
        );

        if let Some(explained_attester_slashing) = verdict.slashing {
            info!("attester slashing constructed: {explained_attester_slashing:?}");

            SlasherToValidator::AttesterSlashing(explained_attester_slashing)
                .send(&self.slasher_to_validator_tx);
        }

        Ok(())
    }

    fn cleanup(&self, current_epoch: Epoch) -> Result<()> {
        let history_limit = self.config.slashing_history_limit;

        if history_limit >= current_epoch {
            return Ok(());
        }

        let oldest_kept_epoch = current_epoch - history_limit;
        let storage = self.detector.storage();
        let mut deleted = 0;

        for epoch in storage.epochs()? {
            if epoch >= oldest_kept_epoch {
                break;
            }

            storage.delete(epoch)?;
            deleted += 1;
        }

        if deleted > 0 {
            info!("pruned spans of {deleted} epochs older than epoch {oldest_kept_epoch}");
        }

        Ok(())
    }
}

/// Builds the span storage selected by `config` and runs the slasher on it.
///
/// With `use_span_cache` set, the cache's background flush task runs alongside the slasher
/// and is stopped once the slasher has flushed and returned. If the flush task stops first,
/// the slasher is stopped and the cache is flushed one last time.
pub async fn run_slasher(
    config: SlasherConfig,
    database: Database,
    channels: Channels,
) -> Result<()> {
    let store = SpanStore::new(database);

    if !config.use_span_cache {
        return Slasher::new(config, Arc::new(store), channels).run().await;
    }

    let cache = Arc::new(SpanCache::new(config.span_cache, store));
    let storage = Arc::clone(&cache);
    let slasher = Slasher::new(config, storage, channels);
    let mut slasher_task = tokio::spawn(slasher.run());
    let mut flush_task = tokio::spawn(Arc::clone(&cache).run());

    tokio::select! {
        result = &mut slasher_task => {
            flush_task.abort();
            result?
        }
        result = &mut flush_task => {
            slasher_task.abort();

            // Wait until the slasher has stopped writing before the final flush.
            if let Ok(Err(error)) = slasher_task.await {
                warn!("slasher failed while being stopped: {error:?}");
            }

            let flush_result = tokio::task::spawn_blocking(move || cache.flush_all()).await?;

            let error = match result {
                Ok(Ok(never)) => from_never(never),
                Ok(Err(error)) => error,
                Err(join_error) => join_error.into(),
            };

            match flush_result {
                Ok(()) => Err(error),
                Err(flush_error) => Err(error.context(format!(
                    "spans could not be flushed after the flush task stopped: {flush_error:?}",
                ))),
            }
        }
    }
}

const fn from_never<T>(never: Never) -> T {
    match never {}
}
