pub use crate::{
    messages::{AttestationToSlasher, SlasherToValidator, ValidatorToSlasher},
    primitives::{Epoch, EpochSpanMap, ValidatorIndex},
    slasher::{run_slasher, Channels, Slasher},
    slasher_config::{SlasherConfig, SpanCacheConfig},
    span_cache::{ConsistencyViolation, FlushError, SpanCache},
    span_pair::{SpanPair, SpanPairError, SPAN_PAIR_LENGTH},
    span_storage::SpanStorage,
    span_store::{SpanStore, StorageError},
    status::{AttesterSlashingReason, ExplainedAttesterSlashing},
    surround_detector::{
        AttestationRecord, AttestationVerdict, InvalidAttestation, SpanUpdate, SurroundDetector,
    },
};

mod messages;
mod primitives;
mod slasher;
mod slasher_config;
mod span_cache;
mod span_pair;
mod span_storage;
mod span_store;
mod status;
mod surround_detector;
