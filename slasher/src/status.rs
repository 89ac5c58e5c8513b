use crate::primitives::{Epoch, ValidatorIndex};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AttesterSlashingReason {
    Surrounding,
    Surrounded,
}

/// A slashable vote together with the conflicting vote it was detected against.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ExplainedAttesterSlashing {
    pub validator_index: ValidatorIndex,
    pub source: Epoch,
    pub target: Epoch,
    // Spans only record distances, so the source of the earlier vote is not known.
    pub existing_target: Epoch,
    pub reason: AttesterSlashingReason,
}
