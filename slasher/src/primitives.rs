use std::collections::HashMap;

use crate::span_pair::SpanPair;

pub type Epoch = u64;
pub type ValidatorIndex = u64;

/// Spans of every validator that has any recorded at one epoch.
pub type EpochSpanMap = HashMap<ValidatorIndex, SpanPair>;
