use anyhow::Result;
use derive_more::Display;
use thiserror::Error;

const SPAN_SIZE: usize = size_of::<u16>();

pub const SPAN_PAIR_LENGTH: usize = 2 * SPAN_SIZE;

pub type SpanPairBytes = [u8; SPAN_PAIR_LENGTH];

#[derive(Debug, Error)]
#[error("span pair should be {SPAN_PAIR_LENGTH} bytes long but is {length}")]
pub struct SpanPairError {
    length: usize,
}

/// Distances from an epoch to the targets of previously recorded votes.
///
/// `min_span` is the smallest distance to the target of a vote with a later source.
/// `max_span` is the largest distance to the target of a vote with an earlier source.
/// Zero in either position means nothing has been recorded there.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Debug, Display)]
#[display("({min_span}, {max_span})")]
pub struct SpanPair {
    pub min_span: u16,
    pub max_span: u16,
}

impl SpanPair {
    #[must_use]
    pub const fn new(min_span: u16, max_span: u16) -> Self {
        Self { min_span, max_span }
    }

    /// Converts an epoch distance into a span, capping at [`u16::MAX`] instead of wrapping.
    #[must_use]
    pub fn saturating_distance(distance: u64) -> u16 {
        u16::try_from(distance).unwrap_or(u16::MAX)
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.min_span == 0 && self.max_span == 0
    }

    #[must_use]
    pub const fn with_min_span(self, min_span: u16) -> Self {
        Self { min_span, ..self }
    }

    #[must_use]
    pub const fn with_max_span(self, max_span: u16) -> Self {
        Self { max_span, ..self }
    }

    #[must_use]
    pub fn to_bytes(self) -> SpanPairBytes {
        let mut bytes = [0; SPAN_PAIR_LENGTH];
        bytes[..SPAN_SIZE].copy_from_slice(&self.min_span.to_le_bytes());
        bytes[SPAN_SIZE..].copy_from_slice(&self.max_span.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bytes = SpanPairBytes::try_from(bytes).map_err(|_| SpanPairError {
            length: bytes.len(),
        })?;

        let [min_0, min_1, max_0, max_1] = bytes;

        Ok(Self {
            min_span: u16::from_le_bytes([min_0, min_1]),
            max_span: u16::from_le_bytes([max_0, max_1]),
        })
    }
}

impl From<(u16, u16)> for SpanPair {
    fn from((min_span, max_span): (u16, u16)) -> Self {
        Self::new(min_span, max_span)
    }
}
