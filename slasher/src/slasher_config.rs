use core::time::Duration;

use derivative::Derivative;

#[derive(Clone, Copy, Debug, Derivative)]
#[derivative(Default)]
pub struct SlasherConfig {
    #[derivative(Default(value = "54000"))]
    pub slashing_history_limit: u64,
    // Off by default. Without the cache every write is durable when it returns.
    pub use_span_cache: bool,
    pub span_cache: SpanCacheConfig,
}

#[derive(Clone, Copy, Debug, Derivative)]
#[derivative(Default)]
pub struct SpanCacheConfig {
    /// Must be nonzero.
    #[derivative(Default(value = "Duration::from_secs(10)"))]
    pub flush_interval: Duration,
    /// Number of epochs with unflushed writes that triggers an early flush.
    #[derivative(Default(value = "256"))]
    pub max_dirty_epochs: usize,
    #[derivative(Default(value = "1024"))]
    pub max_clean_epochs: usize,
}
