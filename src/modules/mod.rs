//! Cross-cutting services module
//!
//! Shared state and side channels used by every acquisition: admission
//! control, the paired result cache, relay rotation, events and metrics.

pub mod cache;
pub mod events;
pub mod gate;
pub mod metrics;
pub mod proxy;

// Re-export commonly used types
pub use cache::{PairedResultCache, StoreOutcome};
pub use events::{
    AttemptEvent, CacheHitEvent, CheckEvent, EventDispatcher, EventHandler, FailureEvent,
    LoggingHandler, MetricsHandler, ResponseEvent, RetryEvent, RetryTier,
};
pub use gate::{ConcurrencyGate, GatePermit, GateStats};
pub use metrics::{GlobalStats, KindStats, MetricsCollector, MetricsSnapshot};
pub use proxy::{
    RelayConfig, RelayHealthReport, RelayPool, RelayStats, RotationStrategy, redact_relay,
};
