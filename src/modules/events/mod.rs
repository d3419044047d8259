//! Event system for acquisition activity.
//!
//! Provides hooks for logging, metrics, and custom reactions around every
//! attempt, response, cache hit, retry, and terminal failure.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::metrics::MetricsCollector;
use crate::challenges::core::{LookupKey, QueryKind};

/// Retry tier an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryTier {
    /// Challenge fetch timeouts.
    Challenge,
    /// Relay and connection failures.
    Relay,
    /// End-to-end acquisition.
    Check,
}

impl RetryTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RetryTier::Challenge => "challenge",
            RetryTier::Relay => "relay",
            RetryTier::Check => "check",
        }
    }
}

/// An upstream query is about to be issued.
#[derive(Debug, Clone)]
pub struct AttemptEvent {
    pub key: LookupKey,
    pub kind: QueryKind,
    pub relay: Option<String>,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

/// The upstream answered a query.
#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub key: LookupKey,
    pub kind: QueryKind,
    pub status: Option<i64>,
    pub code: Option<i64>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CacheHitEvent {
    pub key: LookupKey,
    pub kind: QueryKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub key: LookupKey,
    pub kind: QueryKind,
    pub tier: RetryTier,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Terminal failure of one acquisition.
#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub key: LookupKey,
    pub kind: QueryKind,
    pub error: String,
    pub fatal: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CheckEvent {
    Attempt(AttemptEvent),
    Response(ResponseEvent),
    CacheHit(CacheHitEvent),
    Retry(RetryEvent),
    Failure(FailureEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &CheckEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: CheckEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &CheckEvent) {
        match event {
            CheckEvent::Attempt(attempt) => {
                log::debug!(
                    "-> {} [{}] attempt {} via {}",
                    attempt.key,
                    attempt.kind,
                    attempt.attempt,
                    attempt.relay.as_deref().unwrap_or("direct")
                );
            }
            CheckEvent::Response(response) => {
                log::info!(
                    "VIN: {} - Check type: {} | status={:?} code={:?} ({:.2}s)",
                    response.key,
                    response.kind.label(),
                    response.status,
                    response.code,
                    response.latency.as_secs_f64()
                );
            }
            CheckEvent::CacheHit(hit) => {
                log::debug!("{} [{}] answered from paired cache", hit.key, hit.kind);
            }
            CheckEvent::Retry(retry) => {
                log::info!(
                    "retry {} [{}] {} tier attempt {} after {:.2}s: {}",
                    retry.key,
                    retry.kind,
                    retry.tier.as_str(),
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            CheckEvent::Failure(failure) => {
                log::warn!("{} [{}] failed: {}", failure.key, failure.kind, failure.error);
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &CheckEvent) {
        match event {
            CheckEvent::Response(response) => {
                self.metrics
                    .record_response(response.kind, response.status, response.latency);
            }
            CheckEvent::CacheHit(hit) => self.metrics.record_cache_hit(hit.kind),
            CheckEvent::Retry(retry) => self.metrics.record_retry(retry.kind, retry.tier),
            CheckEvent::Failure(failure) => self.metrics.record_failure(failure.kind, failure.fatal),
            CheckEvent::Attempt(_) => {}
        }
    }
}
