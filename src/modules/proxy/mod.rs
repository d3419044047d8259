//! Relay rotation and health tracking.
//!
//! Hands out the relay each attempt should go through, counts failures, and
//! benches relays that keep failing so later attempts land elsewhere.

use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::time::{Duration, Instant};

use serde::Deserialize;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    Sequential,
    Random,
    /// Prefer the relay with the best success rate, least recently used first.
    Smart,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub rotation_strategy: RotationStrategy,
    pub ban_time: Duration,
    /// Consecutive failures after which a relay is benched.
    pub failure_threshold: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            rotation_strategy: RotationStrategy::Sequential,
            ban_time: Duration::from_secs(60),
            failure_threshold: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayHealthReport {
    pub total_relays: usize,
    pub available_relays: usize,
    pub banned_relays: usize,
    /// Per-relay counters in pool order, keyed by the redacted endpoint.
    pub details: Vec<(String, RelayStats)>,
}

#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub last_used: Option<Instant>,
}

#[derive(Debug, Clone)]
struct RelayEntry {
    endpoint: String,
    stats: RelayStats,
    banned_until: Option<Instant>,
}

impl RelayEntry {
    fn is_available(&self, now: Instant) -> bool {
        self.banned_until.is_none_or(|until| now >= until)
    }

    fn success_rate(&self) -> f64 {
        let total = self.stats.successes + self.stats.failures;
        if total == 0 {
            1.0
        } else {
            self.stats.successes as f64 / total as f64
        }
    }
}

/// Pool of relay endpoints with rotation policies.
#[derive(Debug)]
pub struct RelayPool {
    config: RelayConfig,
    relays: Vec<RelayEntry>,
    cursor: usize,
}

impl RelayPool {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            relays: Vec::new(),
            cursor: 0,
        }
    }

    pub fn load<I>(&mut self, relays: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.relays.clear();
        self.cursor = 0;
        for relay in relays {
            self.add_relay(relay);
        }
    }

    pub fn add_relay(&mut self, relay: impl Into<String>) {
        let endpoint = relay.into();
        if self.relays.iter().any(|entry| entry.endpoint == endpoint) {
            return;
        }
        self.relays.push(RelayEntry {
            endpoint,
            stats: RelayStats::default(),
            banned_until: None,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Relay for the next attempt. When every relay is benched, the one whose
    /// ban expires first is released early rather than stalling the caller.
    pub fn next_relay(&mut self) -> Option<String> {
        if self.relays.is_empty() {
            return None;
        }

        let now = Instant::now();
        let available: Vec<usize> = (0..self.relays.len())
            .filter(|&idx| self.relays[idx].is_available(now))
            .collect();

        let selected = if available.is_empty() {
            let idx = self
                .relays
                .iter()
                .enumerate()
                .min_by_key(|(_, entry)| entry.banned_until.unwrap_or(now))
                .map(|(idx, _)| idx)?;
            log::debug!(
                "all relays benched, releasing {}",
                redact_relay(&self.relays[idx].endpoint)
            );
            idx
        } else {
            match self.config.rotation_strategy {
                RotationStrategy::Sequential => {
                    let idx = available[self.cursor % available.len()];
                    self.cursor = self.cursor.wrapping_add(1);
                    idx
                }
                RotationStrategy::Random => *available.choose(&mut rand::thread_rng())?,
                RotationStrategy::Smart => *available.iter().max_by(|&&a, &&b| {
                    let lhs = &self.relays[a];
                    let rhs = &self.relays[b];
                    lhs.success_rate()
                        .partial_cmp(&rhs.success_rate())
                        .unwrap_or(Ordering::Equal)
                        .then_with(|| rhs.stats.last_used.cmp(&lhs.stats.last_used))
                })?,
            }
        };

        let entry = &mut self.relays[selected];
        entry.banned_until = None;
        entry.stats.last_used = Some(now);
        Some(entry.endpoint.clone())
    }

    pub fn report_success(&mut self, relay: &str) {
        if let Some(entry) = self.relays.iter_mut().find(|entry| entry.endpoint == relay) {
            entry.stats.successes += 1;
            entry.stats.consecutive_failures = 0;
            entry.banned_until = None;
        }
    }

    pub fn report_failure(&mut self, relay: &str) {
        let threshold = self.config.failure_threshold.max(1);
        let ban_time = self.config.ban_time;
        if let Some(entry) = self.relays.iter_mut().find(|entry| entry.endpoint == relay) {
            entry.stats.failures += 1;
            entry.stats.consecutive_failures += 1;
            if entry.stats.consecutive_failures >= threshold {
                log::info!(
                    "benching relay {} for {:?}",
                    redact_relay(&entry.endpoint),
                    ban_time
                );
                entry.stats.consecutive_failures = 0;
                entry.banned_until = Some(Instant::now() + ban_time);
            }
        }
    }

    pub fn health_report(&self) -> RelayHealthReport {
        let now = Instant::now();
        let available = self
            .relays
            .iter()
            .filter(|entry| entry.is_available(now))
            .count();
        RelayHealthReport {
            total_relays: self.relays.len(),
            available_relays: available,
            banned_relays: self.relays.len() - available,
            details: self
                .relays
                .iter()
                .map(|entry| (redact_relay(&entry.endpoint), entry.stats.clone()))
                .collect(),
        }
    }
}

/// Relay endpoint with its credentials stripped, safe for logs and events.
pub fn redact_relay(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(mut url) => {
            if url.username().is_empty() && url.password().is_none() {
                return endpoint.to_owned();
            }
            let _ = url.set_password(None);
            let _ = url.set_username("");
            url.to_string()
        }
        Err(_) => match endpoint.rsplit_once('@') {
            Some((_, host)) => format!("***@{host}"),
            None => endpoint.to_owned(),
        },
    }
}

impl Default for RelayPool {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}
