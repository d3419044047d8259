//! Relay request execution.
//!
//! Every attempt opens a new relay-backed session, acquires a fresh challenge
//! over it and submits the query. Relay and transport failures are retried
//! with a jittered delay; anything else propagates after the first attempt.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;

use super::acquirer::{AcquireError, ChallengeAcquirer};
use super::core::{
    DelayStrategy, LookupKey, QueryDescriptor, QueryKind, RawResponse, RelayConnector,
    RelaySession, RetryError, RetryPolicy, TransportError,
};
use crate::modules::events::{
    AttemptEvent, CheckEvent, EventDispatcher, ResponseEvent, RetryEvent, RetryTier,
};
use crate::modules::proxy::redact_relay;

/// Failure of a single relay attempt.
#[derive(Debug, Clone, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Challenge(#[from] AcquireError),
}

impl AttemptError {
    pub fn is_relay_transient(&self) -> bool {
        match self {
            AttemptError::Transport(err) => err.is_relay_transient(),
            AttemptError::Challenge(err) => err.is_relay_transient(),
        }
    }
}

/// Default middle-tier policy: five attempts, 3 to 5 seconds apart.
pub fn default_relay_policy() -> RetryPolicy {
    RetryPolicy::new(5).with_delay(DelayStrategy::uniform(
        Duration::from_secs(3),
        Duration::from_secs(5),
    ))
}

/// Issues queries through fresh relay sessions.
#[derive(Clone)]
pub struct RelayRequestExecutor {
    connector: Arc<dyn RelayConnector>,
    acquirer: ChallengeAcquirer,
    policy: RetryPolicy,
    events: Arc<EventDispatcher>,
}

impl RelayRequestExecutor {
    pub fn new(
        connector: Arc<dyn RelayConnector>,
        acquirer: ChallengeAcquirer,
        policy: RetryPolicy,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            connector,
            acquirer,
            policy,
            events,
        }
    }

    /// Run the query for `(key, kind)` until one attempt yields a decoded
    /// response or the relay policy gives up.
    pub async fn execute(
        &self,
        key: &LookupKey,
        kind: QueryKind,
    ) -> Result<RawResponse, RetryError<AttemptError>> {
        self.policy
            .run(
                |attempt| self.attempt(key, kind, attempt),
                AttemptError::is_relay_transient,
                |attempt, err, delay| {
                    self.events.dispatch(CheckEvent::Retry(RetryEvent {
                        key: key.clone(),
                        kind,
                        tier: RetryTier::Relay,
                        attempt,
                        reason: err.to_string(),
                        scheduled_after: delay,
                        timestamp: Utc::now(),
                    }));
                },
            )
            .await
    }

    async fn attempt(
        &self,
        key: &LookupKey,
        kind: QueryKind,
        attempt: u32,
    ) -> Result<RawResponse, AttemptError> {
        let session = self.connector.connect().await?;
        let outcome = self.query_over(session.as_ref(), key, kind, attempt).await;

        match &outcome {
            Ok(_) => self.connector.report(session.relay(), true),
            Err(err) if err.is_relay_transient() => self.connector.report(session.relay(), false),
            Err(_) => {}
        }
        outcome
    }

    async fn query_over(
        &self,
        session: &dyn RelaySession,
        key: &LookupKey,
        kind: QueryKind,
        attempt: u32,
    ) -> Result<RawResponse, AttemptError> {
        let challenge = self
            .acquirer
            .acquire(session, |fetch_attempt, err, delay| {
                self.events.dispatch(CheckEvent::Retry(RetryEvent {
                    key: key.clone(),
                    kind,
                    tier: RetryTier::Challenge,
                    attempt: fetch_attempt,
                    reason: err.to_string(),
                    scheduled_after: delay,
                    timestamp: Utc::now(),
                }));
            })
            .await?;

        let query = QueryDescriptor::new(key.clone(), kind, challenge);

        self.events.dispatch(CheckEvent::Attempt(AttemptEvent {
            key: key.clone(),
            kind,
            relay: session.relay().map(redact_relay),
            attempt,
            timestamp: Utc::now(),
        }));

        let started = Instant::now();
        let response = session.submit_query(&query).await?;

        self.events.dispatch(CheckEvent::Response(ResponseEvent {
            key: key.clone(),
            kind,
            status: response.status,
            code: response.code,
            latency: started.elapsed(),
            timestamp: Utc::now(),
        }));

        Ok(response)
    }
}
