//! Transport contracts used by the acquirer and the relay executor.
//!
//! A [`RelayConnector`] opens a brand-new relay-backed session per attempt; the
//! [`RelaySession`] it returns carries the challenge fetch and the query POST
//! for that attempt only. Keeping the transport behind these traits lets the
//! pipeline run against scripted stubs in tests.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use super::types::{CaptchaPayload, QueryDescriptor, RawResponse};
use crate::modules::proxy::RelayHealthReport;

/// One relay connection plus one HTTP session, owned by a single attempt.
#[async_trait]
pub trait RelaySession: Send + Sync {
    /// Relay endpoint the session was opened through, if any.
    fn relay(&self) -> Option<&str>;

    /// GET a fresh challenge (image + token).
    async fn fetch_challenge(&self) -> Result<CaptchaPayload, TransportError>;

    /// POST the query and decode the JSON body.
    async fn submit_query(&self, query: &QueryDescriptor) -> Result<RawResponse, TransportError>;
}

/// Opens relay sessions. Implementations must never hand out a session that
/// shares connections with a previous one.
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RelaySession>, TransportError>;

    /// Feedback about the relay a finished attempt went through.
    fn report(&self, _relay: Option<&str>, _success: bool) {}

    /// Health of the relays behind this connector, when it rotates any.
    fn relay_health(&self) -> Option<RelayHealthReport> {
        None
    }
}

/// Failures raised by the transport layer.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("relay connection failed: {0}")]
    RelayConnect(String),
    #[error("relay protocol error: {0}")]
    RelayProtocol(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream returned http status {0}")]
    Status(u16),
    #[error("failed to decode upstream body: {0}")]
    Decode(String),
    #[error("http client error: {0}")]
    Client(String),
    #[error("transport misconfigured: {0}")]
    Configuration(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout(_))
    }

    /// Failures worth a fresh relay connection: relay connect/protocol errors,
    /// timeouts, and generic client errors (bad status, undecodable body).
    pub fn is_relay_transient(&self) -> bool {
        !matches!(self, TransportError::Configuration(_))
    }
}
