//! Core utilities shared by the acquirer, the relay executor, and the
//! orchestrator.

pub mod cancel;
pub mod reqwest_client;
pub mod retry;
pub mod transport;
pub mod types;

pub use cancel::CancelToken;
pub use reqwest_client::{ReqwestRelayConnector, UpstreamEndpoints};
pub use retry::{DelayStrategy, RetryError, RetryPolicy};
pub use transport::{RelayConnector, RelaySession, TransportError};
pub use types::{
    CaptchaPayload, Challenge, Endpoint, InvalidLookupKey, LookupKey, QueryDescriptor, QueryKind,
    RawResponse, UnknownQueryKind, dedup_lookup_keys,
};
