//! Challenge acquisition.
//!
//! Fetches a fresh challenge over an attempt's session, retrying fetch
//! timeouts only, then hands the decoded image to the captcha solver.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use thiserror::Error;

use super::core::{Challenge, RelaySession, RetryError, RetryPolicy, TransportError};
use crate::external_deps::captcha::{CaptchaError, CaptchaProvider, CaptchaTask};

/// Failures raised while obtaining a solved challenge.
#[derive(Debug, Clone, Error)]
pub enum AcquireError {
    #[error("challenge fetch timed out {attempts} times: {source}")]
    FetchTimeout {
        attempts: u32,
        #[source]
        source: TransportError,
    },
    #[error("challenge fetch failed: {0}")]
    Fetch(#[source] TransportError),
    #[error("challenge image is not valid base64: {0}")]
    InvalidImage(String),
    #[error(transparent)]
    Solver(#[from] CaptchaError),
}

impl AcquireError {
    /// Whether a new relay session may get past this failure. Solver errors
    /// are never worth another connection.
    pub fn is_relay_transient(&self) -> bool {
        match self {
            AcquireError::FetchTimeout { .. } | AcquireError::InvalidImage(_) => true,
            AcquireError::Fetch(err) => err.is_relay_transient(),
            AcquireError::Solver(_) => false,
        }
    }
}

/// Obtains solved challenges.
#[derive(Clone)]
pub struct ChallengeAcquirer {
    solver: Arc<dyn CaptchaProvider>,
    policy: RetryPolicy,
}

impl ChallengeAcquirer {
    pub fn new(solver: Arc<dyn CaptchaProvider>, policy: RetryPolicy) -> Self {
        Self { solver, policy }
    }

    /// Fetch and solve a challenge over `session`. `on_retry` is told about
    /// every fetch timeout that is about to be retried.
    pub async fn acquire<R>(
        &self,
        session: &dyn RelaySession,
        on_retry: R,
    ) -> Result<Challenge, AcquireError>
    where
        R: FnMut(u32, &TransportError, Duration),
    {
        let payload = self
            .policy
            .run(
                |_| session.fetch_challenge(),
                TransportError::is_timeout,
                on_retry,
            )
            .await
            .map_err(|err| match err {
                RetryError::Exhausted { attempts, last } => AcquireError::FetchTimeout {
                    attempts,
                    source: last,
                },
                RetryError::Fatal { error, .. } => AcquireError::Fetch(error),
            })?;

        let image = BASE64
            .decode(payload.image_base64.trim())
            .map_err(|err| AcquireError::InvalidImage(err.to_string()))?;
        let challenge = Challenge::new(Bytes::from(image), payload.token);

        let solution = self
            .solver
            .solve(&CaptchaTask::new(challenge.image.clone()))
            .await?;
        log::trace!(
            "challenge solved by {} in {:.2}s",
            self.solver.name(),
            solution.elapsed.as_secs_f64()
        );

        Ok(challenge.with_solution(solution.text))
    }
}
