//! Captcha solver integrations.
//!
//! The acquirer talks to a [`CaptchaProvider`]. Image recognition itself lives
//! behind the blocking [`CaptchaRecognizer`] boundary; [`SerializedSolver`]
//! bridges the two by running one recognition at a time on the blocking pool
//! while leaving waiters cancellable.

mod command;

pub use command::CommandRecognizer;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::Semaphore;

/// High-level configuration that controls captcha solving behaviour.
#[derive(Debug, Clone)]
pub struct CaptchaConfig {
    /// Upper bound for one solve, waiting for the solver slot included.
    pub timeout: Duration,
}

impl Default for CaptchaConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

/// Challenge image to recognise.
#[derive(Debug, Clone)]
pub struct CaptchaTask {
    pub image: Bytes,
}

impl CaptchaTask {
    pub fn new(image: impl Into<Bytes>) -> Self {
        Self {
            image: image.into(),
        }
    }
}

/// Decoded challenge text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptchaSolution {
    pub text: String,
    pub elapsed: Duration,
}

/// Common result type returned by captcha providers.
pub type CaptchaResult = Result<CaptchaSolution, CaptchaError>;

/// Shared interface implemented by captcha solvers.
#[async_trait]
pub trait CaptchaProvider: Send + Sync {
    fn name(&self) -> &'static str;
    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult;
}

/// Blocking image-to-text recognizer (OCR model, external tool, ...).
/// Implementations need not be reentrant.
pub trait CaptchaRecognizer: Send + Sync {
    fn name(&self) -> &'static str;
    fn recognize(&self, image: &[u8]) -> Result<String, CaptchaError>;
}

/// Errors surfaced by captcha solvers.
#[derive(Debug, Clone, Error)]
pub enum CaptchaError {
    #[error("captcha solver misconfigured: {0}")]
    Configuration(String),
    #[error("captcha image could not be decoded: {0}")]
    Decode(String),
    #[error("captcha recognizer failed: {0}")]
    Recognizer(String),
    #[error("captcha solving timed out after {0:?}")]
    Timeout(Duration),
    #[error("captcha solver is shut down")]
    Unavailable,
}

/// Runs a [`CaptchaRecognizer`] on the blocking pool, one inference at a time.
///
/// Callers queue on a single-permit semaphore, so dropping a waiting `solve`
/// future simply leaves the queue. The permit moves into the blocking task and
/// is only returned once recognition has finished, even if the caller stopped
/// waiting for the answer. The configured timeout covers the queue wait too,
/// so a recognizer that never returns turns later solves into
/// [`CaptchaError::Timeout`] instead of stalling them.
pub struct SerializedSolver {
    recognizer: Arc<dyn CaptchaRecognizer>,
    slot: Arc<Semaphore>,
    config: CaptchaConfig,
}

impl SerializedSolver {
    pub fn new(recognizer: Arc<dyn CaptchaRecognizer>) -> Self {
        Self::with_config(recognizer, CaptchaConfig::default())
    }

    pub fn with_config(recognizer: Arc<dyn CaptchaRecognizer>, config: CaptchaConfig) -> Self {
        Self {
            recognizer,
            slot: Arc::new(Semaphore::new(1)),
            config,
        }
    }

    /// Number of callers that could start recognising right now (0 or 1).
    pub fn idle_slots(&self) -> usize {
        self.slot.available_permits()
    }

    async fn recognize_queued(&self, task: &CaptchaTask) -> Result<String, CaptchaError> {
        let permit = self
            .slot
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CaptchaError::Unavailable)?;

        let recognizer = self.recognizer.clone();
        let image = task.image.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            recognizer.recognize(&image)
        })
        .await
        .map_err(|join_err| CaptchaError::Recognizer(join_err.to_string()))?
    }
}

#[async_trait]
impl CaptchaProvider for SerializedSolver {
    fn name(&self) -> &'static str {
        self.recognizer.name()
    }

    async fn solve(&self, task: &CaptchaTask) -> CaptchaResult {
        let started = Instant::now();
        let timeout = self.config.timeout;

        let text = tokio::time::timeout(timeout, self.recognize_queued(task))
            .await
            .map_err(|_| CaptchaError::Timeout(timeout))??;

        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(CaptchaError::Recognizer("empty answer".into()));
        }

        Ok(CaptchaSolution {
            text,
            elapsed: started.elapsed(),
        })
    }
}
