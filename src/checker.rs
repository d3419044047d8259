//! High level acquisition orchestration.
//!
//! Wires together the concurrency gate, the paired result cache, challenge
//! acquisition, relay execution and response classification behind
//! [`VehicleChecker::check_vehicle`], which owns the outermost retry tier.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use http::{HeaderMap, HeaderName, HeaderValue};
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use url::Url;

use crate::challenges::acquirer::{AcquireError, ChallengeAcquirer};
use crate::challenges::classifier::{ClassifiedOutcome, FatalReason, RetryReason, classify};
use crate::challenges::core::{
	CancelToken, DelayStrategy, InvalidLookupKey, LookupKey, QueryKind, RawResponse,
	RelayConnector, ReqwestRelayConnector, RetryError, RetryPolicy, UnknownQueryKind,
	UpstreamEndpoints,
};
use crate::challenges::relay::{AttemptError, RelayRequestExecutor, default_relay_policy};
use crate::challenges::user_agents::{
	UserAgentError, UserAgentOptions, UserAgentProfile, get_user_agent_profile,
};
use crate::external_deps::captcha::{
	CaptchaConfig, CaptchaError, CaptchaProvider, CaptchaRecognizer, CommandRecognizer,
	SerializedSolver,
};
use crate::modules::cache::{PairedResultCache, StoreOutcome};
use crate::modules::events::{
	CacheHitEvent, CheckEvent, EventDispatcher, EventHandler, FailureEvent, LoggingHandler,
	MetricsHandler, RetryEvent, RetryTier,
};
use crate::modules::gate::{ConcurrencyGate, GateStats};
use crate::modules::metrics::{MetricsCollector, MetricsSnapshot};
use crate::modules::proxy::{RelayConfig, RelayHealthReport, RelayPool, RotationStrategy};

/// Result alias used across the orchestration layer.
pub type CheckResult<T> = Result<T, CheckError>;

/// Terminal error of one acquisition.
#[derive(Debug, Error)]
pub enum CheckError {
	#[error(transparent)]
	InvalidKey(#[from] InvalidLookupKey),
	#[error(transparent)]
	UnknownQueryKind(#[from] UnknownQueryKind),
	#[error("challenge validation rejected")]
	ChallengeRejected,
	#[error("unrecognized response shape (status={status:?}, code={code:?})")]
	MalformedResponse {
		status: Option<i64>,
		code: Option<i64>,
	},
	#[error("no record for {key} [{kind}]")]
	NoRecord { key: LookupKey, kind: QueryKind },
	#[error("relay attempts exhausted after {attempts} tries: {source}")]
	RelayExhausted {
		attempts: u32,
		#[source]
		source: AttemptError,
	},
	#[error("relay attempt failed: {0}")]
	Attempt(#[source] AttemptError),
	#[error("captcha solving failed: {0}")]
	Captcha(#[from] CaptchaError),
	#[error("concurrency gate closed")]
	GateClosed,
	#[error("acquisition cancelled")]
	Cancelled,
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("user-agent initialisation failed: {0}")]
	UserAgent(#[from] UserAgentError),
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
}

impl CheckError {
	/// Failures the end-to-end tier starts over from a fresh challenge for.
	pub fn is_outer_retryable(&self) -> bool {
		matches!(
			self,
			CheckError::ChallengeRejected
				| CheckError::MalformedResponse { .. }
				| CheckError::RelayExhausted { .. }
		)
	}

	pub fn is_fatal(&self) -> bool {
		!self.is_outer_retryable()
	}
}

impl From<RetryError<AttemptError>> for CheckError {
	fn from(err: RetryError<AttemptError>) -> Self {
		match err {
			RetryError::Exhausted { attempts, last } => CheckError::RelayExhausted {
				attempts,
				source: last,
			},
			RetryError::Fatal {
				error: AttemptError::Challenge(AcquireError::Solver(err)),
				..
			} => CheckError::Captcha(err),
			RetryError::Fatal { error, .. } => CheckError::Attempt(error),
		}
	}
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config {path:?}: {source}")]
	Io { path: PathBuf, source: io::Error },
	#[error("invalid config JSON: {0}")]
	Json(#[from] serde_json::Error),
	#[error("invalid url for {field}: {source}")]
	InvalidUrl {
		field: &'static str,
		source: url::ParseError,
	},
	#[error("invalid value for {field}: {reason}")]
	InvalidValue { field: &'static str, reason: String },
	#[error("no captcha solver configured")]
	MissingSolver,
}

/// Outcome of one acquisition inside a batch run.
#[derive(Debug)]
pub struct CheckReport {
	pub key: LookupKey,
	pub kind: QueryKind,
	pub result: CheckResult<RawResponse>,
}

impl CheckReport {
	pub fn is_success(&self) -> bool {
		self.result.is_ok()
	}
}

/// Checker configuration used by the builder.
#[derive(Clone)]
pub struct VehicleCheckerConfig {
	pub endpoints: UpstreamEndpoints,
	pub relays: Vec<String>,
	pub relay_config: RelayConfig,
	/// Maximum number of acquisitions in flight.
	pub gate_capacity: usize,
	/// Inner tier: challenge fetch timeouts.
	pub challenge_retry: RetryPolicy,
	/// Middle tier: relay and transport failures.
	pub relay_retry: RetryPolicy,
	/// Outer tier: rejected challenges, odd responses, exhausted relay tier.
	pub check_retry: RetryPolicy,
	pub captcha_timeout: Duration,
	pub request_timeout: Option<Duration>,
	pub user_agent: UserAgentOptions,
	pub captcha_solver: Option<Arc<dyn CaptchaProvider>>,
	/// Replaces the reqwest transport entirely.
	pub connector: Option<Arc<dyn RelayConnector>>,
	pub enable_metrics: bool,
}

impl Default for VehicleCheckerConfig {
	fn default() -> Self {
		Self {
			endpoints: UpstreamEndpoints::default(),
			relays: Vec::new(),
			relay_config: RelayConfig::default(),
			gate_capacity: 50,
			challenge_retry: RetryPolicy::new(10),
			relay_retry: default_relay_policy(),
			check_retry: RetryPolicy::new(10),
			captcha_timeout: Duration::from_secs(10),
			request_timeout: None,
			user_agent: UserAgentOptions::default(),
			captcha_solver: None,
			connector: None,
			enable_metrics: true,
		}
	}
}

impl VehicleCheckerConfig {
	/// Parse a JSON settings document. Every field is optional.
	pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
		let file: ConfigFile = serde_json::from_str(raw)?;
		file.into_config()
	}

	/// Reject values no checker can run with. Builders and JSON loading both
	/// end up here.
	pub fn validate(&self) -> Result<(), ConfigError> {
		if self.gate_capacity == 0 {
			return Err(ConfigError::InvalidValue {
				field: "gate_capacity",
				reason: "must be at least 1".into(),
			});
		}
		if self.relay_config.failure_threshold == 0 {
			return Err(ConfigError::InvalidValue {
				field: "relay_failure_threshold",
				reason: "must be at least 1".into(),
			});
		}
		Ok(())
	}

	pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_json_str(&raw)
	}
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ConfigFile {
	captcha_url: Option<String>,
	query_base_url: Option<String>,
	portal_origin: Option<String>,
	relays: Vec<String>,
	rotation_strategy: Option<RotationStrategy>,
	relay_ban_secs: Option<u64>,
	relay_failure_threshold: Option<u32>,
	gate_capacity: Option<usize>,
	challenge_attempts: Option<u32>,
	relay_attempts: Option<u32>,
	relay_delay_min_ms: Option<u64>,
	relay_delay_max_ms: Option<u64>,
	check_attempts: Option<u32>,
	captcha_timeout_secs: Option<f64>,
	request_timeout_secs: Option<f64>,
	user_agent: Option<String>,
	browser: Option<String>,
	platform: Option<String>,
	/// Program plus arguments of an external recognizer.
	recognizer_command: Vec<String>,
	recognizer_timeout_secs: Option<f64>,
	enable_metrics: Option<bool>,
}

impl ConfigFile {
	fn into_config(self) -> Result<VehicleCheckerConfig, ConfigError> {
		let mut config = VehicleCheckerConfig::default();

		if let Some(raw) = self.captcha_url {
			config.endpoints.captcha_url = parse_url("captcha_url", &raw)?;
		}
		if let Some(raw) = self.query_base_url {
			config.endpoints.query_base_url = parse_url("query_base_url", &raw)?;
		}
		if let Some(raw) = self.portal_origin {
			config.endpoints.portal_origin = parse_url("portal_origin", &raw)?;
		}

		config.relays = self.relays;
		if let Some(strategy) = self.rotation_strategy {
			config.relay_config.rotation_strategy = strategy;
		}
		if let Some(secs) = self.relay_ban_secs {
			config.relay_config.ban_time = Duration::from_secs(secs);
		}
		if let Some(threshold) = self.relay_failure_threshold {
			config.relay_config.failure_threshold = threshold;
		}
		if let Some(capacity) = self.gate_capacity {
			config.gate_capacity = capacity;
		}

		if let Some(attempts) = self.challenge_attempts {
			config.challenge_retry = RetryPolicy::new(positive("challenge_attempts", attempts)?);
		}
		if let Some(attempts) = self.check_attempts {
			config.check_retry = RetryPolicy::new(positive("check_attempts", attempts)?);
		}
		let mut relay_retry = config.relay_retry;
		if let Some(attempts) = self.relay_attempts {
			relay_retry =
				RetryPolicy::new(positive("relay_attempts", attempts)?).with_delay(relay_retry.delay());
		}
		if self.relay_delay_min_ms.is_some() || self.relay_delay_max_ms.is_some() {
			let (min, max) = match relay_retry.delay() {
				DelayStrategy::Uniform { min, max } => (min, max),
				DelayStrategy::Fixed(delay) => (delay, delay),
				DelayStrategy::None => (Duration::ZERO, Duration::ZERO),
			};
			let min = self.relay_delay_min_ms.map(Duration::from_millis).unwrap_or(min);
			let max = self.relay_delay_max_ms.map(Duration::from_millis).unwrap_or(max);
			if max < min {
				return Err(ConfigError::InvalidValue {
					field: "relay_delay_max_ms",
					reason: "must not be below relay_delay_min_ms".into(),
				});
			}
			relay_retry = relay_retry.with_delay(DelayStrategy::uniform(min, max));
		}
		config.relay_retry = relay_retry;

		if let Some(secs) = self.captcha_timeout_secs {
			config.captcha_timeout = seconds("captcha_timeout_secs", secs)?;
		}
		if let Some(secs) = self.request_timeout_secs {
			config.request_timeout = Some(seconds("request_timeout_secs", secs)?);
		}

		config.user_agent.custom = self.user_agent;
		config.user_agent.browser = self.browser;
		config.user_agent.platform = self.platform;

		if let Some((program, args)) = self.recognizer_command.split_first() {
			let mut recognizer = args
				.iter()
				.fold(CommandRecognizer::new(program), |recognizer, arg| recognizer.arg(arg));
			let mut captcha = CaptchaConfig::default();
			if let Some(secs) = self.recognizer_timeout_secs {
				captcha.timeout = seconds("recognizer_timeout_secs", secs)?;
				recognizer = recognizer.with_timeout(captcha.timeout);
			}
			config.captcha_solver = Some(Arc::new(SerializedSolver::with_config(
				Arc::new(recognizer),
				captcha,
			)));
		}

		if let Some(enabled) = self.enable_metrics {
			config.enable_metrics = enabled;
		}

		config.validate()?;
		Ok(config)
	}
}

fn parse_url(field: &'static str, raw: &str) -> Result<Url, ConfigError> {
	Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { field, source })
}

fn positive(field: &'static str, value: u32) -> Result<u32, ConfigError> {
	if value == 0 {
		return Err(ConfigError::InvalidValue {
			field,
			reason: "must be at least 1".into(),
		});
	}
	Ok(value)
}

fn seconds(field: &'static str, secs: f64) -> Result<Duration, ConfigError> {
	Duration::try_from_secs_f64(secs).map_err(|err| ConfigError::InvalidValue {
		field,
		reason: err.to_string(),
	})
}

/// Fluent builder for [`VehicleChecker`].
pub struct VehicleCheckerBuilder {
	config: VehicleCheckerConfig,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl VehicleCheckerBuilder {
	pub fn new() -> Self {
		Self::from_config(VehicleCheckerConfig::default())
	}

	pub fn from_config(config: VehicleCheckerConfig) -> Self {
		Self {
			config,
			handlers: Vec::new(),
		}
	}

	pub fn with_endpoints(mut self, endpoints: UpstreamEndpoints) -> Self {
		self.config.endpoints = endpoints;
		self
	}

	pub fn with_relays<I, S>(mut self, relays: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.config.relays = relays.into_iter().map(Into::into).collect();
		self
	}

	pub fn with_relay_config(mut self, config: RelayConfig) -> Self {
		self.config.relay_config = config;
		self
	}

	pub fn with_gate_capacity(mut self, capacity: usize) -> Self {
		self.config.gate_capacity = capacity;
		self
	}

	pub fn with_challenge_retry(mut self, policy: RetryPolicy) -> Self {
		self.config.challenge_retry = policy;
		self
	}

	pub fn with_relay_retry(mut self, policy: RetryPolicy) -> Self {
		self.config.relay_retry = policy;
		self
	}

	pub fn with_check_retry(mut self, policy: RetryPolicy) -> Self {
		self.config.check_retry = policy;
		self
	}

	pub fn with_captcha_timeout(mut self, timeout: Duration) -> Self {
		self.config.captcha_timeout = timeout;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = Some(timeout);
		self
	}

	pub fn with_user_agent_options(mut self, options: UserAgentOptions) -> Self {
		self.config.user_agent = options;
		self
	}

	pub fn with_captcha_solver(mut self, solver: Arc<dyn CaptchaProvider>) -> Self {
		self.config.captcha_solver = Some(solver);
		self
	}

	/// Use a blocking recognizer, serialized to one inference at a time.
	pub fn with_captcha_recognizer(mut self, recognizer: Arc<dyn CaptchaRecognizer>) -> Self {
		self.config.captcha_solver = Some(Arc::new(SerializedSolver::new(recognizer)));
		self
	}

	pub fn with_connector(mut self, connector: Arc<dyn RelayConnector>) -> Self {
		self.config.connector = Some(connector);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn build(self) -> CheckResult<VehicleChecker> {
		VehicleChecker::with_config(self.config, self.handlers)
	}
}

impl Default for VehicleCheckerBuilder {
	fn default() -> Self {
		Self::new()
	}
}

struct CheckerInner {
	gate: ConcurrencyGate,
	cache: PairedResultCache,
	connector: Arc<dyn RelayConnector>,
	executor: RelayRequestExecutor,
	check_policy: RetryPolicy,
	metrics: Option<MetricsCollector>,
	events: Arc<EventDispatcher>,
}

/// Main acquisition orchestrator. Cheap to clone; clones share the gate,
/// the paired cache and the metrics.
#[derive(Clone)]
pub struct VehicleChecker {
	inner: Arc<CheckerInner>,
}

impl VehicleChecker {
	/// Obtain a builder to customise the checker instance.
	pub fn builder() -> VehicleCheckerBuilder {
		VehicleCheckerBuilder::new()
	}

	fn with_config(
		config: VehicleCheckerConfig,
		handlers: Vec<Arc<dyn EventHandler>>,
	) -> CheckResult<Self> {
		config.validate()?;
		let solver = config
			.captcha_solver
			.clone()
			.ok_or(ConfigError::MissingSolver)?;

		let connector: Arc<dyn RelayConnector> = match config.connector.clone() {
			Some(connector) => connector,
			None => {
				let profile = get_user_agent_profile(config.user_agent.clone())?;
				let headers = to_http_headers(&profile)?;
				let mut pool = RelayPool::new(config.relay_config.clone());
				pool.load(config.relays.iter().cloned());
				Arc::new(
					ReqwestRelayConnector::new(config.endpoints.clone(), headers)
						.with_relays(pool)
						.with_captcha_timeout(config.captcha_timeout)
						.with_request_timeout(config.request_timeout),
				)
			}
		};

		let metrics = config.enable_metrics.then(MetricsCollector::new);

		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		if let Some(ref collector) = metrics {
			events.register_handler(Arc::new(MetricsHandler::new(collector.clone())));
		}
		for handler in handlers {
			events.register_handler(handler);
		}
		let events = Arc::new(events);

		let acquirer = ChallengeAcquirer::new(solver, config.challenge_retry);
		let executor = RelayRequestExecutor::new(
			connector.clone(),
			acquirer,
			config.relay_retry,
			events.clone(),
		);

		Ok(Self {
			inner: Arc::new(CheckerInner {
				gate: ConcurrencyGate::new(config.gate_capacity),
				cache: PairedResultCache::new(),
				connector,
				executor,
				check_policy: config.check_retry,
				metrics,
				events,
			}),
		})
	}

	/// Acquire the record of `kind` for `key`.
	///
	/// Waits for a gate slot, answers paired kinds from the cache when the
	/// partner already fetched them, and otherwise runs the end-to-end retry
	/// loop. The gate slot is released on every exit path, including the
	/// returned future being dropped.
	pub async fn check_vehicle(&self, key: &LookupKey, kind: QueryKind) -> CheckResult<RawResponse> {
		let inner = &self.inner;
		let _permit = inner.gate.acquire().await.map_err(|_| CheckError::GateClosed)?;

		if kind.is_paired()
			&& let Some(response) = inner.cache.try_consume(key, kind)
		{
			inner.events.dispatch(CheckEvent::CacheHit(CacheHitEvent {
				key: key.clone(),
				kind,
				timestamp: Utc::now(),
			}));
			return Ok(response.tagged(kind));
		}

		let result = inner
			.check_policy
			.run(
				|_| self.attempt_once(key, kind),
				CheckError::is_outer_retryable,
				|attempt, err, delay| {
					inner.events.dispatch(CheckEvent::Retry(RetryEvent {
						key: key.clone(),
						kind,
						tier: RetryTier::Check,
						attempt,
						reason: err.to_string(),
						scheduled_after: delay,
						timestamp: Utc::now(),
					}));
				},
			)
			.await;

		match result {
			Ok(response) => {
				if kind.is_paired() {
					match inner.cache.store(key, kind, response.clone()) {
						StoreOutcome::Stored => log::trace!("{key} [{kind}] cached for its pair"),
						StoreOutcome::Settled => {
							log::debug!("{key} [{kind}] pair already answered, cache slot cleared")
						}
						StoreOutcome::Occupied => {
							log::debug!("{key} [{kind}] earlier answer still waiting, not cached")
						}
					}
				}
				Ok(response.tagged(kind))
			}
			Err(err) => {
				let fatal = !err.is_exhausted();
				let attempts = err.attempts();
				let err = err.into_inner();
				log::debug!("{key} [{kind}] gave up after {attempts} attempt(s)");
				inner.events.dispatch(CheckEvent::Failure(FailureEvent {
					key: key.clone(),
					kind,
					error: err.to_string(),
					fatal,
					timestamp: Utc::now(),
				}));
				Err(err)
			}
		}
	}

	/// Like [`check_vehicle`](Self::check_vehicle), but gives up with
	/// [`CheckError::Cancelled`] as soon as `cancel` fires.
	pub async fn check_vehicle_with_cancel(
		&self,
		key: &LookupKey,
		kind: QueryKind,
		cancel: &CancelToken,
	) -> CheckResult<RawResponse> {
		if cancel.is_cancelled() {
			return Err(CheckError::Cancelled);
		}
		tokio::select! {
			biased;
			_ = cancel.cancelled() => {
				log::debug!("{key} [{kind}] cancelled");
				Err(CheckError::Cancelled)
			}
			result = self.check_vehicle(key, kind) => result,
		}
	}

	/// Acquisition keyed by raw strings; the kind may be a code or a label.
	pub async fn check_by_label(&self, key: &str, kind: &str) -> CheckResult<RawResponse> {
		let key = LookupKey::parse(key)?;
		let kind: QueryKind = kind.parse()?;
		self.check_vehicle(&key, kind).await
	}

	/// Run one acquisition per key concurrently. Reports arrive in completion
	/// order; dropping the receiver aborts whatever is still running. Must be
	/// called from within a tokio runtime.
	pub fn check_batch<I>(
		&self,
		keys: I,
		kind: QueryKind,
		cancel: CancelToken,
	) -> mpsc::Receiver<CheckReport>
	where
		I: IntoIterator<Item = LookupKey>,
	{
		let keys: Vec<LookupKey> = keys.into_iter().collect();
		let (tx, rx) = mpsc::channel(keys.len().clamp(1, 256));
		let checker = self.clone();

		tokio::spawn(async move {
			let mut tasks = JoinSet::new();
			for key in keys {
				let checker = checker.clone();
				let cancel = cancel.clone();
				tasks.spawn(async move {
					let result = checker.check_vehicle_with_cancel(&key, kind, &cancel).await;
					CheckReport { key, kind, result }
				});
			}

			while let Some(joined) = tasks.join_next().await {
				match joined {
					Ok(report) => {
						if tx.send(report).await.is_err() {
							tasks.abort_all();
							break;
						}
					}
					Err(err) if err.is_cancelled() => {}
					Err(err) => log::error!("acquisition task failed: {err}"),
				}
			}
		});

		rx
	}

	/// Snapshot of collected metrics, if enabled.
	pub fn metrics(&self) -> Option<MetricsSnapshot> {
		self.inner.metrics.as_ref().map(MetricsCollector::snapshot)
	}

	pub fn gate_stats(&self) -> GateStats {
		self.inner.gate.stats()
	}

	pub fn cache(&self) -> &PairedResultCache {
		&self.inner.cache
	}

	/// Relay rotation health, when the transport rotates relays.
	pub fn relay_health(&self) -> Option<RelayHealthReport> {
		self.inner.connector.relay_health()
	}

	async fn attempt_once(&self, key: &LookupKey, kind: QueryKind) -> CheckResult<RawResponse> {
		let response = self.inner.executor.execute(key, kind).await?;

		match classify(response, kind) {
			ClassifiedOutcome::Success(response) => Ok(response),
			ClassifiedOutcome::RetryableFailure(RetryReason::ChallengeRejected) => {
				Err(CheckError::ChallengeRejected)
			}
			ClassifiedOutcome::RetryableFailure(RetryReason::UnrecognizedShape { status, code }) => {
				Err(CheckError::MalformedResponse { status, code })
			}
			ClassifiedOutcome::FatalFailure(FatalReason::NoRecord) => Err(CheckError::NoRecord {
				key: key.clone(),
				kind,
			}),
		}
	}
}

fn to_http_headers(profile: &UserAgentProfile) -> CheckResult<HeaderMap> {
	let mut headers = HeaderMap::new();
	for (name, value) in &profile.headers {
		let header_name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| CheckError::InvalidHeader(name.clone()))?;
		let header_value = HeaderValue::from_str(value)
			.map_err(|_| CheckError::InvalidHeader(name.clone()))?;
		headers.insert(header_name, header_value);
	}
	Ok(headers)
}
