use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use vincheck_rs::{
    CancelToken, CaptchaError, CaptchaPayload, CaptchaRecognizer, CheckError, LookupKey,
    QueryDescriptor, QueryKind, RawResponse, RelayConnector, RelaySession, RetryPolicy,
    TransportError, VehicleChecker,
};

const KEY: &str = "X9FKXXEEBKBM40204";

#[derive(Clone)]
enum Step {
    Respond(Value),
    Fail(TransportError),
}

#[derive(Debug, Clone)]
struct Submitted {
    kind: QueryKind,
    token: String,
    solved_text: String,
}

/// Scripted stand-in for the captcha and query endpoints.
#[derive(Default)]
struct Upstream {
    connects: AtomicU32,
    fetches: AtomicU32,
    fetch_timeouts: AtomicU32,
    submits: Mutex<Vec<Submitted>>,
    script: Mutex<VecDeque<Step>>,
    fallback: Mutex<Option<Step>>,
    submit_delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl Upstream {
    fn scripted(steps: Vec<Step>) -> Arc<Self> {
        let upstream = Self::default();
        *upstream.script.lock().unwrap() = steps.into();
        Arc::new(upstream)
    }

    fn with_fallback(self: Arc<Self>, step: Step) -> Arc<Self> {
        *self.fallback.lock().unwrap() = Some(step);
        self
    }

    fn with_submit_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.submit_delay.lock().unwrap() = delay;
        self
    }

    fn submits(&self) -> Vec<Submitted> {
        self.submits.lock().unwrap().clone()
    }

    fn next_step(&self) -> Step {
        if let Some(step) = self.script.lock().unwrap().pop_front() {
            return step;
        }
        self.fallback
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Step::Respond(json!({"status": 200, "RequestResult": {}})))
    }
}

struct StubConnector(Arc<Upstream>);

struct StubSession {
    upstream: Arc<Upstream>,
    relay: String,
}

#[async_trait]
impl RelayConnector for StubConnector {
    async fn connect(&self) -> Result<Box<dyn RelaySession>, TransportError> {
        let n = self.0.connects.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(StubSession {
            upstream: self.0.clone(),
            relay: format!("socks5://relay-{n}.example:1080"),
        }))
    }
}

#[async_trait]
impl RelaySession for StubSession {
    fn relay(&self) -> Option<&str> {
        Some(&self.relay)
    }

    async fn fetch_challenge(&self) -> Result<CaptchaPayload, TransportError> {
        let n = self.upstream.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        let pending_timeouts = self.upstream.fetch_timeouts.load(Ordering::SeqCst);
        if pending_timeouts > 0 {
            self.upstream
                .fetch_timeouts
                .store(pending_timeouts - 1, Ordering::SeqCst);
            return Err(TransportError::Timeout(Duration::from_secs(10)));
        }
        Ok(CaptchaPayload {
            image_base64: BASE64.encode(format!("img-{n}")),
            token: format!("tok-{n}"),
        })
    }

    async fn submit_query(&self, query: &QueryDescriptor) -> Result<RawResponse, TransportError> {
        self.upstream.submits.lock().unwrap().push(Submitted {
            kind: query.kind,
            token: query.challenge.token.clone(),
            solved_text: query.challenge.solved_text.clone(),
        });

        let now = self.upstream.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.upstream.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let delay = *self.upstream.submit_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.upstream.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.upstream.next_step() {
            Step::Respond(body) => Ok(RawResponse::from_value(body)),
            Step::Fail(err) => Err(err),
        }
    }
}

/// Reads the image bytes back as the answer.
struct EchoRecognizer;

impl CaptchaRecognizer for EchoRecognizer {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn recognize(&self, image: &[u8]) -> Result<String, CaptchaError> {
        Ok(String::from_utf8_lossy(image).into_owned())
    }
}

struct BrokenRecognizer;

impl CaptchaRecognizer for BrokenRecognizer {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn recognize(&self, _image: &[u8]) -> Result<String, CaptchaError> {
        Err(CaptchaError::Recognizer("model weights missing".into()))
    }
}

fn checker(upstream: &Arc<Upstream>) -> VehicleChecker {
    VehicleChecker::builder()
        .with_connector(Arc::new(StubConnector(upstream.clone())))
        .with_captcha_recognizer(Arc::new(EchoRecognizer))
        .with_relay_retry(RetryPolicy::new(5))
        .build()
        .unwrap()
}

fn key() -> LookupKey {
    LookupKey::parse(KEY).unwrap()
}

#[tokio::test]
async fn paired_kinds_share_one_upstream_call() {
    let payload = json!({"status": 200, "RequestResult": {"vehicle": {"model": "LADA"}}});
    let upstream = Upstream::scripted(vec![Step::Respond(payload.clone())]);
    let checker = checker(&upstream);

    let general = checker
        .check_vehicle(&key(), QueryKind::GeneralInfo)
        .await
        .unwrap();
    assert_eq!(general.body, payload);
    assert_eq!(general.query_kind, Some(QueryKind::GeneralInfo));
    assert!(checker.cache().contains(&key()));

    let history = checker
        .check_vehicle(&key(), QueryKind::RegistrationHistory)
        .await
        .unwrap();
    assert_eq!(history.body, payload);
    assert_eq!(
        history.to_tagged_value()["checkType"],
        json!("История регистрации")
    );

    assert_eq!(upstream.submits().len(), 1);
    assert!(checker.cache().is_empty());

    let metrics = checker.metrics().unwrap();
    assert_eq!(metrics.global.upstream_calls, 1);
    assert_eq!(metrics.global.cache_hits, 1);
}

#[tokio::test]
async fn paired_kinds_share_one_call_in_reverse_order() {
    let upstream = Upstream::scripted(Vec::new());
    let checker = checker(&upstream);

    checker
        .check_vehicle(&key(), QueryKind::RegistrationHistory)
        .await
        .unwrap();
    let general = checker
        .check_vehicle(&key(), QueryKind::GeneralInfo)
        .await
        .unwrap();

    assert_eq!(general.query_kind, Some(QueryKind::GeneralInfo));
    assert_eq!(upstream.submits().len(), 1);
    assert!(checker.cache().is_empty());
}

#[tokio::test]
async fn unpaired_kinds_never_touch_the_cache() {
    let upstream = Upstream::scripted(Vec::new());
    let checker = checker(&upstream);

    checker
        .check_vehicle(&key(), QueryKind::InspectionCard)
        .await
        .unwrap();
    checker
        .check_vehicle(&key(), QueryKind::InspectionCard)
        .await
        .unwrap();

    assert_eq!(upstream.submits().len(), 2);
    assert!(checker.cache().is_empty());
}

#[tokio::test]
async fn no_record_is_never_retried() {
    let upstream = Upstream::scripted(vec![Step::Respond(json!({"code": 404}))]);
    let checker = checker(&upstream);

    let started = tokio::time::Instant::now();
    let err = checker
        .check_vehicle(&key(), QueryKind::WantedStatus)
        .await
        .unwrap_err();

    assert!(matches!(err, CheckError::NoRecord { kind: QueryKind::WantedStatus, .. }));
    assert!(err.is_fatal());
    assert_eq!(upstream.submits().len(), 1);
    assert_eq!(upstream.connects.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() < Duration::from_secs(1));

    let metrics = checker.metrics().unwrap();
    assert_eq!(metrics.global.fatal_failures, 1);
    assert_eq!(metrics.global.retries, 0);
}

#[tokio::test]
async fn rejected_challenge_is_replaced_with_a_fresh_one() {
    let upstream = Upstream::scripted(vec![
        Step::Respond(json!({"code": 201, "message": "captcha rejected"})),
        Step::Respond(json!({"status": 200, "RequestResult": []})),
    ]);
    let checker = checker(&upstream);

    checker
        .check_vehicle(&key(), QueryKind::AccidentHistory)
        .await
        .unwrap();

    let submits = upstream.submits();
    assert_eq!(submits.len(), 2);
    assert_ne!(submits[0].token, submits[1].token);
    assert_ne!(submits[0].solved_text, submits[1].solved_text);
    assert_eq!(submits[1].solved_text, "img-2");
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn malformed_responses_are_retried_end_to_end() {
    let upstream = Upstream::scripted(vec![
        Step::Respond(json!({"status": 500, "message": "internal"})),
        Step::Respond(json!({"status": 200, "RequestResult": {}})),
    ]);
    let checker = checker(&upstream);

    let response = checker
        .check_vehicle(&key(), QueryKind::Restrictions)
        .await
        .unwrap();

    assert_eq!(response.status, Some(200));
    assert_eq!(upstream.submits().len(), 2);
}

#[tokio::test]
async fn relay_exhaustion_escalates_to_the_outer_tier() {
    let upstream = Upstream::scripted(Vec::new())
        .with_fallback(Step::Fail(TransportError::RelayConnect("connection refused".into())));
    let checker = VehicleChecker::builder()
        .with_connector(Arc::new(StubConnector(upstream.clone())))
        .with_captcha_recognizer(Arc::new(EchoRecognizer))
        .with_relay_retry(RetryPolicy::new(5))
        .with_check_retry(RetryPolicy::new(3))
        .build()
        .unwrap();

    let err = checker
        .check_vehicle(&key(), QueryKind::WantedStatus)
        .await
        .unwrap_err();

    assert!(matches!(err, CheckError::RelayExhausted { attempts: 5, .. }));
    assert_eq!(upstream.connects.load(Ordering::SeqCst), 15);

    let submits = upstream.submits();
    assert_eq!(submits.len(), 15);
    let mut tokens: Vec<_> = submits.iter().map(|s| s.token.clone()).collect();
    tokens.sort();
    tokens.dedup();
    assert_eq!(tokens.len(), 15);

    let metrics = checker.metrics().unwrap();
    let wanted = metrics.kind(QueryKind::WantedStatus).unwrap();
    assert_eq!(wanted.retries_for(vincheck_rs::RetryTier::Relay), 12);
    assert_eq!(wanted.retries_for(vincheck_rs::RetryTier::Check), 2);
    assert_eq!(wanted.failures, 1);
    assert_eq!(wanted.fatal_failures, 0);
}

#[tokio::test]
async fn challenge_fetch_timeouts_stay_on_the_same_relay() {
    let upstream = Upstream::scripted(Vec::new());
    upstream.fetch_timeouts.store(3, Ordering::SeqCst);
    let checker = checker(&upstream);

    checker
        .check_vehicle(&key(), QueryKind::InspectionCard)
        .await
        .unwrap();

    assert_eq!(upstream.connects.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.fetches.load(Ordering::SeqCst), 4);
    assert_eq!(upstream.submits()[0].token, "tok-4");
}

#[tokio::test]
async fn solver_failures_are_fatal() {
    let upstream = Upstream::scripted(Vec::new());
    let checker = VehicleChecker::builder()
        .with_connector(Arc::new(StubConnector(upstream.clone())))
        .with_captcha_recognizer(Arc::new(BrokenRecognizer))
        .build()
        .unwrap();

    let err = checker
        .check_vehicle(&key(), QueryKind::GeneralInfo)
        .await
        .unwrap_err();

    assert!(matches!(err, CheckError::Captcha(CaptchaError::Recognizer(_))));
    assert_eq!(upstream.connects.load(Ordering::SeqCst), 1);
    assert!(upstream.submits().is_empty());
    assert!(checker.cache().is_empty());
}

#[tokio::test]
async fn unknown_labels_fail_before_any_traffic() {
    let upstream = Upstream::scripted(Vec::new());
    let checker = checker(&upstream);

    let err = checker.check_by_label(KEY, "Пробег").await.unwrap_err();
    assert!(matches!(err, CheckError::UnknownQueryKind(_)));

    let ok = checker.check_by_label(KEY, "Розыск").await.unwrap();
    assert_eq!(ok.query_kind, Some(QueryKind::WantedStatus));
    assert_eq!(upstream.submits().len(), 1);
    assert_eq!(upstream.submits()[0].kind, QueryKind::WantedStatus);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn gate_bounds_concurrent_acquisitions() {
    let upstream = Upstream::scripted(Vec::new()).with_submit_delay(Duration::from_millis(30));
    let checker = VehicleChecker::builder()
        .with_connector(Arc::new(StubConnector(upstream.clone())))
        .with_captcha_recognizer(Arc::new(EchoRecognizer))
        .with_gate_capacity(2)
        .build()
        .unwrap();

    let keys = vincheck_rs::dedup_lookup_keys([
        "XTA219060F0311934",
        "XWWFT411BA0000039",
        "TMAD281BBDJ015022",
        "Z94CT41DBHR512345",
        "WVWZZZ1KZAW123456",
        "XTA219060F0311934",
        "JTDBR32E030012345",
    ]);
    assert_eq!(keys.len(), 6);

    let mut reports = checker.check_batch(keys, QueryKind::Restrictions, CancelToken::new());
    let mut completed = 0;
    while let Some(report) = reports.recv().await {
        assert!(report.is_success(), "{:?}", report.result);
        completed += 1;
    }

    assert_eq!(completed, 6);
    assert!(upstream.peak_in_flight.load(Ordering::SeqCst) <= 2);

    let stats = checker.gate_stats();
    assert!(stats.peak_in_flight <= 2);
    assert_eq!(stats.admitted, 6);
    assert_eq!(stats.released, 6);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn cancellation_releases_the_gate_slot() {
    let upstream = Upstream::scripted(Vec::new()).with_submit_delay(Duration::from_secs(60));
    let checker = checker(&upstream);
    let cancel = CancelToken::new();

    let task = {
        let checker = checker.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            checker
                .check_vehicle_with_cancel(&key(), QueryKind::AccidentHistory, &cancel)
                .await
        })
    };

    while upstream.submits().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(checker.gate_stats().in_flight, 1);

    cancel.cancel();
    let err = task.await.unwrap().unwrap_err();

    assert!(matches!(err, CheckError::Cancelled));
    let stats = checker.gate_stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.admitted, 1);
    assert_eq!(stats.released, 1);
    assert_eq!(upstream.submits().len(), 1);
}

#[tokio::test]
async fn cancelled_batches_report_every_key() {
    let upstream = Upstream::scripted(Vec::new()).with_submit_delay(Duration::from_secs(60));
    let checker = checker(&upstream);
    let cancel = CancelToken::new();

    let keys = vincheck_rs::dedup_lookup_keys(["XTA219060F0311934", "XWWFT411BA0000039"]);
    let mut reports = checker.check_batch(keys, QueryKind::WantedStatus, cancel.clone());

    while upstream.submits().len() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();

    let mut cancelled = 0;
    while let Some(report) = reports.recv().await {
        assert!(matches!(report.result, Err(CheckError::Cancelled)));
        cancelled += 1;
    }
    assert_eq!(cancelled, 2);
    assert_eq!(checker.gate_stats().in_flight, 0);
}
