//! Response classification.

use std::fmt;

use super::core::{QueryKind, RawResponse};

/// Why an attempt is worth repeating with a fresh challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    /// The solved text was wrong or stale.
    ChallengeRejected,
    UnrecognizedShape {
        status: Option<i64>,
        code: Option<i64>,
    },
}

/// Why an acquisition must stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    NoRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassifiedOutcome {
    Success(RawResponse),
    RetryableFailure(RetryReason),
    FatalFailure(FatalReason),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::ChallengeRejected => f.write_str("challenge validation rejected"),
            RetryReason::UnrecognizedShape { status, code } => write!(
                f,
                "unrecognized response shape (status={status:?}, code={code:?})"
            ),
        }
    }
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::NoRecord => f.write_str("no record"),
        }
    }
}

/// Map an upstream answer to an outcome. Rules are checked in order:
/// `status == 200` succeeds, `code == 201` is a rejected challenge, a 404 in
/// either field means there is no record, everything else is retried.
pub fn classify(response: RawResponse, kind: QueryKind) -> ClassifiedOutcome {
    let (status, code) = (response.status, response.code);

    let outcome = if status == Some(200) {
        ClassifiedOutcome::Success(response)
    } else if code == Some(201) {
        ClassifiedOutcome::RetryableFailure(RetryReason::ChallengeRejected)
    } else if status == Some(404) || code == Some(404) {
        ClassifiedOutcome::FatalFailure(FatalReason::NoRecord)
    } else {
        ClassifiedOutcome::RetryableFailure(RetryReason::UnrecognizedShape { status, code })
    };

    match &outcome {
        ClassifiedOutcome::Success(_) => {}
        ClassifiedOutcome::RetryableFailure(reason) => {
            log::debug!("[{kind}] retryable response: {reason}");
        }
        ClassifiedOutcome::FatalFailure(reason) => {
            log::debug!("[{kind}] fatal response: {reason}");
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn classify_json(value: serde_json::Value) -> ClassifiedOutcome {
        classify(RawResponse::from_value(value), QueryKind::AccidentHistory)
    }

    #[test]
    fn status_200_is_success() {
        let outcome = classify_json(json!({"status": 200, "RequestResult": {"Accidents": []}}));
        match outcome {
            ClassifiedOutcome::Success(response) => {
                assert_eq!(response.body["RequestResult"], json!({"Accidents": []}));
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn code_201_is_rejected_challenge() {
        assert_eq!(
            classify_json(json!({"code": 201, "message": "Проверка CAPTCHA не была пройдена"})),
            ClassifiedOutcome::RetryableFailure(RetryReason::ChallengeRejected)
        );
    }

    #[test]
    fn not_found_is_fatal_in_either_field() {
        assert_eq!(
            classify_json(json!({"status": 404})),
            ClassifiedOutcome::FatalFailure(FatalReason::NoRecord)
        );
        assert_eq!(
            classify_json(json!({"code": "404"})),
            ClassifiedOutcome::FatalFailure(FatalReason::NoRecord)
        );
    }

    #[test]
    fn success_status_wins_over_code() {
        assert!(matches!(
            classify_json(json!({"status": 200, "code": 404})),
            ClassifiedOutcome::Success(_)
        ));
    }

    #[test]
    fn anything_else_is_retried() {
        assert_eq!(
            classify_json(json!({"status": 500})),
            ClassifiedOutcome::RetryableFailure(RetryReason::UnrecognizedShape {
                status: Some(500),
                code: None
            })
        );
        assert!(matches!(
            classify_json(json!(["unexpected"])),
            ClassifiedOutcome::RetryableFailure(RetryReason::UnrecognizedShape { .. })
        ));
    }
}
