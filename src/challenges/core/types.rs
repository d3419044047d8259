//! Core data structures shared by the acquirer, executor, classifier, and
//! orchestration layers.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Seventeen word characters, lowercase `i`, `o` and `q` excluded.
static LOOKUP_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[^\Wioq]{17}$").expect("invalid lookup key regex"));

/// Vehicle identifier every query is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LookupKey(String);

impl LookupKey {
    /// Validate and wrap a raw identifier.
    pub fn parse(raw: impl AsRef<str>) -> Result<Self, InvalidLookupKey> {
        let raw = raw.as_ref().trim();
        if LOOKUP_KEY_RE.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidLookupKey(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LookupKey {
    type Err = InvalidLookupKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid lookup key '{0}'")]
pub struct InvalidLookupKey(pub String);

/// Validate and deduplicate raw identifiers, silently dropping the invalid
/// ones. First occurrence order is preserved.
pub fn dedup_lookup_keys<I, S>(raw: I) -> Vec<LookupKey>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .filter_map(|value| LookupKey::parse(value).ok())
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

/// Categories of information the upstream can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueryKind {
    GeneralInfo,
    RegistrationHistory,
    AccidentHistory,
    WantedStatus,
    Restrictions,
    InspectionCard,
}

/// Upstream routing for a query kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    /// Value sent as the `checkType` form field.
    pub check_type: &'static str,
    /// Path segment appended to the query base URL.
    pub path: &'static str,
}

impl QueryKind {
    pub const ALL: [QueryKind; 6] = [
        QueryKind::GeneralInfo,
        QueryKind::RegistrationHistory,
        QueryKind::AccidentHistory,
        QueryKind::WantedStatus,
        QueryKind::Restrictions,
        QueryKind::InspectionCard,
    ];

    pub fn code(self) -> &'static str {
        match self {
            QueryKind::GeneralInfo => "general-info",
            QueryKind::RegistrationHistory => "registration-history",
            QueryKind::AccidentHistory => "accident-history",
            QueryKind::WantedStatus => "wanted-status",
            QueryKind::Restrictions => "restrictions",
            QueryKind::InspectionCard => "inspection-card",
        }
    }

    /// Label used to tag responses for downstream consumers.
    pub fn label(self) -> &'static str {
        match self {
            QueryKind::GeneralInfo => "Общая информация о ТС",
            QueryKind::RegistrationHistory => "История регистрации",
            QueryKind::AccidentHistory => "ДТП",
            QueryKind::WantedStatus => "Розыск",
            QueryKind::Restrictions => "Ограничения на рег. действия",
            QueryKind::InspectionCard => "Диагностическая карта",
        }
    }

    pub fn endpoint(self) -> Endpoint {
        let (check_type, path) = match self {
            QueryKind::GeneralInfo | QueryKind::RegistrationHistory => ("history", "register"),
            QueryKind::AccidentHistory => ("auisdtp", "dtp"),
            QueryKind::WantedStatus => ("wanted", "wanted"),
            QueryKind::Restrictions => ("restricted", "restrict"),
            QueryKind::InspectionCard => ("diagnostic", "diagnostic"),
        };
        Endpoint { check_type, path }
    }

    /// Paired kinds are answered by the same upstream call.
    pub fn is_paired(self) -> bool {
        self.partner().is_some()
    }

    pub fn partner(self) -> Option<QueryKind> {
        match self {
            QueryKind::GeneralInfo => Some(QueryKind::RegistrationHistory),
            QueryKind::RegistrationHistory => Some(QueryKind::GeneralInfo),
            _ => None,
        }
    }
}

impl fmt::Display for QueryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for QueryKind {
    type Err = UnknownQueryKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        QueryKind::ALL
            .into_iter()
            .find(|kind| kind.code().eq_ignore_ascii_case(trimmed) || kind.label() == trimmed)
            .ok_or_else(|| UnknownQueryKind(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown query kind '{0}'")]
pub struct UnknownQueryKind(pub String);

/// Challenge body returned by the upstream captcha endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CaptchaPayload {
    #[serde(rename = "base64jpg")]
    pub image_base64: String,
    pub token: String,
}

/// Visual challenge plus its validation token. Built fresh per attempt.
#[derive(Clone)]
pub struct Challenge {
    pub image: Bytes,
    pub token: String,
    pub solved_text: String,
}

impl Challenge {
    pub fn new(image: Bytes, token: impl Into<String>) -> Self {
        Self {
            image,
            token: token.into(),
            solved_text: String::new(),
        }
    }

    pub fn with_solution(mut self, text: impl Into<String>) -> Self {
        self.solved_text = text.into();
        self
    }

    pub fn is_solved(&self) -> bool {
        !self.solved_text.is_empty()
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Challenge")
            .field("image_len", &self.image.len())
            .field("token", &self.token)
            .field("solved_text", &self.solved_text)
            .finish()
    }
}

/// Everything needed for one upstream query.
#[derive(Debug, Clone)]
pub struct QueryDescriptor {
    pub key: LookupKey,
    pub kind: QueryKind,
    pub challenge: Challenge,
}

impl QueryDescriptor {
    pub fn new(key: LookupKey, kind: QueryKind, challenge: Challenge) -> Self {
        Self {
            key,
            kind,
            challenge,
        }
    }

    pub fn form_fields(&self) -> HashMap<String, String> {
        HashMap::from([
            ("vin".to_string(), self.key.to_string()),
            (
                "checkType".to_string(),
                self.kind.endpoint().check_type.to_string(),
            ),
            ("captchaWord".to_string(), self.challenge.solved_text.clone()),
            ("captchaToken".to_string(), self.challenge.token.clone()),
        ])
    }
}

/// Decoded upstream body with the fields classification relies on.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: Option<i64>,
    pub code: Option<i64>,
    pub body: Value,
    pub query_kind: Option<QueryKind>,
}

impl RawResponse {
    pub fn from_value(body: Value) -> Self {
        let status = body.get("status").and_then(as_code);
        let code = body.get("code").and_then(as_code);
        Self {
            status,
            code,
            body,
            query_kind: None,
        }
    }

    /// Tag the response with the kind it answers.
    pub fn tagged(mut self, kind: QueryKind) -> Self {
        self.query_kind = Some(kind);
        self
    }

    /// Body with the `checkType` tag inserted, as handed to downstream consumers.
    pub fn to_tagged_value(&self) -> Value {
        let mut value = self.body.clone();
        if let (Some(kind), Value::Object(map)) = (self.query_kind, &mut value) {
            map.insert("checkType".into(), Value::String(kind.label().to_string()));
        }
        value
    }
}

// The upstream sometimes sends numeric fields as strings.
fn as_code(value: &Value) -> Option<i64> {
    match value {
        Value::Number(number) => number.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
