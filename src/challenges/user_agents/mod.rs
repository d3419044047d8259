//! Browser header profiles.
//!
//! Responsibilities:
//! - Ship a set of desktop browser identities (User-Agent plus client hints).
//! - Optionally load replacement identities from a JSON file.
//! - Select one profile per client, filtered by platform/browser.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// One desktop browser identity.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BrowserIdentity {
    pub browser: String,
    pub platform: String,
    pub user_agent: String,
    /// `Sec-Ch-Ua` brand list; empty for browsers that do not send client hints.
    #[serde(default)]
    pub brands: String,
}

static BUILTIN_IDENTITIES: Lazy<Vec<BrowserIdentity>> = Lazy::new(|| {
    let chrome_brands = r#""Chromium";v="124", "Google Chrome";v="124", "Not-A.Brand";v="99""#;
    let edge_brands = r#""Chromium";v="124", "Microsoft Edge";v="124", "Not-A.Brand";v="99""#;
    vec![
        identity(
            "chrome",
            "windows",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            chrome_brands,
        ),
        identity(
            "chrome",
            "linux",
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            chrome_brands,
        ),
        identity(
            "chrome",
            "macos",
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
            chrome_brands,
        ),
        identity(
            "edge",
            "windows",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
            edge_brands,
        ),
        identity(
            "firefox",
            "windows",
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
            "",
        ),
        identity(
            "firefox",
            "linux",
            "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
            "",
        ),
    ]
});

fn identity(browser: &str, platform: &str, user_agent: &str, brands: &str) -> BrowserIdentity {
    BrowserIdentity {
        browser: browser.into(),
        platform: platform.into(),
        user_agent: user_agent.into(),
        brands: brands.into(),
    }
}

/// Options to filter/select a profile.
#[derive(Debug, Clone, Default)]
pub struct UserAgentOptions {
    /// Fixed User-Agent string; bypasses selection entirely.
    pub custom: Option<String>,
    pub platform: Option<String>,
    pub browser: Option<String>,
    pub allow_brotli: bool,
    /// JSON array of [`BrowserIdentity`] replacing the built-in set.
    pub identities_file: Option<PathBuf>,
}

/// Final selected profile.
#[derive(Debug, Clone)]
pub struct UserAgentProfile {
    pub headers: HashMap<String, String>,
}

impl UserAgentProfile {
    pub fn user_agent(&self) -> Option<&str> {
        self.headers.get("User-Agent").map(String::as_str)
    }
}

/// Retrieve a profile using given options.
pub fn get_user_agent_profile(opts: UserAgentOptions) -> Result<UserAgentProfile, UserAgentError> {
    if let Some(custom) = opts.custom.as_deref() {
        let mut headers = base_headers(opts.allow_brotli);
        headers.insert("User-Agent".into(), custom.to_string());
        return Ok(UserAgentProfile { headers });
    }

    let loaded;
    let identities: &[BrowserIdentity] = match opts.identities_file.as_deref() {
        Some(path) => {
            loaded = load_identities(path)?;
            loaded.as_slice()
        }
        None => BUILTIN_IDENTITIES.as_slice(),
    };

    select_profile(identities, &opts)
}

fn select_profile(
    identities: &[BrowserIdentity],
    opts: &UserAgentOptions,
) -> Result<UserAgentProfile, UserAgentError> {
    let candidates: Vec<&BrowserIdentity> = identities
        .iter()
        .filter(|id| {
            opts.platform
                .as_deref()
                .is_none_or(|platform| id.platform.eq_ignore_ascii_case(platform))
        })
        .filter(|id| {
            opts.browser
                .as_deref()
                .is_none_or(|browser| id.browser.eq_ignore_ascii_case(browser))
        })
        .collect();

    if candidates.is_empty() {
        return Err(match (&opts.platform, &opts.browser) {
            (None, None) => UserAgentError::ProfileNotFound,
            (platform, browser) => UserAgentError::InvalidOptions(
                format!(
                    "no identity for platform {:?} and browser {:?}",
                    platform.as_deref().unwrap_or("*"),
                    browser.as_deref().unwrap_or("*")
                )
                .into(),
            ),
        });
    }

    let chosen = candidates
        .choose(&mut rand::thread_rng())
        .ok_or(UserAgentError::ProfileNotFound)?;

    let mut headers = base_headers(opts.allow_brotli);
    headers.insert("User-Agent".into(), chosen.user_agent.clone());
    if !chosen.brands.is_empty() {
        headers.insert("Sec-Ch-Ua".into(), chosen.brands.clone());
        headers.insert("Sec-Ch-Ua-Mobile".into(), "?0".into());
        headers.insert(
            "Sec-Ch-Ua-Platform".into(),
            format!("\"{}\"", client_hint_platform(&chosen.platform)),
        );
    }

    Ok(UserAgentProfile { headers })
}

fn load_identities(path: &Path) -> Result<Vec<BrowserIdentity>, UserAgentError> {
    let contents = fs::read_to_string(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => UserAgentError::FileMissing {
            path: path.to_path_buf(),
        },
        _ => UserAgentError::Io {
            path: path.to_path_buf(),
            source: err,
        },
    })?;
    serde_json::from_str(&contents).map_err(|err| UserAgentError::InvalidJson {
        path: path.to_path_buf(),
        source: err,
    })
}

fn client_hint_platform(platform: &str) -> &str {
    match platform {
        "windows" => "Windows",
        "linux" => "Linux",
        "macos" => "macOS",
        other => other,
    }
}

// The lookup API is called cross-site from the public portal via XHR.
fn base_headers(allow_brotli: bool) -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert("Accept".into(), "application/json, text/plain, */*".into());
    map.insert(
        "Accept-Language".into(),
        "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7".into(),
    );
    let encoding = if allow_brotli {
        "gzip, deflate, br"
    } else {
        "gzip, deflate"
    };
    map.insert("Accept-Encoding".into(), encoding.into());
    map.insert("Sec-Fetch-Dest".into(), "empty".into());
    map.insert("Sec-Fetch-Mode".into(), "cors".into());
    map.insert("Sec-Fetch-Site".into(), "cross-site".into());
    map
}

#[derive(Debug, Error)]
pub enum UserAgentError {
    #[error("user-agent data file missing: {path:?}")]
    FileMissing { path: PathBuf },
    #[error("user-agent JSON invalid at {path:?}: {source}")]
    InvalidJson {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("I/O error reading {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("invalid user-agent options: {0}")]
    InvalidOptions(Cow<'static, str>),
    #[error("no matching user-agent profile found")]
    ProfileNotFound,
}
