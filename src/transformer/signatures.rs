//! Known upstream failure signatures.
//!
//! Checked in priority order against each raw line (and against whole
//! bodies of non-success responses). The first match wins.

use crate::core::error_types::FailureReason;
use crate::transformer::stream::strip_data_prefix;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

static CHALLENGE_HTML: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^<!DOCTYPE html><html.*?><head>.*?</head><body.*?>.*?</body></html>$")
        .expect("valid challenge html pattern")
});

static CHALLENGE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"<title>Just a moment\.\.\.</title>",
        r"window\._cf_chl_opt",
        r"challenge-platform/h/b/orchestrate/chl_page",
        r"cdn-cgi/challenge-platform",
        r#"<meta http-equiv="refresh" content="\d+">"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid challenge marker"))
    .collect()
});

static UNAVAILABLE_HTML: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^<!doctype html><html.*?><head>.*?</head><body.*?>.*?</body></html>")
        .expect("valid unavailable html pattern")
});

static UNAVAILABLE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"<title>Genspark</title>",
        r"Service\s+Unavailable",
        r#"(?s)class="bb".*?class="s1".*?class="s2".*?class="s3""#,
        r"genspark_logo\.png",
        r"(?s)gensparkpublicblob-cdn.*?\.azurefd\.net",
        r#"<div class="tt">Service Unavailable</div>"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid unavailable marker"))
    .collect()
});

const UNAVAILABLE_MIN_MARKERS: usize = 3;

const SERVER_ERROR: &str = "Internal Server Error";
const RATE_LIMIT_PREFIX: &str = "Rate limit exceeded";
const FREE_QUOTA_ACTION: &str = "ACTION_QUOTA_EXCEEDED";
const FREE_QUOTA_MESSAGE: &str = "You've reached your free usage limit today";
const OVERLOADED_MESSAGE: &str = "Server overloaded, please try again later.";

pub fn is_challenge_page(data: &str) -> bool {
    CHALLENGE_HTML.is_match(data.trim()) && CHALLENGE_MARKERS.iter().any(|re| re.is_match(data))
}

pub fn is_service_unavailable_page(data: &str) -> bool {
    if !UNAVAILABLE_HTML.is_match(data.trim()) {
        return false;
    }
    UNAVAILABLE_MARKERS
        .iter()
        .filter(|re| re.is_match(data))
        .count()
        >= UNAVAILABLE_MIN_MARKERS
}

pub fn is_server_error(data: &str) -> bool {
    data.trim() == SERVER_ERROR
}

/// `Rate limit exceeded cf1` / `cf2` and friends.
pub fn is_rate_limited(data: &str) -> bool {
    data.trim().starts_with(RATE_LIMIT_PREFIX)
}

/// The fields of a `message_result` line that carry upstream sentinels.
#[derive(Debug, Deserialize)]
struct ResultLine {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    action: Option<ResultAction>,
}

#[derive(Debug, Deserialize)]
struct ResultAction {
    #[serde(rename = "type", default)]
    kind: Option<String>,
}

/// Decode `data` as a single `message_result` event line.
fn result_line(data: &str) -> Option<ResultLine> {
    let payload = strip_data_prefix(data)?;
    serde_json::from_str::<ResultLine>(payload)
        .ok()
        .filter(|line| line.kind == "message_result")
}

/// Only a `message_result` flagged with the quota action (or carrying the
/// exact limit message) counts; answer text quoting either does not.
pub fn is_free_quota_exceeded(data: &str) -> bool {
    result_line(data).is_some_and(|line| {
        line.action
            .and_then(|action| action.kind)
            .is_some_and(|kind| kind == FREE_QUOTA_ACTION)
            || line
                .content
                .is_some_and(|content| content.trim() == FREE_QUOTA_MESSAGE)
    })
}

pub fn is_server_overloaded(data: &str) -> bool {
    result_line(data).is_some_and(|line| {
        line.content
            .is_some_and(|content| content.trim() == OVERLOADED_MESSAGE)
    })
}

/// Match `data` against every known failure signature.
pub fn classify_failure(data: &str) -> Option<FailureReason> {
    if is_challenge_page(data) {
        Some(FailureReason::ChallengePage)
    } else if is_service_unavailable_page(data) {
        Some(FailureReason::ServiceUnavailable)
    } else if is_server_error(data) {
        Some(FailureReason::ServerError)
    } else if is_rate_limited(data) {
        Some(FailureReason::RateLimited)
    } else if is_free_quota_exceeded(data) {
        Some(FailureReason::FreeQuotaExceeded)
    } else if is_server_overloaded(data) {
        Some(FailureReason::ServerOverloaded)
    } else {
        None
    }
}
