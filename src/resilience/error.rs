use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthFailed,
    RateLimit,
    Timeout,
    InvalidRequest,
    InternalError,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::InternalError => "internal_error",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed provider attempt together with its classification.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{provider}: {kind}: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub provider: String,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            provider: provider.into(),
            message: message.into(),
        }
    }
}

// Checked in order; the first matching group wins.
const AUTH_TERMS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid_api_key",
    "invalid x-api-key",
    "incorrect api key",
    "apikey",
    "authentication",
    "permission denied",
    "permission_denied",
];

const RATE_LIMIT_TERMS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "ratelimit",
    "quota",
    "too many",
    "resource_exhausted",
    "overloaded",
];

const TIMEOUT_TERMS: &[&str] = &["timeout", "timed out", "deadline"];

const INVALID_REQUEST_TERMS: &[&str] = &[
    "invalid request",
    "invalid_request",
    "malformed",
    "bad request",
];

const INTERNAL_TERMS: &[&str] = &[
    "gateway",
    "internal server error",
    "internal error",
    "server error",
    "service unavailable",
];

// Status codes only count as whole tokens, never inside ids or byte counts.
static AUTH_CODES: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"\b(401|403)\b").ok());
static RATE_LIMIT_CODES: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"\b(429|503)\b").ok());
static INVALID_REQUEST_CODES: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"\b400\b").ok());
static STATUS_5XX: LazyLock<Option<regex::Regex>> =
    LazyLock::new(|| regex::Regex::new(r"\b5\d\d\b").ok());

fn has_code(re: &LazyLock<Option<regex::Regex>>, haystack: &str) -> bool {
    re.as_ref().is_some_and(|re| re.is_match(haystack))
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classifies an error message. Pure and deterministic; `provider` is
/// accepted for symmetry with the call sites but never changes the result.
pub fn classify(message: &str, _provider: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if contains_any(&lower, AUTH_TERMS) || has_code(&AUTH_CODES, &lower) {
        return ErrorKind::AuthFailed;
    }
    if contains_any(&lower, RATE_LIMIT_TERMS) || has_code(&RATE_LIMIT_CODES, &lower) {
        return ErrorKind::RateLimit;
    }
    if contains_any(&lower, TIMEOUT_TERMS) {
        return ErrorKind::Timeout;
    }
    if contains_any(&lower, INVALID_REQUEST_TERMS) || has_code(&INVALID_REQUEST_CODES, &lower) {
        return ErrorKind::InvalidRequest;
    }
    if contains_any(&lower, INTERNAL_TERMS) || has_code(&STATUS_5XX, &lower) {
        return ErrorKind::InternalError;
    }
    ErrorKind::Unknown
}

/// Classifies an `anyhow::Error` coming back from a provider call.
///
/// Errors that already carry a classification (backends that saw the HTTP
/// status) keep it; reqwest timeouts are `Timeout`; everything else goes
/// through the message heuristics over the full context chain.
pub fn classify_error(err: &anyhow::Error, provider: &str) -> ClassifiedError {
    if let Some(classified) = err.downcast_ref::<ClassifiedError>() {
        return ClassifiedError {
            provider: provider.to_string(),
            ..classified.clone()
        };
    }
    let message = format!("{err:#}");
    if let Some(e) = err.downcast_ref::<reqwest::Error>()
        && e.is_timeout()
    {
        return ClassifiedError::new(ErrorKind::Timeout, provider, message);
    }
    ClassifiedError::new(classify(&message, provider), provider, message)
}

/// Maps an HTTP status from a provider API onto the taxonomy.
pub fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::AuthFailed,
        429 | 503 => ErrorKind::RateLimit,
        408 | 504 => ErrorKind::Timeout,
        400 | 404 | 413 | 422 => ErrorKind::InvalidRequest,
        s if (500..600).contains(&s) => ErrorKind::InternalError,
        _ => ErrorKind::Unknown,
    }
}
