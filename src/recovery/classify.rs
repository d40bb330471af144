use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    DatabaseError,
    ApiError,
    ConfigError,
    AuthError,
    RateLimitError,
    TimeoutError,
    UnknownError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DatabaseError => "DATABASE_ERROR",
            ErrorKind::ApiError => "API_ERROR",
            ErrorKind::ConfigError => "CONFIG_ERROR",
            ErrorKind::AuthError => "AUTH_ERROR",
            ErrorKind::RateLimitError => "RATE_LIMIT_ERROR",
            ErrorKind::TimeoutError => "TIMEOUT_ERROR",
            ErrorKind::UnknownError => "UNKNOWN_ERROR",
        }
    }

    /// Kinds where waiting and trying again can plausibly help.
    pub fn is_transient(self) -> bool {
        !matches!(self, ErrorKind::ConfigError | ErrorKind::AuthError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// First match wins, so the narrower kinds come before the generic API bucket.
const RULES: &[(ErrorKind, &[&str])] = &[
    (
        ErrorKind::RateLimitError,
        &["rate limit", "ratelimit", "too many requests", "429", "quota"],
    ),
    (
        ErrorKind::TimeoutError,
        &["timeout", "timed out", "etimedout", "deadline exceeded"],
    ),
    (
        ErrorKind::AuthError,
        &[
            "unauthorized",
            "unauthenticated",
            "authentication",
            "forbidden",
            "invalid token",
            "token expired",
            "invalid api key",
            "401",
            "403",
        ],
    ),
    (
        ErrorKind::ConfigError,
        &[
            "configuration",
            "config",
            "not configured",
            "missing credential",
            "environment variable",
            "not set",
        ],
    ),
    (
        ErrorKind::DatabaseError,
        &[
            "database",
            "db connection",
            "sqlite",
            "postgres",
            "deadlock",
            "store unavailable",
        ],
    ),
    (
        ErrorKind::ApiError,
        &[
            "api",
            "http",
            "fetch",
            "network",
            "connection reset",
            "connection refused",
            "econnrefused",
            "bad gateway",
            "service unavailable",
            "500",
            "502",
            "503",
        ],
    ),
];

/// Case-insensitive keyword classification of free-form error text.
pub fn classify_message(message: &str) -> ErrorKind {
    let lowered = message.to_lowercase();
    RULES
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lowered.contains(needle)))
        .map(|(kind, _)| *kind)
        .unwrap_or(ErrorKind::UnknownError)
}

/// Errors the recovery engine can reason about.
///
/// Typed errors override [`Classify::error_kind`] with the kind they already
/// know; anything else falls back to text matching on the display output.
pub trait Classify: fmt::Display {
    fn error_kind(&self) -> ErrorKind {
        classify_message(&self.to_string())
    }

    /// `false` stops the retry loop at the first occurrence.
    fn is_retryable(&self) -> bool {
        true
    }
}

impl Classify for String {}

impl Classify for &str {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_matching_is_case_insensitive() {
        assert_eq!(
            classify_message("Request TIMED OUT after 15s"),
            ErrorKind::TimeoutError
        );
        assert_eq!(
            classify_message("HTTP 429 Too Many Requests"),
            ErrorKind::RateLimitError
        );
        assert_eq!(
            classify_message("Database connection lost"),
            ErrorKind::DatabaseError
        );
        assert_eq!(classify_message("401 Unauthorized"), ErrorKind::AuthError);
        assert_eq!(
            classify_message("EBAY_REFRESH_TOKEN is not set"),
            ErrorKind::ConfigError
        );
        assert_eq!(
            classify_message("upstream returned HTTP 502"),
            ErrorKind::ApiError
        );
        assert_eq!(classify_message("something odd"), ErrorKind::UnknownError);
    }

    #[test]
    fn rate_limit_wins_over_api() {
        assert_eq!(
            classify_message("api responded: rate limit exceeded"),
            ErrorKind::RateLimitError
        );
    }

    #[test]
    fn kinds_serialize_screaming_snake() {
        let value = serde_json::to_value(ErrorKind::RateLimitError).unwrap();
        assert_eq!(value, serde_json::json!("RATE_LIMIT_ERROR"));
        assert_eq!(ErrorKind::TimeoutError.to_string(), "TIMEOUT_ERROR");
    }
}
