//! User-facing failure messages.
//!
//! Raw backend error strings are never shown as-is. Every terminal failure is
//! first folded into one of a handful of [`ErrorCategory`] values, each of
//! which carries a fixed message.

use crate::error::AtelierError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    RateLimited,
    Auth,
    Server,
    Network,
    Generic,
}

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "quota",
    "exceeded",
    "resource_exhausted",
    "exhausted",
    "feature execution error",
];
const AUTH_MARKERS: &[&str] = &["401", "unauthorized", "auth expired", "refresh failed"];
const SERVER_MARKERS: &[&str] = &["500", "502", "503", "server", "internal"];
const NETWORK_MARKERS: &[&str] = &["network", "timeout", "timed out", "connection", "transport"];

impl ErrorCategory {
    /// Classify a raw error string (backend `error` field, exception text, ...).
    ///
    /// Markers are checked in priority order: rate limiting first, since quota
    /// errors are frequently wrapped in a 500 by the feature service.
    pub fn classify(raw: &str) -> Self {
        let raw = raw.to_lowercase();
        let hit = |markers: &[&str]| markers.iter().any(|m| raw.contains(m));

        if hit(RATE_LIMIT_MARKERS) {
            ErrorCategory::RateLimited
        } else if hit(AUTH_MARKERS) {
            ErrorCategory::Auth
        } else if hit(SERVER_MARKERS) {
            ErrorCategory::Server
        } else if hit(NETWORK_MARKERS) {
            ErrorCategory::Network
        } else {
            ErrorCategory::Generic
        }
    }

    pub fn of(err: &AtelierError) -> Self {
        match err {
            AtelierError::AuthExpired(_) | AtelierError::RefreshFailed(_) => ErrorCategory::Auth,
            AtelierError::TransportError(_) | AtelierError::PollTimeout { .. } => {
                ErrorCategory::Network
            }
            AtelierError::HttpStatus { status: 429, .. } => ErrorCategory::RateLimited,
            AtelierError::HttpStatus { status, .. } if *status >= 500 => ErrorCategory::Server,
            other => Self::classify(&other.to_string()),
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCategory::RateLimited => {
                "Daily image/video creation limit reached. Please try again tomorrow."
            }
            ErrorCategory::Auth => "Authentication error. Please log in again.",
            ErrorCategory::Server => "Server is busy. Please try again in a few minutes.",
            ErrorCategory::Network => {
                "Network connection error. Please check your internet and try again."
            }
            ErrorCategory::Generic => "Something went wrong. Please try again.",
        }
    }
}

/// Shorthand for `ErrorCategory::classify(raw).message()`.
pub fn user_message(raw: &str) -> &'static str {
    ErrorCategory::classify(raw).message()
}
