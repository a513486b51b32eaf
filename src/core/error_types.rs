//! Shared constants for structured API errors and the upstream failure taxonomy.

use std::fmt;

pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_TIMEOUT: &str = "timeout_error";
pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_UPSTREAM: &str = "upstream_error";
pub const ERROR_TYPE_TRANSLATION: &str = "translation_error";

pub const FAILURE_CHALLENGE_PAGE: &str = "challenge_page";
pub const FAILURE_SERVICE_UNAVAILABLE: &str = "service_unavailable";
pub const FAILURE_SERVER_ERROR: &str = "server_error";
pub const FAILURE_RATE_LIMITED: &str = "rate_limited";
pub const FAILURE_FREE_QUOTA_EXCEEDED: &str = "free_quota_exceeded";
pub const FAILURE_SERVER_OVERLOADED: &str = "server_overloaded";
pub const FAILURE_NO_CONTENT: &str = "no_content";
pub const FAILURE_NO_TASK_IDS: &str = "no_task_ids";

/// Why a single upstream attempt failed.
///
/// Recoverable reasons are solved by switching credentials; fatal reasons
/// describe a systemic upstream condition and end the call immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// Bot/browser challenge page
    ChallengePage,
    /// Generic "Service Unavailable" HTML page
    ServiceUnavailable,
    /// Bare "Internal Server Error" sentinel
    ServerError,
    /// Per-credential rate-limit sentinel
    RateLimited,
    /// Free-tier daily quota exhausted for this credential
    FreeQuotaExceeded,
    /// "Server overloaded" result message
    ServerOverloaded,
    /// The stream ended without any answer content
    NoContent,
    /// An image dispatch returned no task identifiers
    NoTaskIds,
}

impl FailureReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChallengePage => FAILURE_CHALLENGE_PAGE,
            Self::ServiceUnavailable => FAILURE_SERVICE_UNAVAILABLE,
            Self::ServerError => FAILURE_SERVER_ERROR,
            Self::RateLimited => FAILURE_RATE_LIMITED,
            Self::FreeQuotaExceeded => FAILURE_FREE_QUOTA_EXCEEDED,
            Self::ServerOverloaded => FAILURE_SERVER_OVERLOADED,
            Self::NoContent => FAILURE_NO_CONTENT,
            Self::NoTaskIds => FAILURE_NO_TASK_IDS,
        }
    }

    /// Whether switching to another credential can resolve this failure.
    pub const fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::RateLimited | Self::FreeQuotaExceeded | Self::NoContent | Self::NoTaskIds
        )
    }

    /// Human-readable message surfaced to callers.
    pub const fn message(self) -> &'static str {
        match self {
            Self::ChallengePage => "Upstream returned a browser challenge page",
            Self::ServiceUnavailable => "Upstream service unavailable",
            Self::ServerError => "Upstream internal server error",
            Self::RateLimited => "Upstream rate limit exceeded",
            Self::FreeQuotaExceeded => "Upstream free usage limit reached",
            Self::ServerOverloaded => "Upstream server overloaded, please try again later",
            Self::NoContent => "Upstream returned no content",
            Self::NoTaskIds => "Upstream returned no image task ids",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
