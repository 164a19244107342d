use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Provider-independent classification of a failed backend call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum ProviderErrorKind {
    Unauthorized,
    RateLimited,
    QuotaExceededUpstream,
    ServerError(u16),
    Network,
    InvalidResponse,
}

impl ProviderErrorKind {
    /// Maps a non-success HTTP status onto an error kind; `None` for 2xx.
    pub fn from_status(code: u16) -> Option<Self> {
        match code {
            200..=299 => None,
            401 | 403 => Some(Self::Unauthorized),
            402 => Some(Self::QuotaExceededUpstream),
            429 => Some(Self::RateLimited),
            other => Some(Self::ServerError(other)),
        }
    }

    /// Kinds the poll loop absorbs and keeps polling through.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Network => true,
            Self::ServerError(code) => *code >= 500,
            Self::Unauthorized | Self::QuotaExceededUpstream | Self::InvalidResponse => false,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceededUpstream => "quota_exceeded_upstream",
            Self::ServerError(_) => "server_error",
            Self::Network => "network_error",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServerError(code) => write!(f, "server_error({code})"),
            other => f.write_str(other.code()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Network, message)
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidResponse, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Stable failure classification recorded on a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    QuotaExceeded,
    SubmitFailed,
    PollTimeout,
    BackendFailed,
    NetworkError,
    Unauthorized,
    InvalidResponse,
    ProviderUnavailable,
}

impl FailureKind {
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded => "quota_exceeded",
            Self::SubmitFailed => "submit_failed",
            Self::PollTimeout => "poll_timeout",
            Self::BackendFailed => "backend_failed",
            Self::NetworkError => "network_error",
            Self::Unauthorized => "unauthorized",
            Self::InvalidResponse => "invalid_response",
            Self::ProviderUnavailable => "provider_unavailable",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GenerationError {
    #[error("generation quota exhausted{}", .plan.as_deref().map(|plan| format!(" on plan '{plan}'")).unwrap_or_default())]
    QuotaExceeded {
        plan: Option<String>,
        limit: Option<i64>,
    },
    #[error("submit failed: {0}")]
    Submit(ProviderError),
    #[error("task did not finish after {polls} polls ({:.1}s)", .elapsed.as_secs_f64())]
    PollTimeout { polls: u32, elapsed: Duration },
    #[error("backend reported failure: {reason}")]
    BackendFailed { reason: String },
    #[error("network error: {0}")]
    Network(ProviderError),
    #[error("unauthorized: {0}")]
    Unauthorized(ProviderError),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("provider '{0}' is not registered")]
    ProviderUnavailable(String),
    #[error("generation cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Classifies an error returned by submit. Upstream quota refusals surface as
    /// `QuotaExceeded`; everything else is reported verbatim as a submit failure.
    pub fn from_submit(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::QuotaExceededUpstream => Self::QuotaExceeded {
                plan: None,
                limit: None,
            },
            _ => Self::Submit(err),
        }
    }

    /// Classifies a terminal error from status, fetch or quota calls.
    pub fn from_provider(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::Unauthorized => Self::Unauthorized(err),
            ProviderErrorKind::InvalidResponse => Self::InvalidResponse(err.message),
            ProviderErrorKind::QuotaExceededUpstream => Self::QuotaExceeded {
                plan: None,
                limit: None,
            },
            ProviderErrorKind::ServerError(code) if code < 500 => Self::BackendFailed {
                reason: format!("HTTP {code}: {}", err.message),
            },
            ProviderErrorKind::ServerError(_)
            | ProviderErrorKind::RateLimited
            | ProviderErrorKind::Network => Self::Network(err),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// `None` for cancellation, which is a terminal state of its own rather than a failure.
    pub fn failure_kind(&self) -> Option<FailureKind> {
        let kind = match self {
            Self::QuotaExceeded { .. } => FailureKind::QuotaExceeded,
            Self::Submit(_) => FailureKind::SubmitFailed,
            Self::PollTimeout { .. } => FailureKind::PollTimeout,
            Self::BackendFailed { .. } => FailureKind::BackendFailed,
            Self::Network(_) => FailureKind::NetworkError,
            Self::Unauthorized(_) => FailureKind::Unauthorized,
            Self::InvalidResponse(_) => FailureKind::InvalidResponse,
            Self::ProviderUnavailable(_) => FailureKind::ProviderUnavailable,
            Self::Cancelled => return None,
        };
        Some(kind)
    }

    pub fn code(&self) -> &'static str {
        self.failure_kind()
            .map(|kind| kind.code())
            .unwrap_or("cancelled")
    }
}
