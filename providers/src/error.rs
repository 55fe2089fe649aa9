//! Error taxonomy for provider calls.
//!
//! Every failure an adapter can produce is a [`ProviderError`]. The retry layer
//! decides what to do with it through [`RetryClassify`](crate::retry::RetryClassify);
//! the UI decides how to present it through [`ErrorKind`].

use std::time::Duration;

use thiserror::Error;

/// Coarse category used by callers to choose how to react (retry, stop, show "canceled").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    RateLimit,
    Inactivity,
    Protocol,
    Authentication,
    Validation,
    Cancellation,
    Other,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("connection closed before stream completed")]
    StreamClosed,

    #[error("request exceeded hard timeout of {}s", after.as_secs())]
    HardTimeout { after: Duration },

    /// No stream activity within the configured window.
    #[error("stream idle for {}s", window.as_secs())]
    Timeout { window: Duration },

    #[error("rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("provider overloaded: {message}")]
    Overloaded {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("server error {status}: {message}")]
    Server {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("authentication failed ({status}): {message}")]
    Authentication { status: u16, message: String },

    #[error("request rejected ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("invalid stream payload: {0}")]
    Protocol(String),

    /// In-band stream error with a vendor-specific type we do not classify further.
    #[error("{kind}: {message}")]
    Vendor { kind: String, message: String },

    #[error("request canceled")]
    Cancelled,

    /// The server explicitly asked for a retry (`x-should-retry: true`).
    #[error("retryable error: {0}")]
    Retryable(String),

    #[error("failed to build request: {0}")]
    Request(String),
}

impl ProviderError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::Transport(_)
            | ProviderError::StreamClosed
            | ProviderError::HardTimeout { .. }
            | ProviderError::Server { .. }
            | ProviderError::Retryable(_) => ErrorKind::Transport,
            ProviderError::RateLimited { .. } | ProviderError::Overloaded { .. } => {
                ErrorKind::RateLimit
            }
            ProviderError::Timeout { .. } => ErrorKind::Inactivity,
            ProviderError::Protocol(_) => ErrorKind::Protocol,
            ProviderError::Authentication { .. } => ErrorKind::Authentication,
            ProviderError::Validation { .. } => ErrorKind::Validation,
            ProviderError::Cancelled => ErrorKind::Cancellation,
            ProviderError::Vendor { .. } | ProviderError::Request(_) => ErrorKind::Other,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    /// Whether the failure is transient and the same request may succeed later.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Transport(e) => is_retryable_transport(e),
            ProviderError::StreamClosed
            | ProviderError::HardTimeout { .. }
            | ProviderError::Timeout { .. }
            | ProviderError::RateLimited { .. }
            | ProviderError::Overloaded { .. }
            | ProviderError::Server { .. }
            | ProviderError::Retryable(_) => true,
            ProviderError::Authentication { .. }
            | ProviderError::Validation { .. }
            | ProviderError::Protocol(_)
            | ProviderError::Vendor { .. }
            | ProviderError::Cancelled
            | ProviderError::Request(_) => false,
        }
    }

    /// Vendor-requested delay before the next attempt, when one was sent.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after, .. }
            | ProviderError::Overloaded { retry_after, .. }
            | ProviderError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Map an in-band stream error (`{"type": "overloaded_error", ...}`) to a variant.
    #[must_use]
    pub fn from_vendor_error(kind: &str, message: String) -> Self {
        match kind {
            "overloaded_error" => ProviderError::Overloaded {
                message,
                retry_after: None,
            },
            "rate_limit_error" | "rate_limit_exceeded" => ProviderError::RateLimited {
                message,
                retry_after: None,
            },
            "api_error" | "server_error" => ProviderError::Server {
                status: 500,
                message,
                retry_after: None,
            },
            "authentication_error" | "permission_error" => ProviderError::Authentication {
                status: 401,
                message,
            },
            "invalid_request_error" => ProviderError::Validation {
                status: 400,
                message,
            },
            other => ProviderError::Vendor {
                kind: other.to_string(),
                message,
            },
        }
    }
}

/// Connection failures and transport timeouts. Body errors while streaming
/// surface as [`ProviderError::StreamClosed`] instead.
fn is_retryable_transport(error: &reqwest::Error) -> bool {
    error.is_connect() || error.is_timeout()
}
