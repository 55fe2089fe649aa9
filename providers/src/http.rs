//! HTTP client construction and error-response mapping.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};

use tokio_util::sync::CancellationToken;

use crate::{InactivityTimer, ProviderError};

const CONNECT_TIMEOUT_SECS: u64 = 30;

// Idle time before the first probe. Probe interval and count are left to the OS.
const TCP_KEEPALIVE_SECS: u64 = 60;

const POOL_MAX_IDLE_PER_HOST: usize = 100;
const POOL_IDLE_TIMEOUT_SECS: u64 = 90;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

/// Transport settings for one adapter's client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpSettings {
    /// Refuse plain-HTTP endpoints. Disabled for local servers.
    pub https_only: bool,
    pub connect_timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            https_only: true,
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
        }
    }
}

impl HttpSettings {
    #[must_use]
    pub fn local() -> Self {
        Self {
            https_only: false,
            ..Self::default()
        }
    }
}

/// Build a client for one adapter. Each adapter owns its client; there is no
/// process-wide instance.
pub fn build_client(settings: &HttpSettings) -> Result<reqwest::Client, ProviderError> {
    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        reqwest::header::USER_AGENT,
        HeaderValue::from_static(concat!("helm/", env!("CARGO_PKG_VERSION"))),
    );

    reqwest::Client::builder()
        .connect_timeout(settings.connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .https_only(settings.https_only)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(Some(Duration::from_secs(POOL_IDLE_TIMEOUT_SECS)))
        .default_headers(default_headers)
        .build()
        .map_err(|e| ProviderError::Request(format!("failed to build HTTP client: {e}")))
}

const MAX_HONORED_RETRY_AFTER: Duration = Duration::from_secs(60);

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name)?.to_str().ok().map(str::trim)
}

/// Server-requested backoff.
///
/// `retry-after-ms` (fractional milliseconds) is consulted before
/// `retry-after` (whole seconds). A value of zero or of a minute or more is
/// ignored and the caller falls back to its own schedule.
#[must_use]
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let honored = |delay: &Duration| !delay.is_zero() && *delay < MAX_HONORED_RETRY_AFTER;

    let from_millis = header_str(headers, "retry-after-ms")
        .and_then(|value| value.parse::<f64>().ok())
        .and_then(|ms| Duration::try_from_secs_f64(ms / 1000.0).ok())
        .filter(honored);
    from_millis.or_else(|| {
        header_str(headers, "retry-after")
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
            .filter(honored)
    })
}

/// Explicit `x-should-retry` override, if the server sent one.
#[must_use]
pub fn retry_override(headers: &HeaderMap) -> Option<bool> {
    let value = headers.get("x-should-retry")?.to_str().ok()?;
    if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Text of an error response, cut off after `MAX_ERROR_BODY_BYTES`.
///
/// The read shares the call's inactivity window and abort token, so a server
/// that sends a status line and then stalls still ends in `Timeout`.
pub async fn read_capped_error_body(
    response: reqwest::Response,
    timer: &mut InactivityTimer,
    abort: &CancellationToken,
) -> Result<String, ProviderError> {
    let mut body = Vec::with_capacity(1024);
    let mut chunks = response.bytes_stream();
    let mut truncated = false;
    while !truncated {
        let chunk = tokio::select! {
            biased;
            () = abort.cancelled() => return Err(ProviderError::Cancelled),
            () = timer.expired() => {
                return Err(ProviderError::Timeout { window: timer.window() });
            }
            chunk = chunks.next() => chunk,
        };
        let Some(Ok(chunk)) = chunk else { break };
        timer.touch();
        let room = MAX_ERROR_BODY_BYTES - body.len();
        truncated = chunk.len() > room;
        body.extend_from_slice(&chunk[..chunk.len().min(room)]);
    }
    let mut text = String::from_utf8_lossy(&body).into_owned();
    if truncated {
        text.push_str("...(truncated)");
    }
    Ok(text)
}

/// Pull `(error.type, error.message)` out of a vendor error body.
///
/// Handles both `{"type":"error","error":{...}}` (Anthropic) and
/// `{"error":{...}}` (OpenAI-compatible).
fn vendor_error_detail(body: &str) -> (Option<String>, Option<String>) {
    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        return (None, None);
    };
    let error = &json["error"];
    let kind = error["type"]
        .as_str()
        .or_else(|| error["code"].as_str())
        .map(str::to_string);
    let message = error["message"]
        .as_str()
        .or_else(|| error.as_str())
        .map(str::to_string);
    (kind, message)
}

/// Map a non-success response into a typed error, keeping the vendor message intact.
pub async fn error_from_response(
    response: reqwest::Response,
    timer: &mut InactivityTimer,
    abort: &CancellationToken,
) -> ProviderError {
    let status = response.status();
    let headers = response.headers().clone();
    match read_capped_error_body(response, timer, abort).await {
        Ok(body) => classify_status(status, &headers, &body),
        Err(interrupted) => interrupted,
    }
}

pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    let (kind, message) = vendor_error_detail(body);
    let message = message.unwrap_or_else(|| {
        if body.trim().is_empty() {
            status.to_string()
        } else {
            body.to_string()
        }
    });
    let code = status.as_u16();

    if matches!(code, 401 | 403) {
        return ProviderError::Authentication {
            status: code,
            message,
        };
    }

    match retry_override(headers) {
        Some(true) => return ProviderError::Retryable(format!("HTTP {code}: {message}")),
        Some(false) => {
            return ProviderError::Validation {
                status: code,
                message,
            };
        }
        None => {}
    }

    let retry_after = parse_retry_after(headers);

    // 529 is Anthropic's overloaded status.
    if code == 529 || kind.as_deref() == Some("overloaded_error") {
        return ProviderError::Overloaded {
            message,
            retry_after,
        };
    }

    match code {
        429 => ProviderError::RateLimited {
            message,
            retry_after,
        },
        500..=599 => ProviderError::Server {
            status: code,
            message,
            retry_after,
        },
        _ => ProviderError::Validation {
            status: code,
            message,
        },
    }
}
