//! Server-sent event framing and the shared stream loop.
//!
//! Adapters supply an [`SseDecoder`] that turns JSON payloads into observer
//! callbacks and accumulated result state. [`process_sse_stream`] handles the
//! parts every vendor shares: splitting frames on blank lines in either line
//! ending, bounding the pending buffer, rejecting non-UTF-8 frames, the
//! `[DONE]` sentinel, and giving up after repeated unparseable payloads. It
//! also races each read against the abort token and the inactivity timer.

use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{InactivityTimer, ProviderError, StreamObserver};

const MAX_PENDING_BYTES: usize = 4 * 1024 * 1024;

const MAX_CONSECUTIVE_BAD_PAYLOADS: usize = 3;

/// Offset and length of the first blank-line terminator in `buffer`.
pub(crate) fn event_terminator(buffer: &[u8]) -> Option<(usize, usize)> {
    (0..buffer.len()).find_map(|i| {
        let rest = &buffer[i..];
        if rest.starts_with(b"\n\n") {
            Some((i, 2))
        } else if rest.starts_with(b"\r\n\r\n") {
            Some((i, 4))
        } else {
            None
        }
    })
}

pub(crate) fn take_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (end, terminator) = event_terminator(buffer)?;
    let mut event: Vec<u8> = buffer.drain(..end + terminator).collect();
    event.truncate(end);
    Some(event)
}

/// Newline-joined `data:` fields of one frame, or `None` for frames without
/// any (`: keepalive` and the like).
pub(crate) fn event_data(event: &str) -> Option<String> {
    let mut fields = event
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|value| value.strip_prefix(' ').unwrap_or(value));
    let first = fields.next()?;
    Some(fields.fold(first.to_string(), |mut data, value| {
        data.push('\n');
        data.push_str(value);
        data
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DecodeAction {
    Continue,
    /// The vendor signaled the end of the message.
    Done,
}

/// Vendor-specific streaming state machine.
pub(crate) trait SseDecoder {
    fn decode(
        &mut self,
        json: serde_json::Value,
        observer: &dyn StreamObserver,
    ) -> Result<DecodeAction, ProviderError>;

    /// Called on the `[DONE]` sentinel and on an accepted end of stream.
    fn finalize(&mut self, observer: &dyn StreamObserver);

    /// Whether a bare EOF counts as completion (a finish reason was already seen).
    fn completed_on_eof(&self) -> bool {
        false
    }

    fn provider_name(&self) -> &'static str;
}

/// Typed view of a vendor payload. Shapes the decoder does not model are
/// logged and skipped.
pub(crate) fn typed_payload<T: DeserializeOwned>(
    json: serde_json::Value,
    provider: &'static str,
) -> Option<T> {
    serde_json::from_value(json)
        .inspect_err(|e| tracing::warn!(%e, provider, "Skipping unrecognized stream payload"))
        .ok()
}

/// Drive `stream` through `decoder` until the vendor signals completion.
///
/// `timer` is the call's inactivity window, already running since the request
/// was sent. Every chunk, heartbeat comments included, pushes it forward.
/// Abort wins over every other branch.
pub(crate) async fn process_sse_stream<S, B, D>(
    stream: S,
    decoder: &mut D,
    observer: &dyn StreamObserver,
    abort: &CancellationToken,
    timer: &mut InactivityTimer,
) -> Result<(), ProviderError>
where
    S: Stream<Item = Result<B, reqwest::Error>>,
    B: AsRef<[u8]>,
    D: SseDecoder,
{
    let mut stream = std::pin::pin!(stream);
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            () = abort.cancelled() => return Err(ProviderError::Cancelled),
            () = timer.expired() => {
                tracing::warn!(
                    provider = decoder.provider_name(),
                    window_secs = timer.window().as_secs(),
                    "Stream idle timeout"
                );
                return Err(ProviderError::Timeout { window: timer.window() });
            }
            next = stream.next() => next,
        };

        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            // Reset or truncated body after the response started.
            Err(e) if e.is_body() || e.is_decode() => {
                tracing::warn!(%e, provider = decoder.provider_name(), "Stream body interrupted");
                return Err(ProviderError::StreamClosed);
            }
            Err(e) => return Err(e.into()),
        };
        timer.touch();
        buffer.extend_from_slice(chunk.as_ref());

        if buffer.len() > MAX_PENDING_BYTES {
            return Err(ProviderError::Protocol(
                "SSE buffer exceeded maximum size (4 MiB)".to_string(),
            ));
        }

        while let Some(event) = take_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                return Err(ProviderError::Protocol(
                    "Received invalid UTF-8 from SSE stream".to_string(),
                ));
            };

            let Some(data) = event_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                decoder.finalize(observer);
                return Ok(());
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    if decoder.decode(json, observer)? == DecodeAction::Done {
                        decoder.finalize(observer);
                        return Ok(());
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        provider = decoder.provider_name(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_CONSECUTIVE_BAD_PAYLOADS {
                        return Err(ProviderError::Protocol(e.to_string()));
                    }
                }
            }
        }
    }

    if decoder.completed_on_eof() {
        decoder.finalize(observer);
        return Ok(());
    }

    // EOF before the vendor said it was finished.
    Err(ProviderError::StreamClosed)
}
