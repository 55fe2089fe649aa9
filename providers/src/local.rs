//! Adapter for locally hosted OpenAI-compatible servers (Ollama, llama.cpp,
//! vLLM, LM Studio).
//!
//! Plain HTTP is allowed and the API key is optional. When a key is present
//! it is sent as a bearer token.

use crate::openai_compat::ChatCompletionsClient;
use crate::{
    ApiKey, CompletionRequest, CompletionResult, Provider, ProviderAdapter, ProviderError,
    StreamObserver, http,
};

/// Ollama's OpenAI-compatible endpoint.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:11434/v1";

#[derive(Debug)]
pub struct LocalAdapter {
    inner: ChatCompletionsClient,
}

impl LocalAdapter {
    pub fn new(
        base_url: Option<&str>,
        api_key: Option<ApiKey>,
        model: impl Into<String>,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .unwrap_or(LOCAL_API_BASE_URL);
        let api_key = api_key.filter(|key| !key.as_str().trim().is_empty());
        let inner = ChatCompletionsClient::new(
            Provider::Local,
            base_url,
            api_key,
            model,
            &http::HttpSettings::local(),
        )?;
        Ok(Self { inner })
    }

    /// Servers that reject `stream_options` can turn usage reporting off.
    #[must_use]
    pub fn with_include_usage(self, include_usage: bool) -> Self {
        Self {
            inner: self.inner.with_include_usage(include_usage),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    async fn run(
        &self,
        request: &CompletionRequest<'_>,
        observer: &dyn StreamObserver,
    ) -> Result<CompletionResult, ProviderError> {
        self.inner.stream(request, observer).await
    }
}

impl ProviderAdapter for LocalAdapter {
    fn provider(&self) -> Provider {
        Provider::Local
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn stream_completion<'a>(
        &'a self,
        request: &'a CompletionRequest<'a>,
        observer: &'a dyn StreamObserver,
    ) -> impl Future<Output = Result<CompletionResult, ProviderError>> + Send + 'a {
        self.run(request, observer)
    }
}


#[cfg(test)]
mod integration_tests {
    use super::LocalAdapter;
    use crate::{CompletionRequest, NoopObserver, ProviderAdapter, ProviderError, StreamOptions};
    use helm_types::{ApiKey, Conversation, GenerationParams, Message, Provider, StopReason};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const STREAM: &str = concat!(
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n\n",
        "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    fn ok_stream() -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(STREAM)
    }

    async fn run(adapter: &LocalAdapter, options: StreamOptions) -> Result<String, ProviderError> {
        let conversation = Conversation::from(vec![Message::user("hi")]);
        let params = GenerationParams::new("");
        let request = CompletionRequest::new(&conversation, &[], &params, options);
        let result = adapter.stream_completion(&request, &NoopObserver).await?;
        assert_eq!(result.stop_reason, StopReason::EndTurn);
        Ok(result.text())
    }

    #[tokio::test]
    async fn streams_over_plain_http_without_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ok_stream())
            .expect(1)
            .mount(&server)
            .await;

        let base = format!("{}/v1", server.uri());
        let adapter = LocalAdapter::new(Some(&base), None, "qwen2.5-coder").unwrap();
        assert_eq!(run(&adapter, StreamOptions::default()).await.unwrap(), "Hello");

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn sends_bearer_token_when_configured() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer local-secret"))
            .respond_with(ok_stream())
            .expect(1)
            .mount(&server)
            .await;

        let base = format!("{}/v1", server.uri());
        let key = ApiKey::new(Provider::Local, "local-secret");
        let adapter = LocalAdapter::new(Some(&base), Some(key), "m").unwrap();
        assert_eq!(run(&adapter, StreamOptions::default()).await.unwrap(), "Hello");
    }

    #[tokio::test]
    async fn abort_while_waiting_for_headers_cancels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ok_stream().set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let base = format!("{}/v1", server.uri());
        let adapter = LocalAdapter::new(Some(&base), None, "m").unwrap();
        let abort = CancellationToken::new();
        let canceller = abort.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = run(&adapter, StreamOptions::new(abort, Duration::from_secs(30)))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn silent_server_before_headers_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ok_stream().set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let base = format!("{}/v1", server.uri());
        let adapter = LocalAdapter::new(Some(&base), None, "m").unwrap();
        let window = Duration::from_millis(200);
        let started = std::time::Instant::now();
        let err = run(&adapter, StreamOptions::new(CancellationToken::new(), window))
            .await
            .unwrap_err();

        assert!(
            matches!(err, ProviderError::Timeout { window: w } if w == window),
            "{err:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test]
    async fn error_status_is_classified_within_the_window() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(503)
                    .insert_header("retry-after", "2")
                    .set_body_string("model loading"),
            )
            .mount(&server)
            .await;

        let base = format!("{}/v1", server.uri());
        let adapter = LocalAdapter::new(Some(&base), None, "m").unwrap();
        let err = run(
            &adapter,
            StreamOptions::new(CancellationToken::new(), Duration::from_secs(5)),
        )
        .await
        .unwrap_err();

        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }

    /// Read one HTTP request off `socket`, body included.
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        use tokio::io::AsyncReadExt;

        let mut received = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            received.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&received);
            if let Some(end) = text.find("\r\n\r\n") {
                let length = text[..end]
                    .lines()
                    .find_map(|line| {
                        let line = line.to_ascii_lowercase();
                        line.strip_prefix("content-length:")
                            .map(|value| value.trim().parse::<usize>().unwrap_or(0))
                    })
                    .unwrap_or(0);
                if received.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    #[tokio::test]
    async fn body_cut_off_mid_stream_is_stream_closed() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            read_request(&mut socket).await;
            let frame = "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hel\"}}]}\n\n";
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ncontent-length: {}\r\n\r\n{frame}",
                frame.len() + 512
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });

        let base = format!("http://{addr}/v1");
        let adapter = LocalAdapter::new(Some(&base), None, "m").unwrap();
        let err = run(
            &adapter,
            StreamOptions::new(CancellationToken::new(), Duration::from_secs(5)),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProviderError::StreamClosed), "{err:?}");
        assert!(err.is_transient());
    }
}
