//! DeepSeek Chat Completions adapter.
//!
//! `deepseek-reasoner` streams its chain-of-thought as `reasoning_content`.
//! That text is surfaced to the observer and kept on the result, but it is
//! never sent back: DeepSeek rejects requests that replay it.

use crate::openai_compat::ChatCompletionsClient;
use crate::{
    ApiKey, CompletionRequest, CompletionResult, Provider, ProviderAdapter, ProviderError,
    StreamObserver, http,
};

/// Canonical DeepSeek API base URL.
pub const DEEPSEEK_API_BASE_URL: &str = "https://api.deepseek.com";

#[derive(Debug)]
pub struct DeepSeekAdapter {
    inner: ChatCompletionsClient,
}

impl DeepSeekAdapter {
    pub fn new(api_key: ApiKey, model: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_base_url(
            api_key,
            model,
            DEEPSEEK_API_BASE_URL,
            &http::HttpSettings::default(),
        )
    }

    pub fn with_base_url(
        api_key: ApiKey,
        model: impl Into<String>,
        base_url: &str,
        settings: &http::HttpSettings,
    ) -> Result<Self, ProviderError> {
        if api_key.as_str().trim().is_empty() {
            return Err(ProviderError::Request(
                "DeepSeek requires an API key".to_string(),
            ));
        }
        let inner =
            ChatCompletionsClient::new(Provider::DeepSeek, base_url, Some(api_key), model, settings)?;
        Ok(Self { inner })
    }

    async fn run(
        &self,
        request: &CompletionRequest<'_>,
        observer: &dyn StreamObserver,
    ) -> Result<CompletionResult, ProviderError> {
        self.inner.stream(request, observer).await
    }
}

impl ProviderAdapter for DeepSeekAdapter {
    fn provider(&self) -> Provider {
        Provider::DeepSeek
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
    use super::DeepSeekAdapter;
    use crate::http::HttpSettings;
    use crate::retry::{RetryPolicy, stream_with_retry};
    use crate::{CompletionRequest, ProviderAdapter, ProviderError, StreamObserver, StreamOptions};
    use helm_types::{
        ApiKey, Conversation, GenerationParams, Message, Provider, Segment, StopReason, ToolCall,
        ToolDefinition,
    };
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct Recorder {
        text: Mutex<String>,
        reasoning: Mutex<String>,
        tools: Mutex<Vec<ToolCall>>,
    }

    impl StreamObserver for Recorder {
        fn on_text_delta(&self, delta: &str) {
            self.text.lock().unwrap().push_str(delta);
        }

        fn on_reasoning_delta(&self, delta: &str) {
            self.reasoning.lock().unwrap().push_str(delta);
        }

        fn on_tool_use(&self, call: &ToolCall) {
            self.tools.lock().unwrap().push(call.clone());
        }
    }

    fn sse(events: &[serde_json::Value]) -> String {
        let mut body: String = events.iter().map(|e| format!("data: {e}\n\n")).collect();
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn stream_response(body: String) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("content-type", "text/event-stream")
            .set_body_string(body)
    }

    fn adapter(server: &MockServer) -> DeepSeekAdapter {
        DeepSeekAdapter::with_base_url(
            ApiKey::new(Provider::DeepSeek, "sk-test"),
            "deepseek-chat",
            &server.uri(),
            &HttpSettings::local(),
        )
        .unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_initial_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(10))
    }

    #[tokio::test]
    async fn streams_reasoning_and_interleaved_tool_calls() {
        let server = MockServer::start().await;
        let body = sse(&[
            json!({"choices": [{"index": 0, "delta": {"role": "assistant", "reasoning_content": "Need two tools."}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "id": "call_a", "type": "function", "function": {"name": "read", "arguments": "{\"a\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 1, "id": "call_b", "type": "function", "function": {"name": "grep", "arguments": "{\"b\":"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 0, "function": {"arguments": "1}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {"tool_calls": [
                {"index": 1, "function": {"arguments": "2}"}}
            ]}}]}),
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "tool_calls"}]}),
            json!({"choices": [], "usage": {"prompt_tokens": 30, "completion_tokens": 12}}),
        ]);
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({
                "model": "deepseek-chat",
                "stream": true,
                "stream_options": {"include_usage": true}
            })))
            .respond_with(stream_response(body))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let conversation = Conversation::from(vec![Message::user("inspect")]);
        let tools = vec![
            ToolDefinition::new("read", "Read a file", json!({"type": "object"})),
            ToolDefinition::new("grep", "Search", json!({"type": "object"})),
        ];
        let params = GenerationParams::new("");
        let request =
            CompletionRequest::new(&conversation, &tools, &params, StreamOptions::default());
        let recorder = Recorder::default();

        let result = adapter.stream_completion(&request, &recorder).await.unwrap();

        assert_eq!(result.stop_reason, StopReason::ToolUse);
        assert_eq!(result.reasoning.as_deref(), Some("Need two tools."));
        assert_eq!(
            result.segments,
            vec![
                Segment::tool_call("call_a", "read", json!({"a": 1})),
                Segment::tool_call("call_b", "grep", json!({"b": 2})),
            ]
        );
        assert_eq!(result.usage.unwrap().total(), 42);
        assert_eq!(*recorder.reasoning.lock().unwrap(), "Need two tools.");
        assert_eq!(recorder.tools.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn eof_after_finish_reason_completes() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(stream_response(body.to_string()))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let conversation = Conversation::from(vec![Message::user("hi")]);
        let params = GenerationParams::new("");
        let request = CompletionRequest::new(&conversation, &[], &params, StreamOptions::default());
        let recorder = Recorder::default();
        let result = adapter.stream_completion(&request, &recorder).await.unwrap();
        assert_eq!(result.text(), "Hi");
        assert_eq!(*recorder.text.lock().unwrap(), "Hi");
    }

    #[tokio::test]
    async fn rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after-ms", "500")
                    .set_body_string(r#"{"error":{"message":"Rate limit reached","type":"rate_limit_error"}}"#),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(stream_response(sse(&[
                json!({"choices": [{"index": 0, "delta": {"content": "ok"}, "finish_reason": "stop"}]}),
            ])))
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let conversation = Conversation::from(vec![Message::user("hi")]);
        let params = GenerationParams::new("");
        let request = CompletionRequest::new(&conversation, &[], &params, StreamOptions::default());
        let mut delays = Vec::new();
        let mut on_retry = |_: u32, err: &ProviderError, delay: Duration| {
            assert!(matches!(err, ProviderError::RateLimited { .. }));
            delays.push(delay);
        };
        let result = stream_with_retry(
            &adapter,
            &request,
            &Recorder::default(),
            &fast_policy(),
            Some(&mut on_retry),
        )
        .await
        .unwrap();
        assert_eq!(result.text(), "ok");
        // The 500ms hint is clamped to the policy ceiling.
        assert_eq!(delays, vec![Duration::from_millis(10)]);
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":{"message":"Invalid model","type":"invalid_request_error"}}"#,
            ))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(&server);
        let conversation = Conversation::from(vec![Message::user("hi")]);
        let params = GenerationParams::new("nope");
        let request = CompletionRequest::new(&conversation, &[], &params, StreamOptions::default());
        let err = stream_with_retry(
            &adapter,
            &request,
            &Recorder::default(),
            &fast_policy(),
            None,
        )
        .await
        .unwrap_err();
        match err {
            ProviderError::Validation { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "Invalid model");
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn empty_key_is_rejected() {
        let result = DeepSeekAdapter::new(ApiKey::new(Provider::DeepSeek, "  "), "deepseek-chat");
        assert!(matches!(result, Err(ProviderError::Request(_))));
    }
}
