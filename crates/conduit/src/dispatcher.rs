use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::errors::{ConduitError, ConduitResult};
use crate::models::request::ProtocolRequest;
use crate::models::response::Response;
use crate::providers::base::{Capability, Provider};
use crate::registry::ModelRegistry;
use crate::retry::RetryPolicy;
use crate::stream::{spawn_decoder, ChunkStream, DEFAULT_CHUNK_BUFFER};
use crate::transport::{HttpRequest, HttpTransport};

/// Routes typed protocol requests to a provider.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Run a unary request and return the parsed response paired with it.
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<Response>;

    /// Start a streaming request. Returns once the response headers arrive.
    async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<ChunkStream>;
}

pub struct ProtocolDispatcher {
    provider: Arc<Provider>,
    registry: Arc<ModelRegistry>,
    transport: Arc<dyn HttpTransport>,
    stream_buffer: usize,
    timeout: Option<Duration>,
}

impl ProtocolDispatcher {
    pub fn new(provider: Provider, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            provider: Arc::new(provider),
            registry: Arc::new(ModelRegistry::new()),
            transport,
            stream_buffer: DEFAULT_CHUNK_BUFFER,
            timeout: None,
        }
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_stream_buffer(mut self, stream_buffer: usize) -> Self {
        self.stream_buffer = stream_buffer.max(1);
        self
    }

    /// Deadline for unary exchanges; streams are bounded by cancellation only
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Resolve the capability and build the outgoing request. No I/O happens
    /// here, so every validation failure precedes the network.
    fn prepare(
        &self,
        request: &ProtocolRequest,
        streaming: bool,
    ) -> ConduitResult<(Arc<dyn Capability>, HttpRequest)> {
        let protocol = request.protocol();
        let capability = self.provider.capability(protocol)?;
        if streaming && !(protocol.supports_streaming() && capability.supports_streaming()) {
            return Err(ConduitError::UnsupportedStreaming(protocol));
        }

        let model_name = request
            .model()
            .filter(|model| !model.trim().is_empty())
            .ok_or_else(|| ConduitError::ConfigInvalid("request has no model".to_string()))?;
        let model = self.registry.resolve(model_name);

        let mut options = request.options().merged_over(model.defaults_for(protocol));
        if streaming {
            options.stream = Some(true);
        } else if options.is_streaming() {
            return Err(ConduitError::InvalidOption {
                key: "stream".to_string(),
                reason: "streaming requests must go through execute_stream".to_string(),
            });
        }

        let options = options.to_map()?;
        model.schema_for(protocol).validate(&options)?;

        let body = capability.build_body(request, options)?;
        let url = self.provider.url_for(capability.as_ref());
        let timeout = if streaming { None } else { self.timeout };
        let http = HttpRequest::post_json(url, self.provider.headers(), &body)?.with_timeout(timeout);

        Ok((capability, http))
    }

    async fn send_unary(
        &self,
        cancel: &CancellationToken,
        request: &ProtocolRequest,
    ) -> ConduitResult<Response> {
        let (capability, http) = self.prepare(request, false)?;
        tracing::debug!(
            protocol = %request.protocol(),
            model = request.model().unwrap_or_default(),
            url = %http.url,
            "dispatching request"
        );

        let response = self.transport.send(cancel, http).await?;
        let body = response.bytes(cancel).await?;
        capability.parse_response(&body)
    }

    async fn send_streaming(
        &self,
        cancel: &CancellationToken,
        request: &ProtocolRequest,
    ) -> ConduitResult<ChunkStream> {
        let (capability, http) = self.prepare(request, true)?;
        tracing::debug!(
            protocol = %request.protocol(),
            model = request.model().unwrap_or_default(),
            url = %http.url,
            "dispatching streaming request"
        );

        let response = self.transport.send(cancel, http).await?;
        Ok(spawn_decoder(
            response.body,
            capability,
            cancel.clone(),
            self.stream_buffer,
        ))
    }
}

fn wrap(request: &ProtocolRequest, error: ConduitError) -> ConduitError {
    ConduitError::dispatch(
        request.protocol(),
        request.model().unwrap_or_default(),
        error,
    )
}

#[async_trait]
impl Dispatcher for ProtocolDispatcher {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<Response> {
        self.send_unary(cancel, &request)
            .await
            .map_err(|error| wrap(&request, error))
    }

    async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<ChunkStream> {
        self.send_streaming(cancel, &request)
            .await
            .map_err(|error| wrap(&request, error))
    }
}

/// Retries unary requests of the inner dispatcher. Streams are passed
/// through untouched since partial deliveries cannot be replayed.
pub struct RetryingDispatcher {
    inner: Arc<dyn Dispatcher>,
    policy: RetryPolicy,
}

impl RetryingDispatcher {
    pub fn new(inner: Arc<dyn Dispatcher>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Dispatcher for RetryingDispatcher {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<Response> {
        let inner = &self.inner;
        let request = &request;
        self.policy
            .run(cancel, move |token, _| async move {
                inner.execute(&token, request.clone()).await
            })
            .await
    }

    async fn execute_stream(
        &self,
        cancel: &CancellationToken,
        request: ProtocolRequest,
    ) -> ConduitResult<ChunkStream> {
        self.inner.execute_stream(cancel, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockTransport};
    use crate::models::message::Message;
    use crate::models::options::RequestOptions;
    use crate::models::protocol::Protocol;
    use crate::models::request::{ChatRequest, EmbeddingsRequest};
    use crate::providers::openai::openai_compatible;
    use crate::registry::{Model, OptionSchema};
    use serde_json::json;

    fn chat(options: RequestOptions) -> ProtocolRequest {
        ProtocolRequest::Chat(ChatRequest {
            messages: vec![Message::user().with_text("Hi")],
            options,
        })
    }

    fn model(name: &str) -> RequestOptions {
        RequestOptions {
            model: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn hello() -> serde_json::Value {
        json!({"choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello."}, "finish_reason": "stop"}]})
    }

    fn dispatcher(transport: Arc<MockTransport>) -> ProtocolDispatcher {
        ProtocolDispatcher::new(openai_compatible("test", "http://mock/v1"), transport)
    }

    #[tokio::test]
    async fn test_model_defaults_merge_under_caller_options() -> anyhow::Result<()> {
        let transport = Arc::new(MockTransport::new().with_response(MockResponse::json(200, &hello())));
        let registry = ModelRegistry::new().with_model(
            Model::new("m1").with_defaults(
                Protocol::Chat,
                RequestOptions::new().with_temperature(0.2).with_max_tokens(64),
            ),
        );
        let dispatcher = dispatcher(transport.clone()).with_registry(registry);

        let response = dispatcher
            .execute(
                &CancellationToken::new(),
                chat(model("m1").with_temperature(0.9)),
            )
            .await?
            .into_chat()?;
        assert_eq!(response.content(), "Hello.");

        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "http://mock/v1/chat/completions");
        let body = sent[0].json_body()?;
        assert_eq!(body["temperature"], 0.9);
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["model"], "m1");
        Ok(())
    }

    #[tokio::test]
    async fn test_closed_schema_rejects_before_io() {
        let transport = Arc::new(MockTransport::new());
        let registry = ModelRegistry::new()
            .with_model(Model::new("m1").with_schema(Protocol::Chat, OptionSchema::closed()));
        let dispatcher = dispatcher(transport.clone()).with_registry(registry);

        let error = dispatcher
            .execute(
                &CancellationToken::new(),
                chat(model("m1").with_extra("logit_bias", json!({}))),
            )
            .await
            .unwrap_err();

        assert!(matches!(error, ConduitError::Dispatch { .. }));
        assert!(matches!(error.root(), ConduitError::InvalidOption { key, .. } if key == "logit_bias"));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_streaming_embeddings_is_rejected_before_io() {
        let transport = Arc::new(MockTransport::new());
        let request = ProtocolRequest::Embeddings(EmbeddingsRequest {
            input: "hello".into(),
            options: model("e1"),
        });

        let error = dispatcher(transport.clone())
            .execute_stream(&CancellationToken::new(), request)
            .await
            .unwrap_err();

        assert!(matches!(
            error.root(),
            ConduitError::UnsupportedStreaming(Protocol::Embeddings)
        ));
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_execute_rejects_stream_option() {
        let transport = Arc::new(MockTransport::new());
        let mut options = model("m1");
        options.stream = Some(true);

        let error = dispatcher(transport)
            .execute(&CancellationToken::new(), chat(options))
            .await
            .unwrap_err();
        assert!(matches!(error.root(), ConduitError::InvalidOption { key, .. } if key == "stream"));
    }

    #[tokio::test]
    async fn test_missing_model() {
        let error = dispatcher(Arc::new(MockTransport::new()))
            .execute(&CancellationToken::new(), chat(RequestOptions::default()))
            .await
            .unwrap_err();
        assert!(matches!(error.root(), ConduitError::ConfigInvalid(_)));
    }

    #[tokio::test]
    async fn test_provider_error_is_wrapped() {
        let transport = Arc::new(MockTransport::new().with_response(MockResponse::json(
            401,
            &json!({"error": {"message": "Invalid API key"}}),
        )));
        let error = dispatcher(transport)
            .execute(&CancellationToken::new(), chat(model("m1")))
            .await
            .unwrap_err();

        match &error {
            ConduitError::Dispatch { protocol, model, .. } => {
                assert_eq!(*protocol, Protocol::Chat);
                assert_eq!(model, "m1");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(error.status(), Some(401));
        assert!(error.to_string().contains("Invalid API key"));
    }

    #[tokio::test]
    async fn test_retrying_dispatcher_recovers() -> anyhow::Result<()> {
        let transport = Arc::new(
            MockTransport::new()
                .with_response(MockResponse::json(503, &json!({"error": "overloaded"})))
                .with_response(MockResponse::json(200, &hello())),
        );
        let retrying = RetryingDispatcher::new(
            Arc::new(dispatcher(transport.clone())),
            RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(2)),
        );

        let response = retrying
            .execute(&CancellationToken::new(), chat(model("m1")))
            .await?
            .into_chat()?;
        assert_eq!(response.content(), "Hello.");
        assert_eq!(transport.requests().len(), 2);
        Ok(())
    }
}
