use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use conduit::models::options::RequestOptions;
use conduit::models::tool::Tool;
use conduit::providers::configs::OpenAiProviderConfig;
use conduit::providers::openai;
use conduit::providers::sse::{done_frame, encode_frame};
use conduit::retry::RetryPolicy;
use conduit::transport::{ReqwestTransport, TransportSettings};
use conduit::{Agent, CancellationToken, ConduitError, ProtocolDispatcher, RetryingDispatcher};
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Drives an agent against a local OpenAI-compatible server
struct ProviderTester {
    server: MockServer,
}

impl ProviderTester {
    async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    fn dispatcher(&self) -> Result<ProtocolDispatcher> {
        let config = OpenAiProviderConfig::new(format!("{}/v1", self.server.uri()), "sk-test");
        let transport = ReqwestTransport::new(&TransportSettings::default())?;
        Ok(ProtocolDispatcher::new(openai::provider(&config), Arc::new(transport))
            .with_timeout(Some(Duration::from_secs(5))))
    }

    fn agent(&self, model: &str) -> Result<Agent> {
        Ok(Agent::new(Arc::new(self.dispatcher()?), model))
    }

    async fn expect_json(&self, route: &str, request: Value, response: Value) {
        Mock::given(method("POST"))
            .and(path(route))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(request))
            .respond_with(ResponseTemplate::new(200).set_body_json(response))
            .expect(1)
            .mount(&self.server)
            .await;
    }
}

fn sse_body(payloads: &[Value]) -> String {
    let mut body: String = payloads
        .iter()
        .map(|payload| encode_frame(&payload.to_string()))
        .collect();
    body.push_str(&done_frame());
    body
}

#[tokio::test]
async fn test_chat_happy_path() -> Result<()> {
    let tester = ProviderTester::start().await;
    tester
        .expect_json(
            "/v1/chat/completions",
            json!({
                "model": "m1",
                "messages": [
                    {"role": "system", "content": "You are concise."},
                    {"role": "user", "content": "Hi"}
                ]
            }),
            json!({
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello."},
                    "finish_reason": "stop"
                }]
            }),
        )
        .await;

    let agent = tester.agent("m1")?.with_system_prompt("You are concise.");
    let response = agent
        .chat(&CancellationToken::new(), "Hi", &RequestOptions::default())
        .await?;

    assert_eq!(response.content(), "Hello.");
    assert_eq!(response.finish_reason(), Some("stop"));
    Ok(())
}

#[tokio::test]
async fn test_vision_with_two_images() -> Result<()> {
    let tester = ProviderTester::start().await;
    tester
        .expect_json(
            "/v1/chat/completions",
            json!({
                "model": "m1",
                "messages": [{
                    "role": "user",
                    "content": [
                        {"type": "text", "text": "Describe"},
                        {"type": "image_url", "image_url": {"url": "https://a/x.png"}},
                        {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAA"}}
                    ]
                }]
            }),
            json!({
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Two images."},
                    "finish_reason": "stop"
                }]
            }),
        )
        .await;

    let images = vec![
        "https://a/x.png".to_string(),
        "data:image/png;base64,AAA".to_string(),
    ];
    let response = tester
        .agent("m1")?
        .vision(
            &CancellationToken::new(),
            "Describe",
            &images,
            &RequestOptions::default(),
        )
        .await?;

    assert_eq!(response.content(), "Two images.");
    Ok(())
}

#[tokio::test]
async fn test_tools_response_shape() -> Result<()> {
    let tester = ProviderTester::start().await;
    let parameters = json!({
        "type": "object",
        "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
        "required": ["a", "b"]
    });
    tester
        .expect_json(
            "/v1/chat/completions",
            json!({
                "model": "m1",
                "tools": [{
                    "type": "function",
                    "function": {"name": "add", "description": "sum", "parameters": parameters}
                }]
            }),
            json!({
                "choices": [{
                    "index": 0,
                    "message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "add", "arguments": "{\"a\":2,\"b\":3}"}
                        }]
                    },
                    "finish_reason": "tool_calls"
                }]
            }),
        )
        .await;

    let tools = vec![Tool::new("add", "sum", parameters)];
    let response = tester
        .agent("m1")?
        .tools(&CancellationToken::new(), "2+3", &tools, &RequestOptions::default())
        .await?;

    let calls = response.tool_calls(0);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].name(), "add");
    assert_eq!(calls[0].parsed_arguments()?, json!({"a": 2, "b": 3}));
    Ok(())
}

#[tokio::test]
async fn test_embeddings() -> Result<()> {
    let tester = ProviderTester::start().await;
    tester
        .expect_json(
            "/v1/embeddings",
            json!({"model": "e1", "input": "hello"}),
            json!({
                "data": [{"index": 0, "embedding": [0.1, 0.2]}],
                "usage": {"prompt_tokens": 1, "total_tokens": 1}
            }),
        )
        .await;

    let response = tester
        .agent("e1")?
        .embed(&CancellationToken::new(), "hello", &RequestOptions::default())
        .await?;

    assert_eq!(response.first_vector(), Some(&[0.1, 0.2][..]));
    assert_eq!(response.usage.total(), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_chat_stream_over_http() -> Result<()> {
    let tester = ProviderTester::start().await;
    let body = sse_body(&[
        json!({"model": "m1", "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]}),
        json!({"model": "m1", "choices": [{"index": 0, "delta": {"content": "lo."}, "finish_reason": "stop"}]}),
    ]);
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"model": "m1", "stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .expect(1)
        .mount(&tester.server)
        .await;

    let mut stream = tester
        .agent("m1")?
        .chat_stream(&CancellationToken::new(), "Hi", &RequestOptions::default())
        .await?;

    let mut content = String::new();
    while let Some(chunk) = stream.recv().await {
        content.push_str(&chunk?.content());
    }
    assert_eq!(content, "Hello.");
    Ok(())
}

#[tokio::test]
async fn test_error_status_is_retried_then_exhausted() -> Result<()> {
    let tester = ProviderTester::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(503).set_body_json(json!({"error": {"message": "overloaded"}})),
        )
        .expect(3)
        .mount(&tester.server)
        .await;

    let policy = RetryPolicy::new(3, Duration::from_millis(1), 2.0, Duration::from_millis(4));
    let dispatcher = RetryingDispatcher::new(Arc::new(tester.dispatcher()?), policy);
    let agent = Agent::new(Arc::new(dispatcher), "m1");

    let error = agent
        .chat(&CancellationToken::new(), "Hi", &RequestOptions::default())
        .await
        .unwrap_err();

    match &error {
        ConduitError::RetryExhausted { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert_eq!(last.status(), Some(503));
        }
        other => panic!("unexpected error {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn test_client_error_is_not_retried() -> Result<()> {
    let tester = ProviderTester::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&tester.server)
        .await;

    let dispatcher = RetryingDispatcher::new(Arc::new(tester.dispatcher()?), RetryPolicy::default());
    let error = Agent::new(Arc::new(dispatcher), "m1")
        .chat(&CancellationToken::new(), "Hi", &RequestOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(error, ConduitError::Dispatch { .. }));
    assert_eq!(error.status(), Some(401));
    Ok(())
}

#[tokio::test]
async fn test_streaming_embeddings_never_reaches_the_server() -> Result<()> {
    use conduit::models::request::EmbeddingsRequest;
    use conduit::{Dispatcher, Protocol};

    let tester = ProviderTester::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&tester.server)
        .await;

    let request = EmbeddingsRequest {
        input: "hello".to_string(),
        options: RequestOptions::new().with_model("e1"),
    };
    let error = tester
        .dispatcher()?
        .execute_stream(&CancellationToken::new(), request.into())
        .await
        .unwrap_err();

    assert!(matches!(
        error.root(),
        ConduitError::UnsupportedStreaming(Protocol::Embeddings)
    ));
    Ok(())
}
