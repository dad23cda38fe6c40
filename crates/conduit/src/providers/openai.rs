use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

use super::base::{Capability, Provider};
use super::configs::OpenAiProviderConfig;
use super::utils::{attach_images, body_with_options, messages_to_openai_spec, tools_to_openai_spec};
use crate::errors::{ConduitError, ConduitResult};
use crate::models::chunk::StreamChunk;
use crate::models::protocol::Protocol;
use crate::models::request::ProtocolRequest;
use crate::models::response::{ChatResponse, EmbeddingsResponse, Response, ToolsResponse};

pub const OPENAI_HOST: &str = "https://api.openai.com/v1";
pub const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
pub const EMBEDDINGS_PATH: &str = "embeddings";

/// Build a provider speaking the OpenAI wire format for all four protocols
pub fn provider(config: &OpenAiProviderConfig) -> Provider {
    let mut provider = openai_compatible("openai", &config.host)
        .with_credential(Some(config.api_key.clone()));
    if let Some(organization) = &config.organization {
        provider = provider.with_header("OpenAI-Organization", organization.as_str());
    }
    provider
}

/// A provider with the OpenAI-compatible capabilities and no credential
pub fn openai_compatible(name: &str, base_url: &str) -> Provider {
    Provider::new(name, base_url)
        .with_capability(Arc::new(ChatCapability))
        .with_capability(Arc::new(VisionCapability))
        .with_capability(Arc::new(ToolsCapability))
        .with_capability(Arc::new(EmbeddingsCapability))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatCapability;

#[derive(Debug, Clone, Copy, Default)]
pub struct VisionCapability;

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolsCapability;

#[derive(Debug, Clone, Copy, Default)]
pub struct EmbeddingsCapability;

impl Capability for ChatCapability {
    fn protocol(&self) -> Protocol {
        Protocol::Chat
    }

    fn path(&self) -> &str {
        CHAT_COMPLETIONS_PATH
    }

    fn build_body(
        &self,
        request: &ProtocolRequest,
        options: Map<String, Value>,
    ) -> ConduitResult<Value> {
        let ProtocolRequest::Chat(request) = request else {
            return Err(mismatched(self.protocol(), request));
        };
        let messages = messages_to_openai_spec(&request.messages)?;
        Ok(body_with_options(options, vec![("messages", json!(messages))]))
    }

    fn parse_response(&self, body: &[u8]) -> ConduitResult<Response> {
        decode_body::<ChatResponse>(body).map(Response::Chat)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn parse_chunk(&self, payload: &str) -> ConduitResult<StreamChunk> {
        decode_chunk(payload)
    }
}

impl Capability for VisionCapability {
    fn protocol(&self) -> Protocol {
        Protocol::Vision
    }

    fn path(&self) -> &str {
        CHAT_COMPLETIONS_PATH
    }

    fn build_body(
        &self,
        request: &ProtocolRequest,
        options: Map<String, Value>,
    ) -> ConduitResult<Value> {
        let ProtocolRequest::Vision(request) = request else {
            return Err(mismatched(self.protocol(), request));
        };
        let shaped = attach_images(
            &request.messages,
            &request.images,
            request.image_options.as_ref(),
        )?;
        let messages = messages_to_openai_spec(&shaped)?;
        Ok(body_with_options(options, vec![("messages", json!(messages))]))
    }

    fn parse_response(&self, body: &[u8]) -> ConduitResult<Response> {
        decode_body::<ChatResponse>(body).map(Response::Chat)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn parse_chunk(&self, payload: &str) -> ConduitResult<StreamChunk> {
        decode_chunk(payload)
    }
}

impl Capability for ToolsCapability {
    fn protocol(&self) -> Protocol {
        Protocol::Tools
    }

    fn path(&self) -> &str {
        CHAT_COMPLETIONS_PATH
    }

    fn build_body(
        &self,
        request: &ProtocolRequest,
        options: Map<String, Value>,
    ) -> ConduitResult<Value> {
        let ProtocolRequest::Tools(request) = request else {
            return Err(mismatched(self.protocol(), request));
        };
        let messages = messages_to_openai_spec(&request.messages)?;
        let mut fields = vec![("messages", json!(messages))];
        if !request.tools.is_empty() {
            fields.push(("tools", json!(tools_to_openai_spec(&request.tools)?)));
        }
        Ok(body_with_options(options, fields))
    }

    fn parse_response(&self, body: &[u8]) -> ConduitResult<Response> {
        decode_body::<ToolsResponse>(body).map(Response::Tools)
    }

    fn supports_streaming(&self) -> bool {
        true
    }

    fn parse_chunk(&self, payload: &str) -> ConduitResult<StreamChunk> {
        decode_chunk(payload)
    }
}

impl Capability for EmbeddingsCapability {
    fn protocol(&self) -> Protocol {
        Protocol::Embeddings
    }

    fn path(&self) -> &str {
        EMBEDDINGS_PATH
    }

    fn build_body(
        &self,
        request: &ProtocolRequest,
        options: Map<String, Value>,
    ) -> ConduitResult<Value> {
        let ProtocolRequest::Embeddings(request) = request else {
            return Err(mismatched(self.protocol(), request));
        };
        Ok(body_with_options(options, vec![("input", json!(request.input))]))
    }

    fn parse_response(&self, body: &[u8]) -> ConduitResult<Response> {
        decode_body::<EmbeddingsResponse>(body).map(Response::Embeddings)
    }
}

fn mismatched(expected: Protocol, request: &ProtocolRequest) -> ConduitError {
    ConduitError::EncodeFailed(format!(
        "{} capability cannot encode a {} request",
        expected,
        request.protocol()
    ))
}

/// Decode a 2xx body, surfacing error envelopes some servers send with 200.
fn decode_body<T: DeserializeOwned>(body: &[u8]) -> ConduitResult<T> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| ConduitError::DecodeFailed(format!("response is not JSON: {e}")))?;
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ConduitError::DecodeFailed(format!(
            "provider reported an error: {message}"
        )));
    }
    serde_json::from_value(value).map_err(|e| ConduitError::DecodeFailed(e.to_string()))
}

fn decode_chunk(payload: &str) -> ConduitResult<StreamChunk> {
    serde_json::from_str(payload).map_err(|e| {
        ConduitError::StreamParseFailed(format!("failed to parse streaming payload: {e}"))
    })
}
