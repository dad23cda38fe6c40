use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::dispatcher::Dispatcher;
use crate::errors::{ConduitError, ConduitResult};
use crate::models::message::Message;
use crate::models::options::RequestOptions;
use crate::models::protocol::Protocol;
use crate::models::request::{
    ChatRequest, EmbeddingsRequest, ProtocolRequest, ToolsRequest, VisionRequest,
};
use crate::models::response::{ChatResponse, EmbeddingsResponse, Response, ToolsResponse};
use crate::models::tool::Tool;
use crate::stream::ChunkStream;

/// Agent pairs a model with a dispatcher behind a stable identity
///
/// Every call copies the caller's options before injecting the model name,
/// so option values passed in are never modified.
#[derive(Clone)]
pub struct Agent {
    id: String,
    client: Arc<dyn Dispatcher>,
    model: String,
    system_prompt: Option<String>,
}

impl Agent {
    pub fn new<M: Into<String>>(client: Arc<dyn Dispatcher>, model: M) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            client,
            model: model.into(),
            system_prompt: None,
        }
    }

    /// Blank prompts are ignored
    pub fn with_system_prompt<S: Into<String>>(mut self, system_prompt: S) -> Self {
        self.system_prompt = Some(system_prompt.into()).filter(|prompt| !prompt.trim().is_empty());
        self
    }

    /// Time-ordered identifier assigned at construction
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    pub async fn chat(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        options: &RequestOptions,
    ) -> ConduitResult<ChatResponse> {
        let request = ChatRequest {
            messages: self.messages(prompt),
            options: self.options(options, false),
        };
        let response = self.client.execute(cancel, request.into()).await?;
        self.expect(Protocol::Chat, response, Response::into_chat)
    }

    pub async fn chat_stream(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        options: &RequestOptions,
    ) -> ConduitResult<ChunkStream> {
        let request = ChatRequest {
            messages: self.messages(prompt),
            options: self.options(options, true),
        };
        self.client.execute_stream(cancel, request.into()).await
    }

    /// Ask about the given images. `images` are URLs or `data:` URIs; image
    /// decoration is read from the `image_options` entry of the options.
    pub async fn vision(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        images: &[String],
        options: &RequestOptions,
    ) -> ConduitResult<ChatResponse> {
        let request = self.vision_request(prompt, images, options, false)?;
        let response = self.client.execute(cancel, request).await?;
        self.expect(Protocol::Vision, response, Response::into_chat)
    }

    pub async fn vision_stream(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        images: &[String],
        options: &RequestOptions,
    ) -> ConduitResult<ChunkStream> {
        let request = self.vision_request(prompt, images, options, true)?;
        self.client.execute_stream(cancel, request).await
    }

    /// Offer tools to the model; the response reports any calls it wants made.
    pub async fn tools(
        &self,
        cancel: &CancellationToken,
        prompt: &str,
        tools: &[Tool],
        options: &RequestOptions,
    ) -> ConduitResult<ToolsResponse> {
        let request = ToolsRequest {
            messages: self.messages(prompt),
            tools: tools.to_vec(),
            options: self.options(options, false),
        };
        let response = self.client.execute(cancel, request.into()).await?;
        self.expect(Protocol::Tools, response, Response::into_tools)
    }

    pub async fn embed(
        &self,
        cancel: &CancellationToken,
        input: &str,
        options: &RequestOptions,
    ) -> ConduitResult<EmbeddingsResponse> {
        let request = EmbeddingsRequest {
            input: input.to_string(),
            options: self.options(options, false),
        };
        let response = self.client.execute(cancel, request.into()).await?;
        self.expect(Protocol::Embeddings, response, Response::into_embeddings)
    }

    fn messages(&self, prompt: &str) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system_prompt) = &self.system_prompt {
            messages.push(Message::system().with_text(system_prompt.as_str()));
        }
        messages.push(Message::user().with_text(prompt));
        messages
    }

    fn options(&self, options: &RequestOptions, stream: bool) -> RequestOptions {
        let mut options = options.clone();
        options.model = Some(self.model.clone());
        if stream {
            options.stream = Some(true);
        }
        options
    }

    fn vision_request(
        &self,
        prompt: &str,
        images: &[String],
        options: &RequestOptions,
        stream: bool,
    ) -> ConduitResult<ProtocolRequest> {
        let mut options = self.options(options, stream);
        let image_options = options
            .take_image_options()
            .map_err(|e| ConduitError::dispatch(Protocol::Vision, self.model.as_str(), e))?;
        Ok(VisionRequest {
            messages: self.messages(prompt),
            images: images.to_vec(),
            image_options,
            options,
        }
        .into())
    }

    fn expect<T>(
        &self,
        protocol: Protocol,
        response: Response,
        convert: fn(Response) -> ConduitResult<T>,
    ) -> ConduitResult<T> {
        convert(response).map_err(|e| ConduitError::dispatch(protocol, self.model.as_str(), e))
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .finish_non_exhaustive()
    }
}
