use serde::{Deserialize, Serialize};

use super::message::Message;
use super::options::{ImageOptions, RequestOptions};
use super::protocol::Protocol;
use super::tool::Tool;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisionRequest {
    pub messages: Vec<Message>,
    /// Image references, each an http(s) URL or a `data:` URI
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_options: Option<ImageOptions>,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolsRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<Tool>,
    #[serde(default)]
    pub options: RequestOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    pub input: String,
    #[serde(default)]
    pub options: RequestOptions,
}

/// A request typed by the protocol it is dispatched under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolRequest {
    Chat(ChatRequest),
    Vision(VisionRequest),
    Tools(ToolsRequest),
    Embeddings(EmbeddingsRequest),
}

impl ProtocolRequest {
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolRequest::Chat(_) => Protocol::Chat,
            ProtocolRequest::Vision(_) => Protocol::Vision,
            ProtocolRequest::Tools(_) => Protocol::Tools,
            ProtocolRequest::Embeddings(_) => Protocol::Embeddings,
        }
    }

    pub fn options(&self) -> &RequestOptions {
        match self {
            ProtocolRequest::Chat(request) => &request.options,
            ProtocolRequest::Vision(request) => &request.options,
            ProtocolRequest::Tools(request) => &request.options,
            ProtocolRequest::Embeddings(request) => &request.options,
        }
    }

    /// Conversation prefix of the request; empty for embeddings.
    pub fn messages(&self) -> &[Message] {
        match self {
            ProtocolRequest::Chat(request) => &request.messages,
            ProtocolRequest::Vision(request) => &request.messages,
            ProtocolRequest::Tools(request) => &request.messages,
            ProtocolRequest::Embeddings(_) => &[],
        }
    }

    pub fn model(&self) -> Option<&str> {
        self.options().model.as_deref()
    }

    pub fn wants_stream(&self) -> bool {
        self.options().is_streaming()
    }
}

impl From<ChatRequest> for ProtocolRequest {
    fn from(request: ChatRequest) -> Self {
        ProtocolRequest::Chat(request)
    }
}

impl From<VisionRequest> for ProtocolRequest {
    fn from(request: VisionRequest) -> Self {
        ProtocolRequest::Vision(request)
    }
}

impl From<ToolsRequest> for ProtocolRequest {
    fn from(request: ToolsRequest) -> Self {
        ProtocolRequest::Tools(request)
    }
}

impl From<EmbeddingsRequest> for ProtocolRequest {
    fn from(request: EmbeddingsRequest) -> Self {
        ProtocolRequest::Embeddings(request)
    }
}
