use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize};

use super::message::Role;
use super::tool::ToolCall;
use crate::errors::{ConduitError, ConduitResult};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn new(
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
        total_tokens: Option<u64>,
    ) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        }
    }

    /// Total tokens, derived from the parts when the provider omitted it
    pub fn total(&self) -> Option<u64> {
        self.total_tokens
            .or_else(|| match (self.prompt_tokens, self.completion_tokens) {
                (Some(prompt), Some(completion)) => Some(prompt + completion),
                _ => None,
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: Role,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    #[serde(default)]
    pub index: u32,
    pub message: ResponseMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Text of the first choice, or an empty string when there is none
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .unwrap_or_default()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|choice| choice.finish_reason.as_deref())
    }
}

/// Same wire shape as a chat response; callers read the tool calls.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ToolsResponse {
    /// Tool calls requested under the choice with the given index
    pub fn tool_calls(&self, choice: u32) -> &[ToolCall] {
        self.choices
            .iter()
            .find(|c| c.index == choice)
            .map(|c| c.message.tool_calls.as_slice())
            .unwrap_or_default()
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .and_then(|choice| choice.message.content.as_deref())
            .unwrap_or_default()
    }

    pub fn has_tool_calls(&self) -> bool {
        self.choices
            .iter()
            .any(|choice| !choice.message.tool_calls.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    #[serde(default)]
    pub index: u32,
    /// Accepts a float array or, with `encoding_format: "base64"`, packed
    /// little-endian f32 values
    #[serde(deserialize_with = "float_or_base64")]
    pub embedding: Vec<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub data: Vec<Embedding>,
    #[serde(default)]
    pub usage: Usage,
}

impl EmbeddingsResponse {
    pub fn first_vector(&self) -> Option<&[f64]> {
        self.data.first().map(|entry| entry.embedding.as_slice())
    }
}

/// A fully parsed response; the variant follows the request's protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Chat(ChatResponse),
    Tools(ToolsResponse),
    Embeddings(EmbeddingsResponse),
}

impl Response {
    pub fn kind(&self) -> &'static str {
        match self {
            Response::Chat(_) => "chat",
            Response::Tools(_) => "tools",
            Response::Embeddings(_) => "embeddings",
        }
    }

    pub fn into_chat(self) -> ConduitResult<ChatResponse> {
        match self {
            Response::Chat(response) => Ok(response),
            other => Err(unexpected("chat", &other)),
        }
    }

    pub fn into_tools(self) -> ConduitResult<ToolsResponse> {
        match self {
            Response::Tools(response) => Ok(response),
            other => Err(unexpected("tools", &other)),
        }
    }

    pub fn into_embeddings(self) -> ConduitResult<EmbeddingsResponse> {
        match self {
            Response::Embeddings(response) => Ok(response),
            other => Err(unexpected("embeddings", &other)),
        }
    }
}

/// Treat an explicit `null` like a missing list
pub(crate) fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<Vec<T>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum EncodedVector {
    Floats(Vec<f64>),
    Base64(String),
}

fn float_or_base64<'de, D>(deserializer: D) -> Result<Vec<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    match EncodedVector::deserialize(deserializer)? {
        EncodedVector::Floats(values) => Ok(values),
        EncodedVector::Base64(encoded) => {
            let bytes = STANDARD
                .decode(encoded.as_bytes())
                .map_err(|e| serde::de::Error::custom(format!("invalid base64 embedding: {e}")))?;
            if bytes.len() % 4 != 0 {
                return Err(serde::de::Error::custom(format!(
                    "base64 embedding has {} bytes, not a multiple of 4",
                    bytes.len()
                )));
            }
            Ok(bytes
                .chunks_exact(4)
                .map(|raw| f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as f64)
                .collect())
        }
    }
}

fn unexpected(expected: &'static str, actual: &Response) -> ConduitError {
    ConduitError::UnexpectedResponseType {
        expected,
        actual: actual.kind(),
    }
}
