use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::tool::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Detail level hint for image parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Auto,
    Low,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    /// An http(s) URL or a `data:` URI
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
    /// Provider-specific fields carried next to `url`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageUrl {
    pub fn new<S: Into<String>>(url: S) -> Self {
        ImageUrl {
            url: url.into(),
            detail: None,
            extra: Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text<S: Into<String>>(text: S) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image_url<S: Into<String>>(url: S) -> Self {
        ContentPart::ImageUrl {
            image_url: ImageUrl::new(url),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentPart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// Either a plain string or an ordered list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(text) => text.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// Convert into the list form, keeping any existing text as the first part.
    pub fn into_parts(self) -> Vec<ContentPart> {
        match self {
            MessageContent::Text(text) if text.is_empty() => Vec::new(),
            MessageContent::Text(text) => vec![ContentPart::text(text)],
            MessageContent::Parts(parts) => parts,
        }
    }

    /// All text in the content, with parts joined by newlines
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(ContentPart::as_text)
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A message to or from an LLM
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: MessageContent,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    fn with_role(role: Role) -> Self {
        Message {
            role,
            content: MessageContent::default(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn system() -> Self {
        Self::with_role(Role::System)
    }

    pub fn user() -> Self {
        Self::with_role(Role::User)
    }

    pub fn assistant() -> Self {
        Self::with_role(Role::Assistant)
    }

    /// A tool result answering the call with the given id
    pub fn tool<S: Into<String>>(tool_call_id: S) -> Self {
        Message {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role(Role::Tool)
        }
    }

    /// Add text to the message.
    ///
    /// The first text stays a plain string; anything added after it switches
    /// the content to the list form.
    pub fn with_text<S: Into<String>>(self, text: S) -> Self {
        let blank = matches!(&self.content, MessageContent::Text(existing) if existing.is_empty());
        if blank {
            Message {
                content: MessageContent::Text(text.into()),
                ..self
            }
        } else {
            self.with_part(ContentPart::text(text))
        }
    }

    /// Add an image reference (URL or data URI) to the message
    pub fn with_image_url<S: Into<String>>(self, url: S) -> Self {
        self.with_part(ContentPart::image_url(url))
    }

    pub fn with_part(mut self, part: ContentPart) -> Self {
        let mut parts = std::mem::take(&mut self.content).into_parts();
        parts.push(part);
        self.content = MessageContent::Parts(parts);
        self
    }

    pub fn with_tool_call(mut self, tool_call: ToolCall) -> Self {
        self.tool_calls.push(tool_call);
        self
    }

    pub fn text(&self) -> String {
        self.content.text()
    }
}
