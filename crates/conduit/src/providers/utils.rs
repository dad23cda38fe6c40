use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::errors::{ConduitError, ConduitResult};
use crate::models::message::{ContentPart, ImageUrl, Message, MessageContent, Role};
use crate::models::options::ImageOptions;
use crate::models::tool::Tool;

lazy_static! {
    static ref FUNCTION_NAME: Regex = Regex::new(r"^[a-zA-Z0-9_-]+$").unwrap();
}

pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Convert messages to OpenAI's API message specification
pub fn messages_to_openai_spec(messages: &[Message]) -> ConduitResult<Vec<Value>> {
    messages
        .iter()
        .map(|message| {
            serde_json::to_value(message).map_err(|e| ConduitError::EncodeFailed(e.to_string()))
        })
        .collect()
}

/// Attach images to the final user message of a vision request.
///
/// The user message's content becomes a text part followed by one
/// `image_url` part per image, in order. `image_options` decorate every
/// image part.
pub fn attach_images(
    messages: &[Message],
    images: &[String],
    image_options: Option<&ImageOptions>,
) -> ConduitResult<Vec<Message>> {
    let mut messages = messages.to_vec();
    let target = messages
        .iter_mut()
        .rev()
        .find(|message| message.role == Role::User)
        .ok_or_else(|| {
            ConduitError::EncodeFailed("vision request has no user message".to_string())
        })?;

    let mut parts = match std::mem::take(&mut target.content) {
        MessageContent::Text(text) => vec![ContentPart::text(text)],
        MessageContent::Parts(parts) => parts,
    };
    parts.extend(images.iter().map(|url| ContentPart::ImageUrl {
        image_url: decorate_image(url, image_options),
    }));
    target.content = MessageContent::Parts(parts);

    Ok(messages)
}

fn decorate_image(url: &str, image_options: Option<&ImageOptions>) -> ImageUrl {
    let mut image_url = ImageUrl::new(url);
    if let Some(options) = image_options {
        image_url.detail = options.detail;
        image_url.extra = options.extra.clone();
    }
    image_url
}

/// Convert tools to OpenAI's API tool specification
pub fn tools_to_openai_spec(tools: &[Tool]) -> ConduitResult<Vec<Value>> {
    let mut tool_names = std::collections::HashSet::new();
    let mut result = Vec::new();

    for tool in tools {
        if !is_valid_function_name(&tool.name) {
            return Err(ConduitError::EncodeFailed(format!(
                "The tool name '{}' has invalid characters, it must match [a-zA-Z0-9_-]+",
                tool.name
            )));
        }
        if !tool_names.insert(&tool.name) {
            return Err(ConduitError::EncodeFailed(format!(
                "Duplicate tool name: {}",
                tool.name
            )));
        }

        result.push(json!({
            "type": "function",
            "function": {
                "name": tool.name,
                "description": tool.description,
                "parameters": tool.parameters,
            }
        }));
    }

    Ok(result)
}

pub fn is_valid_function_name(name: &str) -> bool {
    FUNCTION_NAME.is_match(name)
}

/// Start a request body from the merged options and add the given fields.
///
/// Options go first so that a protocol field can never be overridden by an
/// option of the same name.
pub fn body_with_options(options: Map<String, Value>, fields: Vec<(&str, Value)>) -> Value {
    let mut body = options;
    for (key, value) in fields {
        body.insert(key.to_string(), value);
    }
    Value::Object(body)
}
