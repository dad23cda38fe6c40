use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::message::ImageDetail;
use crate::errors::{ConduitError, ConduitResult};

/// Key under which callers pass image decoration options for vision calls.
pub const IMAGE_OPTIONS_KEY: &str = "image_options";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequences {
    One(String),
    Many(Vec<String>),
}

/// Per-request options.
///
/// The recognized keys are typed; anything else lands in `extra` and is
/// forwarded to the provider when the model's option schema is open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model<M: Into<String>>(mut self, model: M) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_stop(mut self, stop: StopSequences) -> Self {
        self.stop = Some(stop);
        self
    }

    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_response_format(mut self, response_format: Value) -> Self {
        self.response_format = Some(response_format);
        self
    }

    pub fn with_extra<K: Into<String>>(mut self, key: K, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn with_image_options(self, image_options: &ImageOptions) -> ConduitResult<Self> {
        let value = serde_json::to_value(image_options)
            .map_err(|e| ConduitError::EncodeFailed(e.to_string()))?;
        Ok(self.with_extra(IMAGE_OPTIONS_KEY, value))
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Fill every unset field from `defaults`. Values already set here win.
    pub fn merged_over(&self, defaults: &RequestOptions) -> RequestOptions {
        let mut extra = defaults.extra.clone();
        extra.extend(self.extra.clone());
        RequestOptions {
            model: self.model.clone().or_else(|| defaults.model.clone()),
            stream: self.stream.or(defaults.stream),
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            presence_penalty: self.presence_penalty.or(defaults.presence_penalty),
            frequency_penalty: self.frequency_penalty.or(defaults.frequency_penalty),
            stop: self.stop.clone().or_else(|| defaults.stop.clone()),
            seed: self.seed.or(defaults.seed),
            response_format: self
                .response_format
                .clone()
                .or_else(|| defaults.response_format.clone()),
            extra,
        }
    }

    /// Remove and decode the image options carried in `extra`.
    pub fn take_image_options(&mut self) -> ConduitResult<Option<ImageOptions>> {
        match self.extra.remove(IMAGE_OPTIONS_KEY) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| ConduitError::InvalidOption {
                    key: IMAGE_OPTIONS_KEY.to_string(),
                    reason: e.to_string(),
                }),
        }
    }

    /// The options as the flat key/value map sent on the wire.
    pub fn to_map(&self) -> ConduitResult<Map<String, Value>> {
        match serde_json::to_value(self).map_err(|e| ConduitError::EncodeFailed(e.to_string()))? {
            Value::Object(map) => Ok(map),
            other => Err(ConduitError::EncodeFailed(format!(
                "options serialized to a non-object value: {other}"
            ))),
        }
    }
}

/// Decoration applied to every image part of a vision request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<ImageDetail>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageOptions {
    pub fn with_detail(detail: ImageDetail) -> Self {
        ImageOptions {
            detail: Some(detail),
            extra: Map::new(),
        }
    }
}
