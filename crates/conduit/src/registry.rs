//! Named models with per-protocol option defaults and validation schemas.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ConduitError, ConduitResult};
use crate::models::options::RequestOptions;
use crate::models::protocol::Protocol;

lazy_static! {
    static ref NO_DEFAULTS: RequestOptions = RequestOptions::default();
}

/// Constraint on the value of a single option key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptionRule {
    Number {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    Integer {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    Bool,
    String,
    Enum {
        values: Vec<String>,
    },
    StringOrList,
    Object,
    Any,
}

impl OptionRule {
    pub fn number(min: f64, max: f64) -> Self {
        OptionRule::Number {
            min: Some(min),
            max: Some(max),
        }
    }

    pub fn integer(min: Option<i64>, max: Option<i64>) -> Self {
        OptionRule::Integer { min, max }
    }

    pub fn one_of<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        OptionRule::Enum {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, key: &str, value: &Value) -> ConduitResult<()> {
        let invalid = |reason: String| ConduitError::InvalidOption {
            key: key.to_string(),
            reason,
        };

        match self {
            OptionRule::Number { min, max } => {
                let number = value
                    .as_f64()
                    .ok_or_else(|| invalid(format!("expected a number, got {value}")))?;
                check_range(number, *min, *max).map_err(invalid)
            }
            OptionRule::Integer { min, max } => {
                let number = value
                    .as_i64()
                    .ok_or_else(|| invalid(format!("expected an integer, got {value}")))?;
                check_range(number, *min, *max).map_err(invalid)
            }
            OptionRule::Bool if value.is_boolean() => Ok(()),
            OptionRule::Bool => Err(invalid(format!("expected a boolean, got {value}"))),
            OptionRule::String if value.is_string() => Ok(()),
            OptionRule::String => Err(invalid(format!("expected a string, got {value}"))),
            OptionRule::Enum { values } => match value.as_str() {
                Some(candidate) if values.iter().any(|allowed| allowed == candidate) => Ok(()),
                _ => Err(invalid(format!(
                    "expected one of [{}], got {value}",
                    values.join(", ")
                ))),
            },
            OptionRule::StringOrList => {
                let valid = match value {
                    Value::String(_) => true,
                    Value::Array(items) => items.iter().all(Value::is_string),
                    _ => false,
                };
                if valid {
                    Ok(())
                } else {
                    Err(invalid(format!(
                        "expected a string or a list of strings, got {value}"
                    )))
                }
            }
            OptionRule::Object if value.is_object() => Ok(()),
            OptionRule::Object => Err(invalid(format!("expected an object, got {value}"))),
            OptionRule::Any => Ok(()),
        }
    }
}

fn check_range<T>(value: T, min: Option<T>, max: Option<T>) -> Result<(), String>
where
    T: PartialOrd + std::fmt::Display + Copy,
{
    if let Some(min) = min {
        if value < min {
            return Err(format!("{value} is below the minimum of {min}"));
        }
    }
    if let Some(max) = max {
        if value > max {
            return Err(format!("{value} is above the maximum of {max}"));
        }
    }
    Ok(())
}

/// The keys a protocol accepts. Unknown keys are rejected only when closed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionSchema {
    #[serde(default)]
    pub closed: bool,
    #[serde(default)]
    pub rules: BTreeMap<String, OptionRule>,
}

impl OptionSchema {
    pub fn open() -> Self {
        Self::default()
    }

    pub fn closed() -> Self {
        Self {
            closed: true,
            rules: BTreeMap::new(),
        }
    }

    pub fn with_rule<K: Into<String>>(mut self, key: K, rule: OptionRule) -> Self {
        self.rules.insert(key.into(), rule);
        self
    }

    /// Open schema with the ranges of the OpenAI-compatible wire format
    pub fn standard(protocol: Protocol) -> Self {
        let schema = Self::open()
            .with_rule("stream", OptionRule::Bool)
            .with_rule("seed", OptionRule::integer(None, None));

        match protocol {
            Protocol::Embeddings => schema
                .with_rule("dimensions", OptionRule::integer(Some(1), None))
                .with_rule("encoding_format", OptionRule::one_of(["float", "base64"]))
                .with_rule("user", OptionRule::String),
            Protocol::Chat | Protocol::Vision | Protocol::Tools => schema
                .with_rule("temperature", OptionRule::number(0.0, 2.0))
                .with_rule("top_p", OptionRule::number(0.0, 1.0))
                .with_rule("max_tokens", OptionRule::integer(Some(1), None))
                .with_rule("presence_penalty", OptionRule::number(-2.0, 2.0))
                .with_rule("frequency_penalty", OptionRule::number(-2.0, 2.0))
                .with_rule("stop", OptionRule::StringOrList)
                .with_rule("response_format", OptionRule::Object),
        }
    }

    /// Check a merged option map. `model` and `stream` are always accepted.
    pub fn validate(&self, options: &Map<String, Value>) -> ConduitResult<()> {
        for (key, value) in options {
            match self.rules.get(key) {
                Some(rule) => rule.check(key, value)?,
                None if key == "model" || key == "stream" => {}
                None if self.closed => {
                    return Err(ConduitError::InvalidOption {
                        key: key.clone(),
                        reason: "not accepted by this model".to_string(),
                    })
                }
                None => {}
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub name: String,
    #[serde(default)]
    pub defaults: HashMap<Protocol, RequestOptions>,
    #[serde(default)]
    pub schemas: HashMap<Protocol, OptionSchema>,
}

impl Model {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            defaults: HashMap::new(),
            schemas: HashMap::new(),
        }
    }

    pub fn with_defaults(mut self, protocol: Protocol, defaults: RequestOptions) -> Self {
        self.defaults.insert(protocol, defaults);
        self
    }

    pub fn with_schema(mut self, protocol: Protocol, schema: OptionSchema) -> Self {
        self.schemas.insert(protocol, schema);
        self
    }

    pub fn defaults_for(&self, protocol: Protocol) -> &RequestOptions {
        self.defaults.get(&protocol).unwrap_or(&NO_DEFAULTS)
    }

    /// The declared schema, or the standard open one
    pub fn schema_for(&self, protocol: Protocol) -> Cow<'_, OptionSchema> {
        match self.schemas.get(&protocol) {
            Some(schema) => Cow::Borrowed(schema),
            None => Cow::Owned(OptionSchema::standard(protocol)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<Model>", into = "Vec<Model>")]
pub struct ModelRegistry {
    models: HashMap<String, Model>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: Model) -> Self {
        self.register(model);
        self
    }

    /// Add or replace a model definition
    pub fn register(&mut self, model: Model) {
        self.models.insert(model.name.clone(), model);
    }

    pub fn get(&self, name: &str) -> Option<&Model> {
        self.models.get(name)
    }

    /// The registered model, or an open model without defaults
    pub fn resolve(&self, name: &str) -> Cow<'_, Model> {
        match self.models.get(name) {
            Some(model) => Cow::Borrowed(model),
            None => Cow::Owned(Model::new(name)),
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl From<Vec<Model>> for ModelRegistry {
    fn from(models: Vec<Model>) -> Self {
        models
            .into_iter()
            .fold(ModelRegistry::new(), ModelRegistry::with_model)
    }
}

impl From<ModelRegistry> for Vec<Model> {
    fn from(registry: ModelRegistry) -> Self {
        let mut models: Vec<Model> = registry.models.into_values().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        models
    }
}
