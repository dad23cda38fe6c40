use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigBuilder, Environment};
use config::builder::DefaultState;
use serde::Deserialize;

use crate::agent::Agent;
use crate::dispatcher::ProtocolDispatcher;
use crate::errors::{ConduitError, ConduitResult};
use crate::providers::base::Provider;
use crate::providers::configs::{OllamaProviderConfig, OpenAiProviderConfig, ProviderConfig};
use crate::providers::factory::{get_provider, ProviderType};
use crate::providers::{ollama, openai};
use crate::registry::{Model, ModelRegistry};
use crate::retry::RetryPolicy;
use crate::stream::DEFAULT_CHUNK_BUFFER;
use crate::transport::{HttpTransport, ReqwestTransport, TransportSettings};

pub const ENV_PREFIX: &str = "CONDUIT";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetrySettings {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.initial_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Everything needed to build a dispatcher and an agent
#[derive(Clone, Deserialize)]
pub struct ClientSettings {
    #[serde(default = "default_provider")]
    pub provider: ProviderType,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Unary request deadline in seconds; 0 disables it
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_stream_buffer")]
    pub stream_buffer: usize,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub models: Vec<Model>,
}

impl ClientSettings {
    /// Load from `CONDUIT_*` environment variables, after reading `.env`.
    ///
    /// Nested keys use a double underscore, e.g. `CONDUIT_RETRY__MAX_ATTEMPTS`.
    pub fn load() -> ConduitResult<Self> {
        dotenv::dotenv().ok();
        Self::load_from(Config::builder())
    }

    /// Layer the environment over the sources already in `builder`.
    pub fn load_from(builder: ConfigBuilder<DefaultState>) -> ConduitResult<Self> {
        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;
        Self::from_config(config)
    }

    pub fn from_config(config: Config) -> ConduitResult<Self> {
        let settings: Self = config.try_deserialize().map_err(|err| {
            tracing::debug!("Configuration error: {:?}", &err);
            config_error(err)
        })?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> ConduitResult<()> {
        if self.model.trim().is_empty() {
            return Err(ConduitError::ConfigInvalid("model must not be empty".to_string()));
        }
        if self.stream_buffer == 0 {
            return Err(ConduitError::ConfigInvalid(
                "stream_buffer must be at least 1".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConduitError::ConfigInvalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if !self.retry.multiplier.is_finite() || self.retry.multiplier < 1.0 {
            return Err(ConduitError::ConfigInvalid(
                "retry.multiplier must be a finite number >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry.policy()
    }

    /// Convert to the provider configuration. OpenAI needs an API key, taken
    /// from the settings or else from `OPENAI_API_KEY`.
    pub fn provider_config(&self) -> ConduitResult<ProviderConfig> {
        match self.provider {
            ProviderType::OpenAi => {
                let api_key = match self.api_key.clone().filter(|key| !key.trim().is_empty()) {
                    Some(api_key) => api_key,
                    None => OpenAiProviderConfig::from_env()?.api_key,
                };
                let host = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| openai::OPENAI_HOST.to_string());
                Ok(ProviderConfig::OpenAi(OpenAiProviderConfig::new(host, api_key)))
            }
            ProviderType::Ollama => {
                let host = self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| ollama::OLLAMA_HOST.to_string());
                Ok(ProviderConfig::Ollama(OllamaProviderConfig::new(host)))
            }
        }
    }

    pub fn build_provider(&self) -> ConduitResult<Provider> {
        Ok(get_provider(self.provider_config()?))
    }

    pub fn registry(&self) -> ModelRegistry {
        ModelRegistry::from(self.models.clone())
    }

    /// Dispatcher over a fresh pooled reqwest transport
    pub fn build_dispatcher(&self) -> ConduitResult<ProtocolDispatcher> {
        let transport = ReqwestTransport::new(&TransportSettings::default())?;
        self.build_dispatcher_with(Arc::new(transport))
    }

    pub fn build_dispatcher_with(
        &self,
        transport: Arc<dyn HttpTransport>,
    ) -> ConduitResult<ProtocolDispatcher> {
        Ok(ProtocolDispatcher::new(self.build_provider()?, transport)
            .with_registry(self.registry())
            .with_stream_buffer(self.stream_buffer)
            .with_timeout(self.timeout()))
    }

    pub fn build_agent(&self) -> ConduitResult<Agent> {
        let dispatcher = self.build_dispatcher()?;
        Ok(self.agent_for(Arc::new(dispatcher)))
    }

    pub fn build_agent_with(&self, transport: Arc<dyn HttpTransport>) -> ConduitResult<Agent> {
        let dispatcher = self.build_dispatcher_with(transport)?;
        Ok(self.agent_for(Arc::new(dispatcher)))
    }

    fn agent_for(&self, dispatcher: Arc<ProtocolDispatcher>) -> Agent {
        let agent = Agent::new(dispatcher, self.model.as_str());
        match &self.system_prompt {
            Some(system_prompt) => agent.with_system_prompt(system_prompt.as_str()),
            None => agent,
        }
    }
}

impl std::fmt::Debug for ClientSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSettings")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("model", &self.model)
            .field("system_prompt", &self.system_prompt)
            .field("timeout_secs", &self.timeout_secs)
            .field("stream_buffer", &self.stream_buffer)
            .field("retry", &self.retry)
            .field("models", &self.models.len())
            .finish()
    }
}

fn config_error(err: config::ConfigError) -> ConduitError {
    let message = err.to_string();
    // "missing field `model`" reads better as the variable to set
    if let Some(field) = message
        .strip_prefix("missing field `")
        .and_then(|rest| rest.split('`').next())
    {
        return ConduitError::ConfigInvalid(format!(
            "missing setting `{field}` (set {ENV_PREFIX}_{})",
            field.to_uppercase()
        ));
    }
    ConduitError::ConfigInvalid(message)
}

fn default_provider() -> ProviderType {
    ProviderType::OpenAi
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_stream_buffer() -> usize {
    DEFAULT_CHUNK_BUFFER
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    10_000
}
