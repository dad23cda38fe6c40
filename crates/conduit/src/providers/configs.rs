use std::env;

use super::ollama::OLLAMA_HOST;
use super::openai::OPENAI_HOST;
use crate::errors::{ConduitError, ConduitResult};

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    Ollama(OllamaProviderConfig),
}

#[derive(Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub organization: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OllamaProviderConfig {
    pub host: String,
}

impl OpenAiProviderConfig {
    pub fn new<H: Into<String>, K: Into<String>>(host: H, api_key: K) -> Self {
        Self {
            host: host.into(),
            api_key: api_key.into(),
            organization: None,
        }
    }

    pub fn from_env() -> ConduitResult<Self> {
        let api_key = get_env("OPENAI_API_KEY", true, None)?.unwrap_or_default();
        let host = get_env("OPENAI_HOST", false, Some(OPENAI_HOST.to_string()))?
            .unwrap_or_else(|| OPENAI_HOST.to_string());
        let organization = get_env("OPENAI_ORGANIZATION", false, None)?;

        Ok(Self {
            host,
            api_key,
            organization,
        })
    }
}

impl std::fmt::Debug for OpenAiProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProviderConfig")
            .field("host", &self.host)
            .field("api_key", &"<redacted>")
            .field("organization", &self.organization)
            .finish()
    }
}

impl OllamaProviderConfig {
    pub fn new<H: Into<String>>(host: H) -> Self {
        Self { host: host.into() }
    }

    pub fn from_env() -> ConduitResult<Self> {
        let host = get_env("OLLAMA_HOST", false, Some(OLLAMA_HOST.to_string()))?
            .unwrap_or_else(|| OLLAMA_HOST.to_string());
        Ok(Self { host })
    }
}

impl Default for OllamaProviderConfig {
    fn default() -> Self {
        Self::new(OLLAMA_HOST)
    }
}

/// Helper function to get environment variables with error handling
fn get_env(key: &str, required: bool, default: Option<String>) -> ConduitResult<Option<String>> {
    match env::var(key) {
        Ok(value) if value.trim().is_empty() && required => Err(ConduitError::ConfigInvalid(
            format!("Environment variable '{key}' is set but empty."),
        )),
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) if !required => Ok(default),
        Err(env::VarError::NotPresent) => Err(ConduitError::ConfigInvalid(format!(
            "Environment variable '{key}' is required but not set."
        ))),
        Err(e) => Err(ConduitError::ConfigInvalid(format!(
            "Environment variable '{key}': {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_openai_from_env() -> anyhow::Result<()> {
        env::set_var("OPENAI_API_KEY", "sk-test");
        env::set_var("OPENAI_HOST", "http://localhost:9999/v1");
        env::remove_var("OPENAI_ORGANIZATION");

        let config = OpenAiProviderConfig::from_env()?;
        assert_eq!(config.api_key, "sk-test");
        assert_eq!(config.host, "http://localhost:9999/v1");
        assert!(!format!("{config:?}").contains("sk-test"));

        env::remove_var("OPENAI_API_KEY");
        env::remove_var("OPENAI_HOST");
        Ok(())
    }

    #[test]
    #[serial]
    fn test_openai_requires_key() {
        env::remove_var("OPENAI_API_KEY");
        let error = OpenAiProviderConfig::from_env().unwrap_err();
        assert!(matches!(error, ConduitError::ConfigInvalid(_)));
    }

    #[test]
    #[serial]
    fn test_ollama_defaults() -> anyhow::Result<()> {
        env::remove_var("OLLAMA_HOST");
        assert_eq!(OllamaProviderConfig::from_env()?.host, OLLAMA_HOST);
        Ok(())
    }
}
