use super::base::Provider;
use super::configs::OllamaProviderConfig;
use super::openai::openai_compatible;

pub const OLLAMA_HOST: &str = "http://localhost:11434/v1";

/// A local inference server speaking the OpenAI wire format, without auth
pub fn provider(config: &OllamaProviderConfig) -> Provider {
    openai_compatible("ollama", &config.host)
}
