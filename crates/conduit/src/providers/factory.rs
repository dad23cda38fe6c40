use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use super::{base::Provider, configs::ProviderConfig, ollama, openai};

#[derive(EnumIter, EnumString, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ProviderType {
    OpenAi,
    Ollama,
}

pub fn get_provider(config: ProviderConfig) -> Provider {
    match config {
        ProviderConfig::OpenAi(openai_config) => openai::provider(&openai_config),
        ProviderConfig::Ollama(ollama_config) => ollama::provider(&ollama_config),
    }
}
