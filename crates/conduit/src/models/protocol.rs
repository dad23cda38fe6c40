use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter};

/// The request shapes a provider can serve.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumIter,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    Chat,
    Vision,
    Tools,
    Embeddings,
}

impl Protocol {
    /// Whether the protocol has an incremental response form at all.
    pub fn supports_streaming(self) -> bool {
        !matches!(self, Protocol::Embeddings)
    }
}
