use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use super::utils::normalize_base_url;
use crate::errors::{ConduitError, ConduitResult};
use crate::models::chunk::StreamChunk;
use crate::models::protocol::Protocol;
use crate::models::request::ProtocolRequest;
use crate::models::response::Response;

/// A provider's implementation of a single protocol
pub trait Capability: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Endpoint path appended to the provider's base URL
    fn path(&self) -> &str;

    /// Build the JSON body for the request. `options` is already merged with
    /// the model defaults and validated, and includes `model`.
    fn build_body(
        &self,
        request: &ProtocolRequest,
        options: Map<String, Value>,
    ) -> ConduitResult<Value>;

    fn parse_response(&self, body: &[u8]) -> ConduitResult<Response>;

    fn supports_streaming(&self) -> bool {
        false
    }

    /// Parse one event payload of a streaming response
    fn parse_chunk(&self, _payload: &str) -> ConduitResult<StreamChunk> {
        Err(ConduitError::UnsupportedStreaming(self.protocol()))
    }
}

/// An endpoint, its credential, and the protocols it can serve
#[derive(Clone)]
pub struct Provider {
    name: String,
    base_url: String,
    credential: Option<String>,
    extra_headers: BTreeMap<String, String>,
    capabilities: BTreeMap<Protocol, Arc<dyn Capability>>,
}

impl Provider {
    pub fn new<N: Into<String>>(name: N, base_url: &str) -> Self {
        Self {
            name: name.into(),
            base_url: normalize_base_url(base_url),
            credential: None,
            extra_headers: BTreeMap::new(),
            capabilities: BTreeMap::new(),
        }
    }

    /// Bearer credential; blank values mean no authentication
    pub fn with_credential(mut self, credential: Option<String>) -> Self {
        self.credential = credential.filter(|c| !c.trim().is_empty());
        self
    }

    pub fn with_header<K: Into<String>, V: Into<String>>(mut self, name: K, value: V) -> Self {
        self.extra_headers.insert(name.into(), value.into());
        self
    }

    pub fn with_capability(mut self, capability: Arc<dyn Capability>) -> Self {
        self.capabilities.insert(capability.protocol(), capability);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn supported_protocols(&self) -> Vec<Protocol> {
        self.capabilities.keys().copied().collect()
    }

    pub fn capability(&self, protocol: Protocol) -> ConduitResult<Arc<dyn Capability>> {
        self.capabilities
            .get(&protocol)
            .cloned()
            .ok_or(ConduitError::UnsupportedProtocol(protocol))
    }

    pub fn url_for(&self, capability: &dyn Capability) -> String {
        format!(
            "{}/{}",
            self.base_url,
            capability.path().trim_start_matches('/')
        )
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(self.extra_headers.len() + 1);
        if let Some(credential) = &self.credential {
            headers.push(("Authorization".to_string(), format!("Bearer {credential}")));
        }
        headers.extend(
            self.extra_headers
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        headers
    }
}

impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("authenticated", &self.credential.is_some())
            .field("extra_headers", &self.extra_headers)
            .field("protocols", &self.supported_protocols())
            .finish()
    }
}
