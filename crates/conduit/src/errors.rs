use thiserror::Error;

use crate::models::protocol::Protocol;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ConduitError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Provider unreachable at {url}: {message}")]
    ProviderUnreachable { url: String, message: String },

    #[error("Provider returned HTTP {status}: {body}")]
    ProviderError { status: u16, body: String },

    #[error("Invalid option `{key}`: {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("Protocol {0} is not supported by this provider")]
    UnsupportedProtocol(Protocol),

    #[error("Streaming is not supported for protocol {0}")]
    UnsupportedStreaming(Protocol),

    #[error("Failed to encode request: {0}")]
    EncodeFailed(String),

    #[error("Failed to decode response: {0}")]
    DecodeFailed(String),

    #[error("Failed to parse stream: {0}")]
    StreamParseFailed(String),

    #[error("Expected a {expected} response, got {actual}")]
    UnexpectedResponseType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Retries exhausted after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last: Box<ConduitError>,
    },

    #[error("{protocol} request for model `{model}` failed: {source}")]
    Dispatch {
        protocol: Protocol,
        model: String,
        #[source]
        source: Box<ConduitError>,
    },

    #[error("Step failed for item at index {index}: {source}")]
    Step {
        index: usize,
        #[source]
        source: Box<ConduitError>,
    },
}

pub type ConduitResult<T> = Result<T, ConduitError>;

impl ConduitError {
    /// Wrap an error with the protocol and model it was dispatched for.
    pub fn dispatch(protocol: Protocol, model: impl Into<String>, source: ConduitError) -> Self {
        ConduitError::Dispatch {
            protocol,
            model: model.into(),
            source: Box::new(source),
        }
    }

    /// The innermost error, skipping diagnostic wrappers.
    ///
    /// `RetryExhausted` is not a wrapper: it is the error callers recover from.
    pub fn root(&self) -> &ConduitError {
        match self {
            ConduitError::Dispatch { source, .. } | ConduitError::Step { source, .. } => {
                source.root()
            }
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), ConduitError::Cancelled)
    }

    /// Whether a fresh attempt of the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            ConduitError::ProviderUnreachable { .. }
            | ConduitError::DecodeFailed(_)
            | ConduitError::StreamParseFailed(_) => true,
            ConduitError::ProviderError { status, .. } => {
                *status == 408 || *status == 429 || *status >= 500
            }
            _ => false,
        }
    }

    /// Status code of a provider HTTP error, if this is one.
    pub fn status(&self) -> Option<u16> {
        match self.root() {
            ConduitError::ProviderError { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for ConduitError {
    fn from(error: serde_json::Error) -> Self {
        ConduitError::DecodeFailed(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_skips_wrappers() {
        let error = ConduitError::Step {
            index: 2,
            source: Box::new(ConduitError::dispatch(
                Protocol::Vision,
                "m1",
                ConduitError::Cancelled,
            )),
        };
        assert!(error.is_cancelled());
        assert!(matches!(error.root(), ConduitError::Cancelled));
    }

    #[test]
    fn test_retryable_statuses() {
        let status = |status| ConduitError::ProviderError {
            status,
            body: String::new(),
        };
        assert!(status(500).is_retryable());
        assert!(status(503).is_retryable());
        assert!(status(408).is_retryable());
        assert!(status(429).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(404).is_retryable());
        assert!(!ConduitError::Cancelled.is_retryable());
        assert!(!ConduitError::InvalidOption {
            key: "temperature".into(),
            reason: "out of range".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_dispatch_display_includes_context() {
        let error = ConduitError::dispatch(
            Protocol::Chat,
            "m1",
            ConduitError::ProviderError {
                status: 401,
                body: "bad key".into(),
            },
        );
        let message = error.to_string();
        assert!(message.contains("chat"));
        assert!(message.contains("m1"));
        assert_eq!(error.status(), Some(401));
    }
}
