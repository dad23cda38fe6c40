//! These models represent the objects passed between the agent facade, the
//! dispatcher and the provider adapters.
//!
//! Callers build messages and typed requests; adapters convert them into the
//! provider wire format with the helpers in `providers::utils`. Responses and
//! stream chunks deserialize directly from the OpenAI-compatible wire shape,
//! so they round-trip without loss.
pub mod chunk;
pub mod message;
pub mod options;
pub mod protocol;
pub mod request;
pub mod response;
pub mod tool;
