pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod document;
pub mod errors;
pub mod mock;
pub mod models;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod sequential;
pub mod stream;
pub mod transport;

pub use agent::Agent;
pub use dispatcher::{Dispatcher, ProtocolDispatcher, RetryingDispatcher};
pub use errors::{ConduitError, ConduitResult};
pub use models::protocol::Protocol;
pub use stream::ChunkStream;
pub use tokio_util::sync::CancellationToken;
