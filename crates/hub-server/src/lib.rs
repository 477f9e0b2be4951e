pub mod context;
pub mod server;
pub mod stream_bridge;

pub use context::{Collaborators, OrchestratorContext};
pub use server::{start, ServerConfig, ServerHandle};
pub use stream_bridge::{RunStreamer, StreamerConfig};
