pub mod config;
pub mod errors;
pub mod events;
pub mod ids;
pub mod run;

pub use config::{OrchestratorConfig, RunnerKind};
pub use errors::OrchestratorError;
pub use events::StreamEnvelope;
pub use ids::{DeltaId, MessageId, RunId, ScheduleId, ThreadId};
pub use run::{MessageRole, RunMode, RunParams, RunStatus};
