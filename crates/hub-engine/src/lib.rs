pub mod dispatch;
pub mod engine;
pub mod registry;
pub mod secrets;

pub use dispatch::{
    AgentRunner, DispatchRequest, Dispatcher, FunctionInvoker, HttpInvoker, LocalProcessRunner,
    PortPool, RunnerBackend,
};
pub use engine::{CreateRunOutcome, CreateRunRequest, RunEngine};
pub use registry::{AgentPackage, AgentRegistry, AuthVerifier, InMemoryRegistry, OwnerOnlyVerifier};
pub use secrets::{merge_env, SecretResolver, StaticResolver};
