use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use hub_core::config::{OrchestratorConfig, RunnerKind};
use hub_engine::dispatch::{
    AgentRunner, DeltaSink, Dispatcher, FunctionInvoker, PortPool, RunnerBackend,
};
use hub_engine::engine::RunEngine;
use hub_engine::registry::{AgentRegistry, AuthVerifier};
use hub_engine::secrets::SecretResolver;
use hub_store::Database;

use crate::stream_bridge::{RunStreamer, StreamerConfig};

/// Collaborator implementations injected at startup. The binary wires real
/// ones; tests wire mocks.
pub struct Collaborators {
    pub registry: Arc<dyn AgentRegistry>,
    pub auth: Arc<dyn AuthVerifier>,
    pub secrets: Arc<dyn SecretResolver>,
    /// Used when `runner_kind` is `in_process`.
    pub runner: Arc<dyn AgentRunner>,
    /// Used when `runner_kind` is `async_invoke`.
    pub invoker: Arc<dyn FunctionInvoker>,
}

/// Everything the HTTP surface and background jobs share.
pub struct OrchestratorContext {
    pub db: Database,
    pub engine: Arc<RunEngine>,
    pub streamer: Arc<RunStreamer>,
    pub config: OrchestratorConfig,
    pub cancel: CancellationToken,
}

impl OrchestratorContext {
    pub fn new(db: Database, config: OrchestratorConfig, collaborators: Collaborators) -> Self {
        let backend = match config.runner_kind {
            RunnerKind::InProcess => RunnerBackend::InProcess(collaborators.runner),
            RunnerKind::PooledHttp => RunnerBackend::PooledHttp {
                url_template: config.callout_url_template.clone(),
            },
            RunnerKind::AsyncInvoke => RunnerBackend::AsyncInvoke {
                env_tag: config.invoke_env_tag.clone(),
                invoker: collaborators.invoker,
            },
        };
        let dispatcher = Arc::new(Dispatcher::new(
            backend,
            PortPool::new(config.port_pool.iter().copied()),
            DeltaSink::new(db.clone()),
        ));

        let engine = Arc::new(RunEngine::new(
            db.clone(),
            collaborators.registry,
            collaborators.auth,
            collaborators.secrets,
            dispatcher,
        ));

        let streamer = Arc::new(RunStreamer::new(
            db.clone(),
            StreamerConfig {
                timeout: config.stream_timeout,
                cleanup_grace: config.stream_cleanup_grace,
                ..StreamerConfig::default()
            },
        ));

        info!(runner = ?config.runner_kind, "orchestrator context ready");
        Self {
            db,
            engine,
            streamer,
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Signal every background task to wind down.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
