use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use hub_core::{DeltaId, MessageId, OrchestratorError, RunId, ThreadId};
use hub_store::deltas::DeltaRepo;
use hub_store::Database;

use crate::registry::AgentPackage;

/// Everything a backend needs to execute one run. Env vars are already
/// merged; the dispatcher never consults the secret store itself.
#[derive(Clone, Debug, Serialize)]
pub struct DispatchRequest {
    pub run_id: RunId,
    pub thread_id: ThreadId,
    pub agent_id: String,
    pub files_uri: String,
    pub model: String,
    pub instructions: Option<String>,
    pub input_text: Option<String>,
    pub max_iterations: u32,
    pub env: HashMap<String, String>,
}

/// Write side of the streaming pipeline, handed to in-process backends so
/// execution progress lands in the delta table where per-run watchers pick
/// it up. Out-of-process backends report through the HTTP ingestion route
/// instead.
#[derive(Clone)]
pub struct DeltaSink {
    deltas: DeltaRepo,
}

impl DeltaSink {
    pub fn new(db: Database) -> Self {
        Self {
            deltas: DeltaRepo::new(db),
        }
    }

    pub fn emit(
        &self,
        run_id: &RunId,
        message_id: Option<&MessageId>,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<DeltaId, OrchestratorError> {
        Ok(self.deltas.append(run_id, message_id, kind, payload)?)
    }
}

/// In-process execution backend.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(
        &self,
        request: &DispatchRequest,
        deltas: &DeltaSink,
    ) -> Result<(), OrchestratorError>;
}

/// Async function invocation backend (e.g. a serverless runtime). Blocks
/// until the invocation returns.
#[async_trait]
pub trait FunctionInvoker: Send + Sync {
    async fn invoke(
        &self,
        function_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), OrchestratorError>;
}

#[derive(Default)]
struct PortPoolInner {
    free: VecDeque<u16>,
    assigned: HashMap<String, u16>,
    // Agent ids in assignment order, oldest first. Used to pick the
    // eviction victim under exhaustion.
    order: VecDeque<String>,
}

/// Bounded pool of callout ports. Each agent keeps its assigned port across
/// dispatches; when the pool is exhausted the least-recently-assigned agent
/// loses its port to the newcomer. Only assignment is locked, never the
/// HTTP call that follows.
pub struct PortPool {
    inner: Mutex<PortPoolInner>,
}

impl PortPool {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            inner: Mutex::new(PortPoolInner {
                free: ports.into_iter().collect(),
                assigned: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn allocate(&self, agent_id: &str) -> u16 {
        let mut pool = self.inner.lock();
        if let Some(port) = pool.assigned.get(agent_id) {
            return *port;
        }
        let port = if let Some(port) = pool.free.pop_front() {
            port
        } else if let Some(victim) = pool.order.pop_front() {
            // Exhausted. Evict the oldest assignment and reuse its port.
            let port = pool.assigned.remove(&victim).unwrap_or_default();
            warn!(victim = %victim, port, new_agent = %agent_id, "port pool exhausted, evicting oldest assignment");
            port
        } else {
            warn!(agent_id = %agent_id, "port pool configured with no ports, using 0");
            0
        };
        pool.assigned.insert(agent_id.to_string(), port);
        pool.order.push_back(agent_id.to_string());
        port
    }

    pub fn assigned_port(&self, agent_id: &str) -> Option<u16> {
        self.inner.lock().assigned.get(agent_id).copied()
    }
}

/// Process-wide backend selection. Chosen once from configuration, never
/// per request.
pub enum RunnerBackend {
    InProcess(Arc<dyn AgentRunner>),
    PooledHttp { url_template: String },
    AsyncInvoke {
        env_tag: String,
        invoker: Arc<dyn FunctionInvoker>,
    },
}

pub struct Dispatcher {
    backend: RunnerBackend,
    pool: PortPool,
    sink: DeltaSink,
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(backend: RunnerBackend, pool: PortPool, sink: DeltaSink) -> Self {
        Self {
            backend,
            pool,
            sink,
            client: reqwest::Client::new(),
        }
    }

    /// Hand the request to the configured backend and wait for it to return.
    /// Deltas produced during execution land in the store, not here; the
    /// return value only says whether the backend call itself succeeded.
    #[instrument(skip(self, package, request), fields(run_id = %request.run_id, agent_id = %request.agent_id))]
    pub async fn dispatch(
        &self,
        package: &AgentPackage,
        request: &DispatchRequest,
    ) -> Result<(), OrchestratorError> {
        match &self.backend {
            RunnerBackend::InProcess(runner) => {
                debug!("dispatching in-process");
                runner.run(request, &self.sink).await
            }
            RunnerBackend::PooledHttp { url_template } => {
                let port = self.pool.allocate(&request.agent_id);
                let url = url_template.replace("{port}", &port.to_string());
                debug!(%url, "dispatching pooled http callout");
                let resp = self
                    .client
                    .post(&url)
                    .json(request)
                    .send()
                    .await
                    .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;
                if !resp.status().is_success() {
                    let status = resp.status().as_u16();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(OrchestratorError::UpstreamFailure(format!(
                        "callout returned {status}: {body}"
                    )));
                }
                Ok(())
            }
            RunnerBackend::AsyncInvoke { env_tag, invoker } => {
                let function_name = format!("{env_tag}-{}", package.framework);
                debug!(%function_name, "dispatching async invocation");
                let payload = serde_json::to_value(request)
                    .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
                invoker.invoke(&function_name, payload).await
            }
        }
    }
}

/// In-process backend that executes the agent package as a local child
/// process. The package's `files_uri` is treated as the entrypoint path;
/// merged env vars and run identifiers are passed through the environment.
/// Each stdout line the child prints is recorded as an output delta.
pub struct LocalProcessRunner;

#[async_trait]
impl AgentRunner for LocalProcessRunner {
    async fn run(
        &self,
        request: &DispatchRequest,
        deltas: &DeltaSink,
    ) -> Result<(), OrchestratorError> {
        let mut command = tokio::process::Command::new(&request.files_uri);
        command
            .envs(&request.env)
            .env("HUB_RUN_ID", request.run_id.as_str())
            .env("HUB_THREAD_ID", request.thread_id.as_str())
            .env("HUB_MODEL", &request.model)
            .env("HUB_MAX_ITERATIONS", request.max_iterations.to_string());
        if let Some(text) = &request.input_text {
            command.env("HUB_INPUT", text);
        }

        let output = command
            .output()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(format!("spawn failed: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::UpstreamFailure(format!(
                "agent exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Err(e) = deltas.emit(
                &request.run_id,
                None,
                "thread.message.delta",
                serde_json::json!({"text": line}),
            ) {
                warn!(run_id = %request.run_id, error = %e, "failed to record output delta");
            }
        }
        Ok(())
    }
}

/// Function invoker backed by an HTTP invocation gateway. The composite
/// function name becomes a path segment under the gateway base URL.
pub struct HttpInvoker {
    base_url: String,
    client: reqwest::Client,
}

impl HttpInvoker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl FunctionInvoker for HttpInvoker {
    async fn invoke(
        &self,
        function_name: &str,
        payload: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), function_name);
        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| OrchestratorError::UpstreamFailure(e.to_string()))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(OrchestratorError::UpstreamFailure(format!(
                "invocation returned {status}: {body}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn request(agent_id: &str) -> DispatchRequest {
        DispatchRequest {
            run_id: RunId::new(),
            thread_id: ThreadId::new(),
            agent_id: agent_id.to_string(),
            files_uri: format!("/var/agents/{agent_id}"),
            model: "gpt-4o".to_string(),
            instructions: None,
            input_text: Some("hi".to_string()),
            max_iterations: 10,
            env: HashMap::new(),
        }
    }

    fn package(agent_id: &str, framework: &str) -> AgentPackage {
        AgentPackage {
            agent_id: agent_id.to_string(),
            files_uri: format!("/var/agents/{agent_id}"),
            model: "gpt-4o".to_string(),
            instructions: None,
            tools: vec![],
            framework: framework.to_string(),
            default_env: HashMap::new(),
        }
    }

    struct CountingRunner {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl AgentRunner for CountingRunner {
        async fn run(
            &self,
            _request: &DispatchRequest,
            _deltas: &DeltaSink,
        ) -> Result<(), OrchestratorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(OrchestratorError::UpstreamFailure("runner exploded".into()))
            } else {
                Ok(())
            }
        }
    }

    fn sink() -> DeltaSink {
        DeltaSink::new(Database::in_memory().unwrap())
    }

    struct RecordingInvoker {
        names: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FunctionInvoker for RecordingInvoker {
        async fn invoke(
            &self,
            function_name: &str,
            _payload: serde_json::Value,
        ) -> Result<(), OrchestratorError> {
            self.names.lock().push(function_name.to_string());
            Ok(())
        }
    }

    #[test]
    fn pool_reuses_existing_assignment() {
        let pool = PortPool::new([7001, 7002]);
        assert_eq!(pool.allocate("a"), 7001);
        assert_eq!(pool.allocate("a"), 7001);
        assert_eq!(pool.allocate("b"), 7002);
    }

    #[test]
    fn exhausted_pool_evicts_oldest_without_failing() {
        let pool = PortPool::new([7001]);
        assert_eq!(pool.allocate("first"), 7001);
        // Second agent takes the only port; first loses it.
        assert_eq!(pool.allocate("second"), 7001);
        assert_eq!(pool.assigned_port("first"), None);
        assert_eq!(pool.assigned_port("second"), Some(7001));
    }

    #[test]
    fn eviction_order_is_assignment_order() {
        let pool = PortPool::new([7001, 7002]);
        pool.allocate("a");
        pool.allocate("b");
        pool.allocate("c");
        assert_eq!(pool.assigned_port("a"), None);
        assert_eq!(pool.assigned_port("b"), Some(7002));
        assert_eq!(pool.assigned_port("c"), Some(7001));
    }

    #[tokio::test]
    async fn in_process_dispatch_runs_the_runner() {
        let runner = Arc::new(CountingRunner { calls: AtomicUsize::new(0), fail: false });
        let dispatcher = Dispatcher::new(
            RunnerBackend::InProcess(runner.clone()),
            PortPool::new([]),
            sink(),
        );
        dispatcher
            .dispatch(&package("demo.agent", "python"), &request("demo.agent"))
            .await
            .unwrap();
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn runner_failure_surfaces_as_upstream_failure() {
        let runner = Arc::new(CountingRunner { calls: AtomicUsize::new(0), fail: true });
        let dispatcher =
            Dispatcher::new(RunnerBackend::InProcess(runner), PortPool::new([]), sink());
        let err = dispatcher
            .dispatch(&package("demo.agent", "python"), &request("demo.agent"))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UpstreamFailure(_)));
    }

    struct EmittingRunner;

    #[async_trait]
    impl AgentRunner for EmittingRunner {
        async fn run(
            &self,
            request: &DispatchRequest,
            deltas: &DeltaSink,
        ) -> Result<(), OrchestratorError> {
            deltas.emit(
                &request.run_id,
                None,
                "thread.message.delta",
                serde_json::json!({"text": "chunk"}),
            )?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn runner_deltas_land_in_the_store() {
        use hub_core::run::RunMode;
        use hub_store::runs::{NewRun, RunRepo};
        use hub_store::threads::ThreadRepo;

        let db = Database::in_memory().unwrap();
        let thread = ThreadRepo::new(db.clone())
            .create("user-1", serde_json::json!({}), None)
            .unwrap();
        let run = RunRepo::new(db.clone())
            .create(NewRun {
                thread_id: &thread.id,
                agent_id: "demo.agent",
                model: None,
                instructions: None,
                tools: serde_json::json!([]),
                max_iterations: 10,
                parent_run_id: None,
                run_mode: RunMode::Simple,
            })
            .unwrap();

        let dispatcher = Dispatcher::new(
            RunnerBackend::InProcess(Arc::new(EmittingRunner)),
            PortPool::new([]),
            DeltaSink::new(db.clone()),
        );
        let mut req = request("demo.agent");
        req.run_id = run.id.clone();
        req.thread_id = run.thread_id.clone();
        dispatcher
            .dispatch(&package("demo.agent", "python"), &req)
            .await
            .unwrap();

        let rows = DeltaRepo::new(db).list_after(&run.id, 0, 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, "thread.message.delta");
        assert_eq!(rows[0].payload["text"], "chunk");
    }

    #[tokio::test]
    async fn async_invoke_composes_function_name() {
        let invoker = Arc::new(RecordingInvoker { names: Mutex::new(vec![]) });
        let dispatcher = Dispatcher::new(
            RunnerBackend::AsyncInvoke {
                env_tag: "prod".to_string(),
                invoker: invoker.clone(),
            },
            PortPool::new([]),
            sink(),
        );
        dispatcher
            .dispatch(&package("demo.agent", "python"), &request("demo.agent"))
            .await
            .unwrap();
        assert_eq!(invoker.names.lock().as_slice(), ["prod-python"]);
    }
}
