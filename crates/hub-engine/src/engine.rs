use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, info, instrument, warn};

use hub_core::ids::{RunId, ThreadId};
use hub_core::run::{MessageRole, RunMode, RunParams, RunStatus};
use hub_core::OrchestratorError;
use hub_store::deltas::DeltaRepo;
use hub_store::messages::{MessageRepo, MessageRow};
use hub_store::runs::{NewRun, RunRepo, RunRow};
use hub_store::scheduled::{ScheduleRepo, ScheduledRunRow};
use hub_store::threads::ThreadRepo;
use hub_store::Database;

use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::registry::{AgentRegistry, AuthVerifier};
use crate::secrets::{merge_env, SecretResolver};

/// A run creation request as received from a caller (HTTP surface, the
/// scheduler, or the ledger poller).
#[derive(Clone, Debug)]
pub struct CreateRunRequest {
    pub caller_id: String,
    pub thread_id: Option<ThreadId>,
    pub agent_id: Option<String>,
    pub assistant_id: Option<String>,
    pub new_message: Option<String>,
    pub params: RunParams,
}

/// What `create_run` produced: an immediately queued run, or a deferred
/// request parked for the scheduler.
#[derive(Clone, Debug)]
pub enum CreateRunOutcome {
    Run(RunRow),
    Scheduled(ScheduledRunRow),
}

/// Coordinates run lifecycle: creation, dispatch, and chaining. Owns no
/// transport; callers drive it and the streaming bridge observes its
/// side effects through the delta table.
pub struct RunEngine {
    db: Database,
    threads: ThreadRepo,
    messages: MessageRepo,
    runs: RunRepo,
    schedules: ScheduleRepo,
    registry: Arc<dyn AgentRegistry>,
    auth: Arc<dyn AuthVerifier>,
    secrets: Arc<dyn SecretResolver>,
    dispatcher: Arc<Dispatcher>,
    // Serializes chain callbacks per parent so two children finishing at
    // once cannot interleave the parent's re-execution.
    chain_locks: DashMap<RunId, Arc<tokio::sync::Mutex<()>>>,
}

impl RunEngine {
    pub fn new(
        db: Database,
        registry: Arc<dyn AgentRegistry>,
        auth: Arc<dyn AuthVerifier>,
        secrets: Arc<dyn SecretResolver>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            threads: ThreadRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            runs: RunRepo::new(db.clone()),
            schedules: ScheduleRepo::new(db.clone()),
            db,
            registry,
            auth,
            secrets,
            dispatcher,
            chain_locks: DashMap::new(),
        }
    }

    /// Create a run (or park a scheduled request when `schedule_at` is set).
    ///
    /// Creates the thread when none is given, appends the user message when
    /// present, and leaves the run in `queued`. Execution is a separate step.
    #[instrument(skip(self, request), fields(caller_id = %request.caller_id))]
    pub async fn create_run(
        &self,
        request: CreateRunRequest,
    ) -> Result<CreateRunOutcome, OrchestratorError> {
        let agent_id = request
            .agent_id
            .as_deref()
            .or(request.assistant_id.as_deref())
            .ok_or_else(|| {
                OrchestratorError::InvalidInput("either agent_id or assistant_id is required".into())
            })?
            .to_string();

        // An explicit thread must exist and belong to the caller. Ownership
        // is checked before any write.
        let existing_thread = match &request.thread_id {
            Some(id) => {
                let thread = self.threads.get(id)?;
                self.auth.verify(&request.caller_id, &thread.owner_id).await?;
                Some(thread)
            }
            None => None,
        };

        if let Some(raw) = &request.params.schedule_at {
            let run_at = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| OrchestratorError::InvalidInput(format!("bad schedule_at: {e}")))?
                .with_timezone(&Utc);
            let params = serde_json::to_value(&request.params)
                .map_err(|e| OrchestratorError::Internal(e.to_string()))?;
            let row = self.schedules.create(
                &agent_id,
                request.new_message.as_deref().unwrap_or_default(),
                existing_thread.as_ref().map(|t| &t.id),
                params,
                run_at,
                &request.caller_id,
            )?;
            info!(schedule_id = %row.id, run_at = %row.run_at, "run deferred to scheduler");
            return Ok(CreateRunOutcome::Scheduled(row));
        }

        let thread = match existing_thread {
            Some(thread) => thread,
            None => self
                .threads
                .create(&request.caller_id, serde_json::json!({}), None)?,
        };

        if let Some(text) = &request.new_message {
            self.messages
                .create(&thread.id, MessageRole::User, text, None, None)?;
        }

        let params = &request.params;
        let run = self.runs.create(NewRun {
            thread_id: &thread.id,
            agent_id: &agent_id,
            model: params.model.as_deref(),
            instructions: params.instructions.as_deref(),
            tools: params
                .tool_resources
                .clone()
                .unwrap_or_else(|| serde_json::json!([])),
            max_iterations: params.max_iterations,
            parent_run_id: params.parent_run_id.as_ref(),
            run_mode: params.run_mode,
        })?;

        info!(run_id = %run.id, thread_id = %thread.id, agent_id = %agent_id, "run created");
        Ok(CreateRunOutcome::Run(run))
    }

    /// Execute a queued (or re-entered) run against the configured backend.
    ///
    /// Dispatch failures never propagate: the run is marked `failed` with
    /// the error recorded and the failed row is returned. `request_vars` are
    /// the caller-supplied env vars for this invocation; they are not
    /// persisted with the run.
    #[instrument(skip(self, request_vars), fields(run_id = %run_id))]
    pub async fn execute(
        &self,
        run_id: &RunId,
        request_vars: &HashMap<String, String>,
    ) -> Result<RunRow, OrchestratorError> {
        let run = self.runs.get(run_id)?;
        let thread = self.threads.get(&run.thread_id)?;

        let package = self.registry.get_agent(&run.agent_id).await?;
        let (agent_vars, user_vars) = self
            .secrets
            .resolve(&run.agent_id, &thread.owner_id)
            .await?;
        let env = merge_env(&package.default_env, &agent_vars, request_vars, &user_vars);

        let run = self.runs.update_status(run_id, RunStatus::InProgress, None)?;

        let input_text = self.latest_user_text(&thread.id)?;
        let dispatch = DispatchRequest {
            run_id: run.id.clone(),
            thread_id: run.thread_id.clone(),
            agent_id: run.agent_id.clone(),
            files_uri: package.files_uri.clone(),
            model: run.model.clone().unwrap_or_else(|| package.model.clone()),
            instructions: run
                .instructions
                .clone()
                .or_else(|| package.instructions.clone()),
            input_text,
            max_iterations: run.max_iterations,
            env,
        };

        match self.dispatcher.dispatch(&package, &dispatch).await {
            Ok(()) => {
                if run.parent_run_id.is_some() {
                    let run = self.runs.update_status(run_id, RunStatus::Completed, None)?;
                    self.chain(&run).await?;
                    Ok(self.runs.get(run_id)?)
                } else {
                    Ok(self
                        .runs
                        .update_status(run_id, RunStatus::RequiresAction, None)?)
                }
            }
            Err(e) => {
                warn!(error = %e, kind = e.error_kind(), "dispatch failed, marking run failed");
                Ok(self
                    .runs
                    .update_status(run_id, RunStatus::Failed, Some(&e.to_string()))?)
            }
        }
    }

    /// After a child run finishes, record it on its parent and, for
    /// callback-mode parents, re-invoke the parent. Serialized per parent.
    #[instrument(skip(self, run), fields(run_id = %run.id))]
    async fn chain(&self, run: &RunRow) -> Result<(), OrchestratorError> {
        let Some(parent_id) = &run.parent_run_id else {
            return Ok(());
        };

        let lock = self
            .chain_locks
            .entry(parent_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        self.runs.append_child(parent_id, &run.id)?;
        let parent = self.runs.get(parent_id)?;

        if parent.run_mode == RunMode::WithCallback {
            if parent.status == RunStatus::RequiresAction {
                debug!(parent = %parent.id, "re-invoking callback parent");
                Box::pin(self.execute(parent_id, &HashMap::new())).await?;
            } else {
                warn!(parent = %parent.id, status = %parent.status, "callback parent not re-entrant, skipping");
            }
        }

        drop(guard);
        // A finalized parent takes no further callbacks; drop its lock entry
        // so the map does not grow with dead parents. Late holders of the old
        // Arc still serialize among themselves.
        if self.runs.get(parent_id)?.status.is_final() {
            self.chain_locks.remove(parent_id);
        }
        Ok(())
    }

    /// Fetch a run, enforcing thread ownership.
    pub async fn get_run(
        &self,
        caller_id: &str,
        run_id: &RunId,
    ) -> Result<RunRow, OrchestratorError> {
        let run = self.runs.get(run_id)?;
        let thread = self.threads.get(&run.thread_id)?;
        self.auth.verify(caller_id, &thread.owner_id).await?;
        Ok(run)
    }

    /// List a thread's messages in creation order, enforcing ownership.
    pub async fn list_messages(
        &self,
        caller_id: &str,
        thread_id: &ThreadId,
    ) -> Result<Vec<MessageRow>, OrchestratorError> {
        let thread = self.threads.get(thread_id)?;
        self.auth.verify(caller_id, &thread.owner_id).await?;
        Ok(self.messages.list(thread_id, 1000, 0)?)
    }

    pub fn runs(&self) -> &RunRepo {
        &self.runs
    }

    pub fn deltas(&self) -> DeltaRepo {
        DeltaRepo::new(self.db.clone())
    }

    pub fn schedules(&self) -> &ScheduleRepo {
        &self.schedules
    }

    fn latest_user_text(&self, thread_id: &ThreadId) -> Result<Option<String>, OrchestratorError> {
        let messages = self.messages.list(thread_id, 1000, 0)?;
        Ok(messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .and_then(|m| {
                m.content
                    .as_array()
                    .and_then(|blocks| blocks.first())
                    .and_then(|b| b.get("text"))
                    .and_then(|t| t.as_str())
                    .map(str::to_string)
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{AgentRunner, DeltaSink, PortPool, RunnerBackend};
    use crate::registry::{AgentPackage, InMemoryRegistry, OwnerOnlyVerifier};
    use crate::secrets::StaticResolver;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct CapturingRunner {
        requests: Mutex<Vec<DispatchRequest>>,
        /// 1-based call index from which every dispatch fails.
        fail_from: Option<usize>,
    }

    #[async_trait]
    impl AgentRunner for CapturingRunner {
        async fn run(
            &self,
            request: &DispatchRequest,
            _deltas: &DeltaSink,
        ) -> Result<(), OrchestratorError> {
            let mut requests = self.requests.lock();
            requests.push(request.clone());
            if self.fail_from.is_some_and(|n| requests.len() >= n) {
                Err(OrchestratorError::UpstreamFailure("backend refused".into()))
            } else {
                Ok(())
            }
        }
    }

    fn package(agent_id: &str) -> AgentPackage {
        AgentPackage {
            agent_id: agent_id.to_string(),
            files_uri: format!("/var/agents/{agent_id}"),
            model: "gpt-4o".to_string(),
            instructions: Some("be helpful".to_string()),
            tools: vec![],
            framework: "python".to_string(),
            default_env: HashMap::from([("REGION".to_string(), "default".to_string())]),
        }
    }

    fn setup(fail_from: Option<usize>) -> (RunEngine, Arc<CapturingRunner>) {
        let db = Database::in_memory().unwrap();
        let runner = Arc::new(CapturingRunner { requests: Mutex::new(vec![]), fail_from });
        let dispatcher = Arc::new(Dispatcher::new(
            RunnerBackend::InProcess(runner.clone()),
            PortPool::new([]),
            DeltaSink::new(db.clone()),
        ));
        let mut registry = InMemoryRegistry::new();
        registry.register(package("A"));
        registry.register(package("B"));
        let engine = RunEngine::new(
            db,
            Arc::new(registry),
            Arc::new(OwnerOnlyVerifier),
            Arc::new(StaticResolver {
                agent_vars: HashMap::from([("AGENT_TOKEN".to_string(), "secret".to_string())]),
                user_vars: HashMap::new(),
            }),
            dispatcher,
        );
        (engine, runner)
    }

    fn request(agent_id: &str, message: Option<&str>) -> CreateRunRequest {
        CreateRunRequest {
            caller_id: "user-1".to_string(),
            thread_id: None,
            agent_id: Some(agent_id.to_string()),
            assistant_id: None,
            new_message: message.map(str::to_string),
            params: RunParams::default(),
        }
    }

    fn unwrap_run(outcome: CreateRunOutcome) -> RunRow {
        match outcome {
            CreateRunOutcome::Run(run) => run,
            CreateRunOutcome::Scheduled(s) => panic!("expected run, got schedule {}", s.id),
        }
    }

    #[tokio::test]
    async fn create_run_without_thread_creates_thread_and_user_message() {
        let (engine, _) = setup(None);
        let run = unwrap_run(engine.create_run(request("A", Some("hi"))).await.unwrap());

        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.agent_id, "A");

        let messages = engine.list_messages("user-1", &run.thread_id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[0].content[0]["text"], "hi");
    }

    #[tokio::test]
    async fn create_run_requires_an_agent() {
        let (engine, _) = setup(None);
        let mut req = request("A", None);
        req.agent_id = None;
        let err = engine.create_run(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn assistant_id_is_accepted_in_place_of_agent_id() {
        let (engine, _) = setup(None);
        let mut req = request("A", None);
        req.agent_id = None;
        req.assistant_id = Some("B".to_string());
        let run = unwrap_run(engine.create_run(req).await.unwrap());
        assert_eq!(run.agent_id, "B");
    }

    #[tokio::test]
    async fn unknown_thread_is_not_found() {
        let (engine, _) = setup(None);
        let mut req = request("A", None);
        req.thread_id = Some(ThreadId::from_raw("thr_missing"));
        let err = engine.create_run(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn foreign_thread_is_forbidden() {
        let (engine, _) = setup(None);
        let run = unwrap_run(engine.create_run(request("A", None)).await.unwrap());

        let mut req = request("A", None);
        req.caller_id = "intruder".to_string();
        req.thread_id = Some(run.thread_id.clone());
        let err = engine.create_run(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Forbidden(_)));
    }

    #[tokio::test]
    async fn schedule_at_defers_to_the_scheduler() {
        let (engine, _) = setup(None);
        let mut req = request("A", Some("later please"));
        req.params.schedule_at = Some("2099-01-01T00:00:00Z".to_string());

        match engine.create_run(req).await.unwrap() {
            CreateRunOutcome::Scheduled(row) => {
                assert!(!row.has_run);
                assert_eq!(row.agent_id, "A");
                assert_eq!(row.input_text, "later please");
            }
            CreateRunOutcome::Run(run) => panic!("expected schedule, got run {}", run.id),
        }
    }

    #[tokio::test]
    async fn malformed_schedule_at_is_invalid_input() {
        let (engine, _) = setup(None);
        let mut req = request("A", None);
        req.params.schedule_at = Some("next tuesday".to_string());
        let err = engine.create_run(req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn successful_execute_lands_in_requires_action() {
        let (engine, runner) = setup(None);
        let run = unwrap_run(engine.create_run(request("A", Some("hi"))).await.unwrap());

        let run = engine.execute(&run.id, &HashMap::new()).await.unwrap();
        assert_eq!(run.status, RunStatus::RequiresAction);
        assert!(run.started_at.is_some());

        let captured = runner.requests.lock();
        assert_eq!(captured.len(), 1);
        assert_eq!(captured[0].input_text.as_deref(), Some("hi"));
        // Merged env: package default plus agent secret.
        assert_eq!(captured[0].env["REGION"], "default");
        assert_eq!(captured[0].env["AGENT_TOKEN"], "secret");
    }

    #[tokio::test]
    async fn request_vars_override_package_defaults() {
        let (engine, runner) = setup(None);
        let run = unwrap_run(engine.create_run(request("A", None)).await.unwrap());

        let vars = HashMap::from([("REGION".to_string(), "eu-west".to_string())]);
        engine.execute(&run.id, &vars).await.unwrap();

        let captured = runner.requests.lock();
        assert_eq!(captured[0].env["REGION"], "eu-west");
    }

    #[tokio::test]
    async fn dispatch_failure_marks_run_failed_without_propagating() {
        let (engine, _) = setup(Some(1));
        let run = unwrap_run(engine.create_run(request("A", Some("hi"))).await.unwrap());

        let run = engine.execute(&run.id, &HashMap::new()).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.last_error.as_deref().unwrap().contains("backend refused"));
        assert!(run.failed_at.is_some());
    }

    #[tokio::test]
    async fn execute_unknown_run_is_not_found() {
        let (engine, _) = setup(None);
        let err = engine
            .execute(&RunId::from_raw("run_ghost"), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn chained_child_completes_and_reinvokes_callback_parent() {
        let (engine, runner) = setup(None);

        let mut parent_req = request("A", Some("orchestrate"));
        parent_req.params.run_mode = RunMode::WithCallback;
        let parent = unwrap_run(engine.create_run(parent_req).await.unwrap());
        engine.execute(&parent.id, &HashMap::new()).await.unwrap();

        let mut child_req = request("B", None);
        child_req.thread_id = Some(parent.thread_id.clone());
        child_req.params.parent_run_id = Some(parent.id.clone());
        let child = unwrap_run(engine.create_run(child_req).await.unwrap());

        let child = engine.execute(&child.id, &HashMap::new()).await.unwrap();
        assert_eq!(child.status, RunStatus::Completed);

        let parent = engine.get_run("user-1", &parent.id).await.unwrap();
        assert_eq!(parent.child_run_ids, vec![child.id]);
        // Parent dispatched twice: once initially, once via the callback.
        assert_eq!(parent.status, RunStatus::RequiresAction);
        let parent_calls = runner
            .requests
            .lock()
            .iter()
            .filter(|r| r.agent_id == "A")
            .count();
        assert_eq!(parent_calls, 2);
    }

    #[tokio::test]
    async fn simple_mode_parent_is_recorded_but_not_reinvoked() {
        let (engine, runner) = setup(None);

        let parent = unwrap_run(engine.create_run(request("A", Some("hi"))).await.unwrap());
        engine.execute(&parent.id, &HashMap::new()).await.unwrap();

        let mut child_req = request("B", None);
        child_req.thread_id = Some(parent.thread_id.clone());
        child_req.params.parent_run_id = Some(parent.id.clone());
        let child = unwrap_run(engine.create_run(child_req).await.unwrap());
        engine.execute(&child.id, &HashMap::new()).await.unwrap();

        let parent = engine.get_run("user-1", &parent.id).await.unwrap();
        assert_eq!(parent.child_run_ids.len(), 1);
        let parent_calls = runner
            .requests
            .lock()
            .iter()
            .filter(|r| r.agent_id == "A")
            .count();
        assert_eq!(parent_calls, 1);
    }

    #[tokio::test]
    async fn double_parenting_is_rejected() {
        let (engine, _) = setup(None);

        let parent = unwrap_run(engine.create_run(request("A", None)).await.unwrap());
        let mut child_req = request("B", None);
        child_req.thread_id = Some(parent.thread_id.clone());
        child_req.params.parent_run_id = Some(parent.id.clone());
        let child = unwrap_run(engine.create_run(child_req).await.unwrap());

        let mut grandchild_req = request("B", None);
        grandchild_req.thread_id = Some(parent.thread_id.clone());
        grandchild_req.params.parent_run_id = Some(child.id.clone());
        let err = engine.create_run(grandchild_req).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState(_)));
        assert!(err.to_string().contains("parent run cannot itself be a child run"));
    }

    #[tokio::test]
    async fn chain_lock_is_pruned_once_the_parent_finalizes() {
        // Calls 1 (parent) and 2 (child) succeed; the callback re-invocation
        // (call 3) fails, finalizing the parent.
        let (engine, _) = setup(Some(3));

        let mut parent_req = request("A", Some("orchestrate"));
        parent_req.params.run_mode = RunMode::WithCallback;
        let parent = unwrap_run(engine.create_run(parent_req).await.unwrap());
        engine.execute(&parent.id, &HashMap::new()).await.unwrap();

        let mut child_req = request("B", None);
        child_req.thread_id = Some(parent.thread_id.clone());
        child_req.params.parent_run_id = Some(parent.id.clone());
        let child = unwrap_run(engine.create_run(child_req).await.unwrap());
        engine.execute(&child.id, &HashMap::new()).await.unwrap();

        let parent = engine.get_run("user-1", &parent.id).await.unwrap();
        assert_eq!(parent.status, RunStatus::Failed);
        assert!(engine.chain_locks.is_empty(), "finalized parent must not retain a lock entry");
    }
}
