use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use hub_core::run::{RunMode, RunParams};
use hub_core::OrchestratorError;
use hub_engine::engine::{CreateRunOutcome, CreateRunRequest, RunEngine};

/// Marker embedded in a block's execution logs. The rest of the line is a
/// JSON payload describing the requested run.
pub const RUN_REQUEST_MARKER: &str = "RUN_REQUEST:";

/// Identity recorded as the creator of ledger-initiated runs.
const LEDGER_CALLER: &str = "ledger";

const FETCH_ATTEMPTS: u32 = 3;

/// Polling passes a block may exhaust its fetch attempts before it is
/// dropped so the cursor can move on.
const TICK_FAILURE_LIMIT: u32 = 3;

#[derive(Clone, Debug)]
pub struct Block {
    pub id: u64,
    pub logs: Vec<String>,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Highest block id the ledger currently reports.
    async fn tip(&self) -> Result<u64, OrchestratorError>;

    /// Fetch one block. `NotFound` means the block does not exist yet;
    /// `RetryableFetch` is retried against a fixed budget.
    async fn fetch_block(&self, id: u64) -> Result<Block, OrchestratorError>;
}

/// Ledger node client speaking the HTTP block API: `GET /tip` returns
/// `{"height": n}` and `GET /blocks/{id}` returns `{"id": n, "logs": [..]}`.
pub struct HttpLedgerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpLedgerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Deserialize)]
struct TipResponse {
    height: u64,
}

#[derive(Deserialize)]
struct BlockResponse {
    id: u64,
    #[serde(default)]
    logs: Vec<String>,
}

#[async_trait]
impl LedgerClient for HttpLedgerClient {
    async fn tip(&self) -> Result<u64, OrchestratorError> {
        let url = format!("{}/tip", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::RetryableFetch(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(OrchestratorError::RetryableFetch(format!(
                "tip returned {}",
                resp.status()
            )));
        }
        let tip: TipResponse = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::RetryableFetch(e.to_string()))?;
        Ok(tip.height)
    }

    async fn fetch_block(&self, id: u64) -> Result<Block, OrchestratorError> {
        let url = format!("{}/blocks/{id}", self.base_url.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OrchestratorError::RetryableFetch(e.to_string()))?;
        if resp.status().as_u16() == 404 {
            return Err(OrchestratorError::NotFound(format!("block {id}")));
        }
        if !resp.status().is_success() {
            return Err(OrchestratorError::RetryableFetch(format!(
                "block {id} returned {}",
                resp.status()
            )));
        }
        let block: BlockResponse = resp
            .json()
            .await
            .map_err(|e| OrchestratorError::RetryableFetch(e.to_string()))?;
        Ok(Block {
            id: block.id,
            logs: block.logs,
        })
    }
}

/// JSON payload following the marker. `max_iterations` tolerates malformed
/// values; anything that is not a positive integer clamps to 1.
#[derive(Debug, Deserialize)]
struct RunRequestPayload {
    agent_id: String,
    message: String,
    #[serde(default)]
    max_iterations: Option<serde_json::Value>,
    #[serde(default)]
    env_vars: Option<HashMap<String, String>>,
}

/// Scan a log line for the run-request marker and parse the payload after it.
/// Lines without the marker, or with unparseable payloads, yield nothing.
fn parse_run_request(line: &str) -> Option<RunRequestPayload> {
    let start = line.find(RUN_REQUEST_MARKER)? + RUN_REQUEST_MARKER.len();
    serde_json::from_str(line[start..].trim()).ok()
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PollerState {
    current_block_id: u64,
    /// Recently processed ids, oldest first. Duplicate suppression only.
    processed: VecDeque<u64>,
    /// Exhausted-budget passes per block id, cleared on success. Not
    /// persisted; a restart grants a fresh budget.
    #[serde(skip)]
    failed_passes: HashMap<u64, u32>,
}

impl PollerState {
    fn mark_processed(&mut self, id: u64, cap: usize) {
        if self.processed.contains(&id) {
            return;
        }
        self.processed.push_back(id);
        while self.processed.len() > cap {
            self.processed.pop_front();
        }
    }
}

/// Tails the ledger for embedded run requests. One polling pass at a time;
/// state survives restarts via an atomically replaced file.
pub struct LedgerPoller {
    client: Arc<dyn LedgerClient>,
    engine: Arc<RunEngine>,
    state: tokio::sync::Mutex<PollerState>,
    state_path: PathBuf,
    blocks_per_tick: u64,
    history_cap: usize,
}

impl LedgerPoller {
    /// Load persisted state, or when `reset` is set discard it and start
    /// from the ledger's current tip.
    pub async fn new(
        client: Arc<dyn LedgerClient>,
        engine: Arc<RunEngine>,
        state_path: PathBuf,
        blocks_per_tick: u64,
        history_cap: usize,
        reset: bool,
    ) -> Result<Self, OrchestratorError> {
        let state = if reset {
            let tip = client.tip().await?;
            info!(tip, "ledger state reset, starting from tip");
            PollerState {
                current_block_id: tip,
                processed: VecDeque::new(),
                failed_passes: HashMap::new(),
            }
        } else {
            load_state(&state_path)
        };
        Ok(Self {
            client,
            engine,
            state: tokio::sync::Mutex::new(state),
            state_path,
            blocks_per_tick,
            history_cap,
        })
    }

    pub async fn current_block_id(&self) -> u64 {
        self.state.lock().await.current_block_id
    }

    /// One polling pass. The state lock is held for the whole pass so
    /// overlapping ticks cannot interleave state updates.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().await;
        let start = state.current_block_id + 1;

        let fetches = (start..start + self.blocks_per_tick)
            .map(|id| self.fetch_with_retry(id));
        let results = futures::future::join_all(fetches).await;

        // The cursor advances to the highest block that actually made it
        // through. A block that keeps failing holds the cursor for retry on
        // later passes, up to TICK_FAILURE_LIMIT passes; past that it is
        // dropped so one dead block cannot stall the feed. A failure below a
        // later success is dropped immediately.
        let mut max_processed = None;
        for (offset, result) in results.into_iter().enumerate() {
            let id = start + offset as u64;
            match result {
                Ok(block) => {
                    if state.processed.contains(&id) {
                        debug!(block = id, "already processed, skipping");
                    } else {
                        self.process_block(&block).await;
                        state.mark_processed(id, self.history_cap);
                    }
                    state.failed_passes.remove(&id);
                    max_processed = Some(max_processed.unwrap_or(0).max(id));
                }
                Err(OrchestratorError::NotFound(_)) => break,
                Err(e) => {
                    let passes = state.failed_passes.entry(id).or_insert(0);
                    *passes += 1;
                    if *passes >= TICK_FAILURE_LIMIT {
                        warn!(block = id, passes = *passes, error = %e, "fetch budget exhausted, dropping block");
                        state.failed_passes.remove(&id);
                        state.mark_processed(id, self.history_cap);
                        max_processed = Some(max_processed.unwrap_or(0).max(id));
                    } else {
                        warn!(block = id, error = %e, "block fetch failed, holding cursor for retry");
                    }
                }
            }
        }

        if let Some(max) = max_processed {
            if max > state.current_block_id {
                state.current_block_id = max;
                let watermark = state.current_block_id;
                state.failed_passes.retain(|id, _| *id > watermark);
                persist_state(&self.state_path, &state)?;
            }
        }
        Ok(())
    }

    async fn fetch_with_retry(&self, id: u64) -> Result<Block, OrchestratorError> {
        let mut last = None;
        for attempt in 0..FETCH_ATTEMPTS {
            match self.client.fetch_block(id).await {
                Ok(block) => return Ok(block),
                Err(e) if e.is_retryable() => {
                    debug!(block = id, attempt = attempt + 1, error = %e, "retrying block fetch");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| OrchestratorError::RetryableFetch("fetch budget exhausted".into())))
    }

    async fn process_block(&self, block: &Block) {
        for line in &block.logs {
            let Some(payload) = parse_run_request(line) else {
                continue;
            };
            let max_iterations = RunParams::clamp_iterations(
                payload.max_iterations.as_ref().and_then(|v| v.as_i64()),
            );
            let request = CreateRunRequest {
                caller_id: LEDGER_CALLER.to_string(),
                thread_id: None,
                agent_id: Some(payload.agent_id.clone()),
                assistant_id: None,
                new_message: Some(payload.message.clone()),
                params: RunParams {
                    max_iterations,
                    user_env_vars: payload.env_vars.clone().unwrap_or_default(),
                    run_mode: RunMode::Simple,
                    ..RunParams::default()
                },
            };
            match self.engine.create_run(request).await {
                Ok(CreateRunOutcome::Run(run)) => {
                    info!(block = block.id, run_id = %run.id, agent_id = %payload.agent_id, "ledger run created");
                    let vars = payload.env_vars.clone().unwrap_or_default();
                    if let Err(e) = self.engine.execute(&run.id, &vars).await {
                        warn!(run_id = %run.id, error = %e, "ledger run execution failed");
                    }
                }
                Ok(CreateRunOutcome::Scheduled(s)) => {
                    info!(block = block.id, schedule_id = %s.id, "ledger run deferred");
                }
                Err(e) => {
                    warn!(block = block.id, error = %e, "ledger run request rejected");
                }
            }
        }
    }
}

fn load_state(path: &Path) -> PollerState {
    match std::fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt poller state, starting fresh");
                PollerState::default()
            }
        },
        Err(_) => PollerState::default(),
    }
}

/// Crash-safe persistence: write to a sibling temp file, then rename over
/// the old state. A crash mid-write leaves the previous state intact.
fn persist_state(path: &Path, state: &PollerState) -> Result<(), OrchestratorError> {
    let bytes =
        serde_json::to_vec_pretty(state).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    std::fs::rename(&tmp, path).map_err(|e| OrchestratorError::Internal(e.to_string()))?;
    Ok(())
}
