use std::time::Duration;

/// Which execution backend every run is dispatched to.
/// Process-wide, resolved once from the environment, never per-request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunnerKind {
    InProcess,
    PooledHttp,
    AsyncInvoke,
}

impl std::str::FromStr for RunnerKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_process" => Ok(Self::InProcess),
            "pooled_http" => Ok(Self::PooledHttp),
            "async_invoke" => Ok(Self::AsyncInvoke),
            other => Err(format!("unknown runner kind: {other}")),
        }
    }
}

/// Process-wide configuration, read from the environment at startup.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub runner_kind: RunnerKind,
    /// Pooled callout base URL with a `{port}` placeholder.
    pub callout_url_template: String,
    /// Environment tag prefixed to the agent framework to build the
    /// async-invocation function name.
    pub invoke_env_tag: String,
    /// Ports available to the pooled callout backend.
    pub port_pool: Vec<u16>,
    /// Ceiling on a streamed run's watcher lifetime.
    pub stream_timeout: Duration,
    /// Grace period after the terminal event before deltas are deleted.
    pub stream_cleanup_grace: Duration,
    /// Ring size for the ledger poller's duplicate-suppression set.
    pub block_history_cap: usize,
    /// Consecutive blocks fetched per poller tick.
    pub blocks_per_tick: u64,
    /// Discard persisted ledger state on startup and restart from the tip.
    pub reset_ledger_state: bool,
    pub ledger_poll_interval: Duration,
    pub schedule_poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            runner_kind: RunnerKind::InProcess,
            callout_url_template: "http://127.0.0.1:{port}/execute".into(),
            invoke_env_tag: "dev".into(),
            port_pool: (7001..=7004).collect(),
            stream_timeout: Duration::from_secs(10 * 60),
            stream_cleanup_grace: Duration::from_secs(5),
            block_history_cap: 256,
            blocks_per_tick: 8,
            reset_ledger_state: false,
            ledger_poll_interval: Duration::from_secs(5),
            schedule_poll_interval: Duration::from_secs(15),
        }
    }
}

impl OrchestratorConfig {
    /// Build from environment variables, falling back to defaults.
    /// Malformed values fall back rather than abort: the orchestrator should
    /// come up with a safe configuration and log what it is using.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("HUB_RUNNER") {
            match v.parse() {
                Ok(kind) => cfg.runner_kind = kind,
                Err(e) => tracing::warn!(value = %v, "{e}; using in_process"),
            }
        }
        if let Ok(v) = std::env::var("HUB_CALLOUT_URL") {
            cfg.callout_url_template = v;
        }
        if let Ok(v) = std::env::var("HUB_INVOKE_ENV_TAG") {
            cfg.invoke_env_tag = v;
        }
        if let Ok(v) = std::env::var("HUB_PORT_POOL") {
            let ports: Vec<u16> = v.split(',').filter_map(|p| p.trim().parse().ok()).collect();
            if !ports.is_empty() {
                cfg.port_pool = ports;
            }
        }
        if let Some(mins) = env_u64("HUB_STREAM_TIMEOUT_MINUTES") {
            cfg.stream_timeout = Duration::from_secs(mins * 60);
        }
        if let Some(n) = env_u64("HUB_BLOCK_HISTORY_CAP") {
            cfg.block_history_cap = n as usize;
        }
        if let Some(n) = env_u64("HUB_BLOCKS_PER_TICK") {
            cfg.blocks_per_tick = n.max(1);
        }
        if let Ok(v) = std::env::var("HUB_RESET_LEDGER_STATE") {
            cfg.reset_ledger_state = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Some(secs) = env_u64("HUB_LEDGER_POLL_SECS") {
            cfg.ledger_poll_interval = Duration::from_secs(secs.max(1));
        }
        if let Some(secs) = env_u64("HUB_SCHEDULE_POLL_SECS") {
            cfg.schedule_poll_interval = Duration::from_secs(secs.max(1));
        }

        cfg
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.runner_kind, RunnerKind::InProcess);
        assert_eq!(cfg.stream_timeout, Duration::from_secs(600));
        assert!(cfg.callout_url_template.contains("{port}"));
        assert!(cfg.blocks_per_tick >= 1);
        assert!(!cfg.port_pool.is_empty());
    }

    #[test]
    fn runner_kind_parse() {
        assert_eq!("in_process".parse::<RunnerKind>().unwrap(), RunnerKind::InProcess);
        assert_eq!("pooled_http".parse::<RunnerKind>().unwrap(), RunnerKind::PooledHttp);
        assert_eq!("async_invoke".parse::<RunnerKind>().unwrap(), RunnerKind::AsyncInvoke);
        assert!("lambda".parse::<RunnerKind>().is_err());
    }
}
