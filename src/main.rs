use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use hub_core::config::OrchestratorConfig;
use hub_engine::registry::{InMemoryRegistry, OwnerOnlyVerifier};
use hub_engine::secrets::StaticResolver;
use hub_engine::{HttpInvoker, LocalProcessRunner};
use hub_sched::{HttpLedgerClient, JobConfig, JobScheduler, LedgerPoller, SchedulePoller};
use hub_server::{Collaborators, OrchestratorContext, ServerConfig};
use hub_store::Database;
use hub_telemetry::TelemetryConfig;

#[derive(Parser)]
#[command(name = "hubd", about = "Agent run orchestrator")]
struct Args {
    /// Database file path. Defaults to ~/.hub/database/hub.db.
    #[arg(long)]
    db: Option<PathBuf>,

    /// HTTP listen port.
    #[arg(long, default_value_t = 8700)]
    port: u16,

    /// Discard persisted ledger state and restart from the chain tip.
    #[arg(long)]
    reset_ledger: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    hub_telemetry::init_telemetry(TelemetryConfig {
        json_output: args.json_logs,
        ..TelemetryConfig::default()
    });

    tracing::info!("starting hub orchestrator");

    let mut config = OrchestratorConfig::from_env();
    if args.reset_ledger {
        config.reset_ledger_state = true;
    }

    let data_dir = args
        .db
        .as_ref()
        .and_then(|p| p.parent().map(PathBuf::from))
        .unwrap_or_else(|| home_dir().join(".hub").join("database"));
    std::fs::create_dir_all(&data_dir).expect("failed to create data directory");
    let db_path = args.db.unwrap_or_else(|| data_dir.join("hub.db"));

    let db = Database::open(&db_path).expect("failed to open database");
    tracing::info!(path = %db_path.display(), "database opened");

    let registry = match std::env::var("HUB_AGENTS_FILE") {
        Ok(path) => InMemoryRegistry::from_file(std::path::Path::new(&path))
            .expect("failed to load agents file"),
        Err(_) => {
            tracing::warn!("HUB_AGENTS_FILE not set, starting with an empty agent registry");
            InMemoryRegistry::new()
        }
    };

    let invoker_base =
        std::env::var("HUB_INVOKE_URL").unwrap_or_else(|_| "http://127.0.0.1:9800".to_string());

    let ctx = Arc::new(OrchestratorContext::new(
        db,
        config.clone(),
        Collaborators {
            registry: Arc::new(registry),
            auth: Arc::new(OwnerOnlyVerifier),
            secrets: Arc::new(StaticResolver::default()),
            runner: Arc::new(LocalProcessRunner),
            invoker: Arc::new(HttpInvoker::new(invoker_base)),
        },
    ));

    let scheduler = JobScheduler::new(ctx.cancel.clone());

    let schedule_poller = Arc::new(SchedulePoller::new(ctx.engine.clone()));
    scheduler.register(
        JobConfig::every("scheduled_runs", config.schedule_poll_interval).exclusive(),
        move || {
            let poller = schedule_poller.clone();
            Box::pin(async move { poller.tick().await })
        },
    );

    if let Ok(ledger_url) = std::env::var("HUB_LEDGER_URL") {
        let ledger_poller = LedgerPoller::new(
            Arc::new(HttpLedgerClient::new(ledger_url)),
            ctx.engine.clone(),
            data_dir.join("ledger-state.json"),
            config.blocks_per_tick,
            config.block_history_cap,
            config.reset_ledger_state,
        )
        .await
        .expect("failed to initialize ledger poller");
        let ledger_poller = Arc::new(ledger_poller);
        scheduler.register(
            JobConfig::every("ledger_blocks", config.ledger_poll_interval)
                .exclusive()
                .coalescing(),
            move || {
                let poller = ledger_poller.clone();
                Box::pin(async move { poller.tick().await })
            },
        );
    } else {
        tracing::info!("HUB_LEDGER_URL not set, ledger polling disabled");
    }

    scheduler.start();

    let handle = hub_server::start(ServerConfig { port: args.port }, ctx.clone())
        .await
        .expect("failed to start server");
    tracing::info!(port = handle.port, "hub orchestrator ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    ctx.shutdown();
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
