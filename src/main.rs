//! LP-SENTINEL — liquidity-agent risk controller
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores each agent's state machine from disk (or creates fresh),
//! registers the agents with the risk controller and runs until Ctrl+C.

use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

use lpsentinel::config;
use lpsentinel::dashboard;
use lpsentinel::engine::executor::DryRunExecutor;
use lpsentinel::engine::funds::FileFundsManager;
use lpsentinel::engine::{AgentStateMachine, RiskController};
use lpsentinel::storage::{JsonFileStore, StatePersistence};
use lpsentinel::types::{AgentEvent, AgentState, AgentStatusReport};

const BANNER: &str = r#"
 _     ____       ____  _____ _   _ _____ ___ _   _ _____ _
| |   |  _ \     / ___|| ____| \ | |_   _|_ _| \ | | ____| |
| |   | |_) |____\___ \|  _| |  \| | | |  | ||  \| |  _| | |
| |___|  __/_____|___) | |___| |\  | | |  | || |\  | |___| |___
|_____|_|        |____/|_____|_| \_| |_| |___|_| \_|_____|_____|

  Liquidity agent risk controller
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = config::AppConfig::load("config.toml")?;

    init_logging();

    println!("{BANNER}");
    info!(
        agents = cfg.agents.len(),
        monitor_interval_secs = cfg.controller.monitor_interval_secs,
        state_check_interval_secs = cfg.controller.state_check_interval_secs,
        "LP-SENTINEL starting up"
    );

    // -- Initialise components -------------------------------------------

    let persistence: Arc<dyn StatePersistence> = Arc::new(JsonFileStore::new(&cfg.storage.state_dir));
    let funds = Arc::new(FileFundsManager::new(&cfg.funds.snapshot_dir));

    if !cfg.executor.dry_run {
        warn!("Live execution requested but no ledger executor is built in; running dry-run");
    }
    let executor = Arc::new(DryRunExecutor::new());

    let controller = Arc::new(RiskController::new(
        funds,
        executor,
        cfg.controller.to_controller_config(),
    ));

    // -- Restore or create agent state machines ---------------------------

    for agent in &cfg.agents {
        let mut machine = AgentStateMachine::new(&agent.id, agent.to_agent_config(), persistence.clone());

        if machine.initialize().await {
            info!(agent_id = %agent.id, state = %machine.state(), "Resumed from saved state");
        } else {
            info!(agent_id = %agent.id, "Fresh start");
        }

        machine.add_state_change_listener(Arc::new(|report: &AgentStatusReport| -> anyhow::Result<()> {
            info!(
                agent_id = %report.agent_id,
                state = %report.state,
                last_error = ?report.last_error,
                "Agent state changed"
            );
            Ok(())
        }));

        if machine.state() == AgentState::Initializing && !machine.handle_event(AgentEvent::Start).await {
            error!(agent_id = %agent.id, "Agent failed to start");
        }

        controller.register_agent(&agent.id, machine.into_shared()).await;
    }

    if cfg.dashboard.enabled {
        if let Err(e) = dashboard::spawn_dashboard(controller.clone(), cfg.dashboard.port).await {
            error!(error = %e, "Dashboard failed to start, continuing without it");
        }
    }

    // -- Run until shutdown ------------------------------------------------

    info!("Monitoring agents. Press Ctrl+C to stop.");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received.");

    controller.shutdown().await;
    info!("LP-SENTINEL shut down cleanly.");

    Ok(())
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("lpsentinel=info"));

    let json_logging = std::env::var("LPSENTINEL_LOG_JSON").is_ok();

    if json_logging {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
