//! TRENDWARDEN: daily single-asset trend-following execution daemon
//!
//! Entry point. Loads configuration, initialises structured logging,
//! restores engine state from disk, connects the broker, optionally
//! resumes the engine, and serves the control surface until Ctrl+C.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info, warn};

use trendwarden::brokers::SimBrokerFactory;
use trendwarden::config::AppConfig;
use trendwarden::dashboard;
use trendwarden::data::{CsvDataSource, DataSource};
use trendwarden::engine::{CycleOutcome, LiveDecisionRunner, RuntimeController};
use trendwarden::storage::StateStore;
use trendwarden::strategy::{PositionSizer, SignalEngine};

const BANNER: &str = r#"
 _____ ____  _____ _   _ ____  __        ___    ____  ____  _____ _   _
|_   _|  _ \| ____| \ | |  _ \ \ \      / / \  |  _ \|  _ \| ____| \ | |
  | | | |_) |  _| |  \| | | | | \ \ /\ / / _ \ | |_) | | | |  _| |  \| |
  | | |  _ <| |___| |\  | |_| |  \ V  V / ___ \|  _ <| |_| | |___| |\  |
  |_| |_| \_\_____|_| \_|____/    \_/\_/_/   \_\_| \_\____/|_____|_| \_|

  Daily trend-following execution daemon
  v0.1.0
"#;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let cfg = AppConfig::load_default()?;

    init_logging();

    println!("{BANNER}");
    info!(
        symbol = %cfg.engine.symbol,
        schedule = %cfg.schedule()?,
        state_dir = %cfg.storage.dir.display(),
        csv_dir = %cfg.data.csv_dir.display(),
        "TRENDWARDEN starting up"
    );

    // -- Components ------------------------------------------------------

    let data: Arc<dyn DataSource> = Arc::new(CsvDataSource::new(&cfg.data.csv_dir));
    let factory = Arc::new(SimBrokerFactory::new(
        cfg.broker.sim_starting_cash,
        Some(Arc::clone(&data)),
    ));
    let runner = LiveDecisionRunner::new(
        cfg.runner_config(),
        SignalEngine::new(cfg.signal.clone()),
        PositionSizer::new(),
    );

    let store = StateStore::new(&cfg.storage.dir);
    // First boot: seed broker_config.json from [broker].
    if !store.broker_config_path().exists() {
        store
            .save_broker_config(&cfg.broker.to_broker_config())
            .context("Failed to seed broker config")?;
    }

    let controller = RuntimeController::new(
        runner,
        Arc::clone(&data),
        factory,
        store,
        cfg.controller_settings()?,
    );

    // -- Connect and resume ----------------------------------------------

    if cfg.broker.auto_connect {
        match controller.test_connection().await {
            Ok(account) => info!(%account, "Broker connected"),
            Err(e) => warn!(error = %e, "Broker auto-connect failed; use the control surface to retry"),
        }
    }

    if cfg.engine.resume_on_boot {
        match controller.resume().await {
            Ok(Some(outcome)) => log_outcome("Resumed engine", &outcome),
            Ok(None) => info!("Engine not resumed; waiting for a start request"),
            Err(e) => error!(error = %e, "Failed to resume engine"),
        }
    }

    // -- Control surface -------------------------------------------------

    let server = if cfg.dashboard.enabled {
        Some(dashboard::spawn_dashboard(controller.clone(), cfg.dashboard.port).await?)
    } else {
        None
    };

    info!("Running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown signal received.");

    // -- Shutdown --------------------------------------------------------

    let was_active = controller.status().await.engine_active;
    controller.stop().await;
    if let Some(server) = server {
        server.abort();
    }
    controller.disconnect().await;

    let status = controller.status().await;
    info!(
        was_active,
        last_run_date = ?status.last_run_date,
        live_return = ?status.live_return,
        max_drawdown = ?status.max_drawdown,
        "TRENDWARDEN shut down cleanly."
    );

    Ok(())
}

fn log_outcome(context: &str, outcome: &CycleOutcome) {
    if outcome.is_completed() {
        info!(result = %outcome.message(), "{context}");
    } else {
        warn!(result = %outcome.message(), "{context}");
    }
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("trendwarden=info"));

    let json_logging = std::env::var("TRENDWARDEN_LOG_JSON").is_ok();

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
