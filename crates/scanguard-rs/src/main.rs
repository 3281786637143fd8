use std::sync::Arc;

use clap::Parser;
use tokio::sync::Mutex;
use tracing::{info, warn};

use scanguard::{
    adapters::NmapAdapter,
    cli::{self, Cli},
    config::{AppConfig, LogFormat},
    db::SqliteScanStore,
    engine::ScanEngine,
    executor::SystemExecutor,
    jobs::{worker_loop, JobRunnerState, LocalQueue},
    lifecycle::ScanManager,
};

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ScanManager>,
    pub runner_state: Arc<Mutex<JobRunnerState>>,
    pub config: Arc<AppConfig>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load()?);
    init_tracing(config.log_format);

    let store = Arc::new(SqliteScanStore::connect(&config.database_url).await?);
    let (queue, rx) = LocalQueue::new(config.queue_capacity);
    let engine = Arc::new(ScanEngine::new(
        config.target_policy()?,
        Arc::new(NmapAdapter::new(&config.tool_path)),
        Arc::new(SystemExecutor),
        config.exec_limits(),
    ));
    let manager = Arc::new(ScanManager::new(store, Arc::new(queue), engine));
    let runner_state = Arc::new(Mutex::new(JobRunnerState::default()));

    let state = AppState {
        manager: manager.clone(),
        runner_state: runner_state.clone(),
        config: config.clone(),
    };

    tokio::spawn(worker_loop(
        rx,
        manager,
        runner_state,
        config.max_concurrent_scans,
    ));

    match state.manager.check_tool().await {
        Ok(version) => info!(tool = %config.tool_path, %version, "scan tool available"),
        Err(e) => warn!(tool = %config.tool_path, error = %e, "scan tool check failed"),
    }

    let result = cli::run(cli.command, &state.manager, &state.config).await;
    let runner = state.runner_state.lock().await;
    info!(running = runner.running, finished = runner.finished, "shutting down");
    result
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
