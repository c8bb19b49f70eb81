use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::broadcast;

use docflow::config::{resolve_config, Config};
use docflow::db::Database;
use docflow::pipeline::{Orchestrator, StageDeps};
use docflow::queue::{TaskQueue, WorkerPool};
use docflow::retention::RetentionScheduler;
use docflow::telemetry;

fn main() -> ExitCode {
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = match resolve_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("docflow: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = telemetry::init_logging(&config.logging) {
        eprintln!("docflow: failed to initialise logging: {}", e);
        return ExitCode::FAILURE;
    }

    info!("Starting docflow v{}", env!("CARGO_PKG_VERSION"));
    match run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("docflow stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(config: Config) -> docflow::Result<()> {
    if config.storage.presign_secret.is_empty() {
        warn!("storage.presign_secret is empty; presigned URLs are not secure");
    }

    let db = Database::open(&config.database.path)?;
    info!("Database: {:?}", config.database.path);

    let deps = StageDeps::from_config(&config, db.clone());
    let queue = TaskQueue::new(db, config.retry_policy());
    let documents = Arc::clone(&deps.documents);
    let orchestrator = Arc::new(Orchestrator::new(
        deps,
        queue.clone(),
        config.retention_policy(),
    ));

    let pool = WorkerPool::start(queue.clone(), orchestrator, config.pool_settings())?;

    let (trigger_tx, trigger_rx) = broadcast::channel::<()>(4);
    let scheduler = RetentionScheduler::new(
        documents,
        queue,
        config.retention_policy(),
        Duration::from_secs(config.retention.interval_secs),
    );
    let scheduler_handle = if config.retention.enabled {
        Some(scheduler.start(trigger_rx)?)
    } else {
        info!("Retention sweeps disabled");
        None
    };

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    if let Err(e) = ctrlc::set_handler(move || flag.store(false, Ordering::SeqCst)) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    while running.load(Ordering::SeqCst) {
        if let Some(report) = pool.recv_report_timeout(Duration::from_millis(250)) {
            info!(
                "Task {} ({}) attempt {} -> {}",
                report.task_id, report.kind, report.attempt, report.status
            );
        }
    }

    info!("Shutdown requested");
    scheduler.stop();
    let _ = trigger_tx.send(());
    if let Some(handle) = scheduler_handle {
        if handle.join().is_err() {
            error!("Retention scheduler panicked");
        }
    }
    pool.shutdown();
    pool.wait();

    Ok(())
}
