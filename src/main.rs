use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};

use chainjudge::config::{Config, StartupError};
use chainjudge::dispatch::Dispatcher;
use chainjudge::judge::JudgeEngine;
use chainjudge::languages::LanguageTable;
use chainjudge::miner::Miner;
use chainjudge::sandbox::Sandbox;
use chainjudge::store::Store;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("chainjudge=info")),
        )
        .init();

    dotenvy::dotenv().ok();

    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    info!(
        workers = config.workers,
        boxes = config.sandbox_boxes,
        epoch_ms = config.epoch_ms,
        "starting dispatcher"
    );

    let languages = Arc::new(
        LanguageTable::load().map_err(|e| StartupError::Config(format!("{:#}", e)))?,
    );

    let store = Store::connect(&config.database_url)
        .await
        .map_err(|e| StartupError::Store(format!("{:#}", e)))?;
    info!("connected to store at {}", config.database_url);

    Sandbox::probe()
        .await
        .map_err(|e| StartupError::Sandbox(format!("{:#}", e)))?;
    info!("sandbox probe succeeded");

    let sandbox = Sandbox::new(config.sandbox_boxes);

    let engine = Arc::new(JudgeEngine::new(
        sandbox,
        Arc::clone(&languages),
        config.problem_root.clone(),
        config.compile_cpu_ms,
        config.compile_mem_kib,
    ));

    let miner = Arc::new(Miner::new(store.clone(), config.epoch_ms));
    miner
        .ensure_genesis()
        .await
        .map_err(|e| StartupError::Store(format!("{:#}", e)))?;

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), engine, &config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx.clone()));
    let miner_handle = tokio::spawn(miner.run(shutdown_rx));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => error!("failed to listen for shutdown signal: {}", e),
    }

    let _ = shutdown_tx.send(true);
    let _ = dispatcher_handle.await;
    let _ = miner_handle.await;

    info!("clean shutdown");
    Ok(())
}
