//! Grid Trading Bot Binary
//!
//! Runs the multi-pair grid reconciliation loop against Kraken.
//!
//! ## Setup
//!
//! 1. Create a `.env` file in the project root:
//!    ```
//!    KRAKEN_API_KEY=YourApiKey
//!    KRAKEN_API_SECRET=YourBase64Secret
//!    DATA_DIR=data            # Optional
//!    PNL_REPORT_INTERVAL=300  # Optional, seconds
//!    ```
//!
//! 2. Run the bot:
//!    ```bash
//!    cargo run --bin grid_bot -- --config config/gridbot.toml
//!    ```

use std::env;
use std::fs::{self, OpenOptions};
use std::sync::Arc;

use log::{error, info, warn};

use kraken_gridbot::config::Settings;
use kraken_gridbot::grid::{
    GridRunner, JsonlLedger, KrakenClient, KrakenSigner, MonotonicNonce, NonceProvider,
    ReconciliationEngine, ShutdownSignal, StateManager, SystemClock,
};

const DEFAULT_CONFIG_PATH: &str = "config/gridbot.toml";

#[tokio::main]
async fn main() {
    // Load .env file
    let dotenv = dotenvy::dotenv();

    // Parse arguments
    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].clone()
    } else {
        DEFAULT_CONFIG_PATH.to_string()
    };

    let settings = Settings::new(&config_path);
    let level = settings
        .as_ref()
        .map(|s| s.log.level.clone())
        .unwrap_or_else(|_| "info".to_string());

    let mut logger =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level));
    if let Ok(Some(path)) = settings.as_ref().map(|s| s.log.file.clone()) {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!("Cannot create log directory {}: {}", parent.display(), e);
            }
        }
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                logger.target(env_logger::Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", path.display(), e),
        }
    }
    logger.init();

    match dotenv {
        Ok(path) => info!("Loaded environment from: {}", path.display()),
        Err(_) => info!("No .env file found, using system environment variables"),
    }

    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load config {}: {}", config_path, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = settings.validate() {
        error!("Invalid config {}: {}", config_path, e);
        std::process::exit(1);
    }

    let signer = match KrakenSigner::from_env() {
        Ok(signer) => signer,
        Err(e) => {
            error!("{}. Create a .env file with KRAKEN_API_KEY and KRAKEN_API_SECRET", e);
            std::process::exit(1);
        }
    };

    let data_dir = &settings.engine.data_dir;
    if let Err(e) = fs::create_dir_all(data_dir) {
        error!("Cannot create data directory {}: {}", data_dir.display(), e);
        std::process::exit(1);
    }
    info!("Data directory: {}", data_dir.display());

    let nonces: Arc<dyn NonceProvider> = if settings.engine.persist_nonce {
        Arc::new(MonotonicNonce::with_persistence(settings.engine.nonce_path()))
    } else {
        Arc::new(MonotonicNonce::new())
    };

    let exchange = match KrakenClient::new(
        settings.exchange.rest_url.clone(),
        signer,
        nonces,
        settings.exchange.retry_policy(),
        settings.exchange.request_timeout(),
    ) {
        Ok(client) => Arc::new(client),
        Err(e) => {
            error!("Failed to create exchange client: {}", e);
            std::process::exit(1);
        }
    };

    let ledger = match JsonlLedger::open(settings.engine.ledger_path()) {
        Ok(ledger) => Arc::new(ledger),
        Err(e) => {
            error!("Failed to open ledger: {}", e);
            std::process::exit(1);
        }
    };

    let state = StateManager::load_or_create(settings.engine.state_path());

    let (trigger, shutdown) = ShutdownSignal::new();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl-C received, finishing current step");
                trigger.trigger();
            }
            Err(e) => warn!("Cannot listen for Ctrl-C: {}", e),
        }
    });

    let engine = ReconciliationEngine::new(
        settings.enabled_pairs(),
        exchange,
        ledger.clone(),
        state,
        Arc::new(SystemClock),
        shutdown.clone(),
        settings.engine.engine_options(),
    );

    let mut runner = GridRunner::new(engine, ledger, settings.engine.runner_config(), shutdown);
    if let Err(e) = runner.run().await {
        error!("Grid bot exited with error: {}", e);
        std::process::exit(1);
    }
}
