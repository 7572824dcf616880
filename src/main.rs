//! Warden - session orchestration daemon

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use warden::{
    accounts::load_accounts,
    client::LoopbackFactory,
    config::Args,
    crypto::CryptoManager,
    limits::{BackoffManager, ConcurrencyLimiter, RateLimiter},
    registry::{RegistryConfig, SessionRegistry},
    settings::Settings,
    state::StateManager,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = Args::parse();

    // Initialize tracing/logging
    let log_level = args.log_level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("warden={},info", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Validate configuration
    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    // Print startup banner
    info!("======================================");
    info!("  Warden - Session Orchestrator");
    info!("======================================");
    info!("Data dir: {}", args.data_dir.display());
    info!(
        "Rate limit: {} requests / {}s",
        args.rate_max_requests, args.rate_window_secs
    );
    info!("Concurrent connects: {}", args.max_concurrent_connects);
    info!(
        "Backoff: {}ms - {}ms (+{}ms jitter)",
        args.backoff_base_ms, args.backoff_max_ms, args.backoff_jitter_ms
    );
    info!("Autosave: every {}s", args.autosave_interval_secs);
    info!("Backups retained: {}", args.max_backups);
    info!(
        "Credential encryption: {}",
        if args.encrypt_credentials { "ON" } else { "OFF" }
    );
    info!("======================================");

    // Master key + crypto manager
    let crypto = Arc::new(CryptoManager::load(&args.key_file_path())?);

    // State persistence
    let state = Arc::new(StateManager::new(&args.data_dir, args.max_backups)?);

    // Settings; a rejected file falls back to defaults rather than
    // stopping the daemon
    let settings = match Settings::load(&args.settings_path()) {
        Ok(settings) => settings,
        Err(e) => {
            warn!("Settings file rejected ({}); using defaults", e);
            Settings::default()
        }
    };

    // Gating primitives
    let rate = Arc::new(RateLimiter::new(args.rate_max_requests, args.rate_window()));
    let concurrency = Arc::new(ConcurrencyLimiter::new(args.max_concurrent_connects));
    let backoff = Arc::new(BackoffManager::new(args.backoff_config()));

    // The orchestrator. The loopback factory stands in until a real
    // service client implementation is linked.
    let registry = Arc::new(SessionRegistry::new(
        Arc::new(LoopbackFactory),
        Arc::clone(&crypto),
        rate,
        concurrency,
        backoff,
        RegistryConfig::from_settings(&settings, args.logoff_timeout()),
    ));

    // Load the credential store
    let mut records = load_accounts(&args.accounts_path())?;
    for record in &mut records {
        if record.encrypted {
            if let Err(e) = crypto.decrypt_account(record, None) {
                error!(account = %record.username, error = %e, "Could not decrypt account; skipping");
                continue;
            }
        }
        if let Err(e) = registry.add_account(record.clone()) {
            warn!(error = %e, "Skipping account");
        }
    }
    info!("Managing {} account(s)", registry.session_count());

    // Restore orchestrator state from the last snapshot
    match state.load_state() {
        Ok(Some(doc)) => registry.restore_state(&doc),
        Ok(None) => info!("No previous state snapshot"),
        Err(e) => warn!("State restore failed ({}); starting fresh", e),
    }

    // Periodic autosave
    {
        let registry = Arc::clone(&registry);
        state
            .enable_autosave(args.autosave_interval(), move || registry.snapshot_state())
            .await;
    }

    // Bring the sessions up, staggered by the configured startup delay
    registry.start_all().await;
    let summary = registry.summary();
    info!(
        total = summary.total,
        active = summary.active,
        "Startup complete"
    );

    // Run until interrupted
    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    state.disable_autosave().await;
    registry.stop_all().await;

    if let Err(e) = state.save_state(&registry.snapshot_state()) {
        error!("Final state save failed: {}", e);
    } else if let Err(e) = state.create_backup() {
        warn!("Shutdown backup failed: {}", e);
    }

    info!("All sessions stopped; goodbye");
    Ok(())
}
