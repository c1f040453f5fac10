// =============================================================================
// Meridian Trading Engine — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode via the API.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod broker;
mod clock;
mod engine;
mod exit;
mod gate;
mod ledger;
mod runtime_config;
mod state_store;
mod types;

#[cfg(test)]
mod testutil;

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::broker::AlpacaClient;
use crate::clock::SystemClock;
use crate::engine::TradingEngine;
use crate::ledger::{Ledger, MemoryLedger, RestLedgerClient};
use crate::runtime_config::RuntimeConfig;
use crate::state_store::PositionStateStore;
use crate::types::{AccountMode, TradingMode};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Meridian Trading Engine — Starting Up            ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Paused on startup; entries require an explicit resume.
    config.trading_mode = TradingMode::Paused;

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("MERIDIAN_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!(symbols = ?config.symbols, "Configured watchlist");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        tick_interval_secs = config.tick_interval_secs,
        "Engine starting in SAFE mode (entries paused)"
    );

    let account_mode = config.account_mode;
    let tick_interval_secs = config.tick_interval_secs;
    let levels_ttl_hours = config.levels_ttl_hours;
    let config = Arc::new(RwLock::new(config));

    // ── 2. Build collaborators ───────────────────────────────────────────
    let api_key = std::env::var("APCA_API_KEY_ID").unwrap_or_default();
    let api_secret = std::env::var("APCA_API_SECRET_KEY").unwrap_or_default();
    let mut alpaca = AlpacaClient::new(api_key, api_secret);
    if let Ok(base_url) = std::env::var("APCA_API_BASE_URL") {
        alpaca = alpaca.with_base_url(base_url);
    }
    let broker = Arc::new(alpaca);

    let ledger: Arc<dyn Ledger> = match account_mode {
        AccountMode::Demo => {
            warn!("Demo account mode — position state lives in process memory only");
            Arc::new(MemoryLedger::new())
        }
        AccountMode::Live => {
            let base_url = std::env::var("LEDGER_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8200".to_string());
            let key_id = std::env::var("LEDGER_API_KEY").unwrap_or_default();
            let secret = std::env::var("LEDGER_API_SECRET").unwrap_or_default();
            Arc::new(RestLedgerClient::new(base_url, key_id, secret))
        }
    };

    let clock = Arc::new(SystemClock);
    let store = Arc::new(PositionStateStore::new(ledger, clock.clone(), levels_ttl_hours));
    let engine = Arc::new(TradingEngine::new(broker, store, clock, config.clone()));

    // ── 3. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config, engine.clone()));

    // ── 4. Start the API server ──────────────────────────────────────────
    let api_state = state.clone();
    let bind_addr =
        std::env::var("MERIDIAN_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    let bind_addr_clone = bind_addr.clone();

    tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let listener = tokio::net::TcpListener::bind(&bind_addr_clone)
            .await
            .expect("Failed to bind API server");
        info!(addr = %bind_addr_clone, "API server listening");
        axum::serve(listener, app)
            .await
            .expect("API server failed");
    });

    // ── 5. Scheduled exit-monitoring loop ────────────────────────────────
    // Each tick is a full stateless invocation with no candidate signals:
    // the exit sweep and reconciliation run, entries do not.
    let tick_state = state.clone();
    let tick_engine = engine.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(tick_interval_secs));
        loop {
            interval.tick().await;
            let report = tick_engine.run_invocation(Vec::new()).await;
            if let Some(sweep) = &report.sweep {
                for err in &sweep.errors {
                    tick_state.push_error(err.clone());
                }
            }
            tick_state.push_report(report);
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Meridian shut down complete.");
    Ok(())
}
