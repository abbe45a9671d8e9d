// =============================================================================
// Vela Perps Engine — Main Entry Point
// =============================================================================
//
// Starts in dry-run mode against testnet unless the config and VELA_ENV say
// otherwise. Trading refuses to begin while the kill switch is latched.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod bot;
mod config;
mod errors;
mod exchange;
mod execution;
mod features;
mod indicators;
mod instruments;
mod kill_switch;
mod market_data;
mod meta;
mod orchestrator;
mod positions;
mod reconcile;
mod risk;
mod store;
mod strategy;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::EngineContext;
use crate::config::ConfigManager;
use crate::exchange::BybitClient;
use crate::instruments::InstrumentRegistry;
use crate::kill_switch::KillSwitch;
use crate::orchestrator::MultiSymbolOrchestrator;
use crate::store::Store;

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
    info!("║        Vela Perps Engine — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("VELA_CONFIG").unwrap_or_else(|_| "vela_config.json".to_string());
    let cfg = Arc::new(ConfigManager::load(&config_path));

    // Override symbols from env if set.
    if let Ok(syms) = std::env::var("VELA_SYMBOLS") {
        let list: Vec<String> = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
        if !list.is_empty() {
            cfg.set("symbols", serde_json::json!(list));
        }
    }

    let environment = cfg.environment();
    info!(
        %environment,
        testnet = cfg.is_testnet(),
        symbols = ?cfg.string_list("symbols"),
        run_mode = %cfg.string("engine.run_mode", "dry_run"),
        "configuration resolved"
    );

    // ── 2. Persistent store + kill switch ────────────────────────────────
    let store_path = std::env::var("VELA_STORE")
        .unwrap_or_else(|_| cfg.string("store.path", "vela.db"));
    let store = Arc::new(Store::open(&store_path)?);
    info!(path = %store_path, "store opened (WAL)");

    let kill_switch = Arc::new(KillSwitch::new(store.clone()));
    if let Some(reason) = kill_switch.active_reason() {
        warn!(%reason, "kill switch is latched — trading will refuse to start until reset");
    }

    // ── 3. Exchange client + instrument registry ─────────────────────────
    let api_key = std::env::var("VELA_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("VELA_API_SECRET").unwrap_or_default();
    let client = Arc::new(BybitClient::new(api_key, api_secret, cfg.is_testnet()));

    let registry = Arc::new(InstrumentRegistry::new());
    for symbol in cfg.string_list("symbols") {
        match client.get_instrument(&symbol).await {
            Ok(instrument) => {
                if let Err(e) = store.upsert_instrument(&instrument) {
                    warn!(symbol = %symbol, error = %e, "failed to cache instrument");
                }
                registry.insert(instrument);
            }
            Err(e) => {
                // Fall back to the cached metadata from a previous run.
                warn!(symbol = %symbol, error = %e, "failed to load instrument metadata");
                if let Ok(Some(cached)) = store.get_instrument(&symbol) {
                    info!(symbol = %symbol, "using cached instrument metadata");
                    registry.insert(cached);
                }
            }
        }
    }
    info!(count = registry.len(), "instrument registry loaded");

    // ── 4. Orchestrator ──────────────────────────────────────────────────
    let orchestrator = Arc::new(MultiSymbolOrchestrator::new(
        cfg.clone(),
        client.clone(),
        store.clone(),
        registry.clone(),
        kill_switch.clone(),
    ));

    // ── 5. Control-surface API ───────────────────────────────────────────
    let ctx = Arc::new(EngineContext {
        cfg: cfg.clone(),
        store: store.clone(),
        kill_switch: kill_switch.clone(),
        orchestrator: orchestrator.clone(),
    });
    let bind_addr = std::env::var("VELA_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".into());
    {
        let bind_addr = bind_addr.clone();
        tokio::spawn(async move {
            let app = api::router(ctx);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .expect("failed to bind API server");
            info!(addr = %bind_addr, "API server listening");
            axum::serve(listener, app).await.expect("API server failed");
        });
    }

    // ── 6. Start trading (unless the gate refuses) ───────────────────────
    if cfg.bool("engine.autostart", true) {
        match orchestrator.start().await {
            Ok(()) => info!("trading bots running"),
            Err(e) => error!(error = %e, kind = e.kind(), "trading refused to start"),
        }
    } else {
        info!("autostart disabled — waiting for /api/v1/start");
    }

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 7. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    orchestrator.stop().await;

    if let Err(e) = cfg.save() {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("Vela Perps Engine shut down complete.");
    Ok(())
}
