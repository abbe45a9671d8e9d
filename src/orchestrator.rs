// =============================================================================
// Multi-symbol orchestrator — one isolated bot per symbol
// =============================================================================
//
// For every configured symbol the orchestrator builds a FRESH strategy list
// through the factory (distinct object identities — never shared), a fresh
// TradingBot bound to that symbol and the shared config/store/client, and
// runs it in its own task. A health monitor polls bot status. Stopping
// signals every bot and joins each with a bounded timeout.
// =============================================================================

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bot::{BotStatus, TradingBot};
use crate::config::ConfigManager;
use crate::errors::EngineResult;
use crate::exchange::BybitClient;
use crate::instruments::InstrumentRegistry;
use crate::kill_switch::KillSwitch;
use crate::store::Store;
use crate::strategy::StrategyFactory;

/// Per-bot join timeout on shutdown.
const STOP_TIMEOUT_SECS: u64 = 5;

pub struct MultiSymbolOrchestrator {
    cfg: Arc<ConfigManager>,
    client: Arc<BybitClient>,
    store: Arc<Store>,
    registry: Arc<InstrumentRegistry>,
    kill_switch: Arc<KillSwitch>,
    bots: Mutex<Vec<Arc<TradingBot>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MultiSymbolOrchestrator {
    pub fn new(
        cfg: Arc<ConfigManager>,
        client: Arc<BybitClient>,
        store: Arc<Store>,
        registry: Arc<InstrumentRegistry>,
        kill_switch: Arc<KillSwitch>,
    ) -> Self {
        Self {
            cfg,
            client,
            store,
            registry,
            kill_switch,
            bots: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Build the per-symbol bots without starting them. Each bot gets its
    /// own strategy instances from the factory.
    pub fn build_bots(&self) -> Vec<Arc<TradingBot>> {
        let symbols = self.cfg.string_list("symbols");
        let mut bots = Vec::with_capacity(symbols.len());
        for symbol in &symbols {
            let strategies = StrategyFactory::build_for_symbol(&self.cfg, symbol);
            let bot = TradingBot::new(
                symbol,
                self.cfg.clone(),
                self.client.clone(),
                self.store.clone(),
                self.registry.clone(),
                self.kill_switch.clone(),
                strategies,
            );
            bots.push(bot);
        }
        *self.bots.lock() = bots.clone();
        info!(count = bots.len(), symbols = ?symbols, "bots constructed");
        bots
    }

    /// Start every bot. A bot that refuses its gates (kill switch, initial
    /// risk stop) aborts the whole startup — a safety latch must never be
    /// partially honored.
    pub async fn start(&self) -> EngineResult<()> {
        let bots = self.build_bots();
        let mut handles = Vec::new();

        for bot in &bots {
            let bg = bot.start().await?;
            handles.extend(bg);
            handles.push(tokio::spawn(bot.clone().run()));
        }

        // Health monitor.
        let monitor_bots: Vec<Arc<TradingBot>> = bots.clone();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                interval.tick().await;
                let mut alive = 0usize;
                for bot in &monitor_bots {
                    let status = bot.status();
                    if status.running {
                        alive += 1;
                    } else {
                        warn!(symbol = %status.symbol, "bot is not running");
                    }
                }
                if alive == 0 {
                    info!("health monitor: no bots running, exiting");
                    return;
                }
                info!(alive, total = monitor_bots.len(), "health check");
            }
        }));

        *self.handles.lock() = handles;
        info!(count = bots.len(), "orchestrator started");
        Ok(())
    }

    /// Signal every bot, then join each task with a bounded timeout.
    /// Tasks that outlive the timeout are abandoned.
    pub async fn stop(&self) {
        for bot in self.bots.lock().iter() {
            bot.stop();
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().drain(..).collect();
        for handle in handles {
            match tokio::time::timeout(
                std::time::Duration::from_secs(STOP_TIMEOUT_SECS),
                handle,
            )
            .await
            {
                Ok(_) => {}
                Err(_) => {
                    warn!("task did not stop within {STOP_TIMEOUT_SECS}s — abandoning");
                }
            }
        }
        info!("orchestrator stopped");
    }

    pub fn status(&self) -> Vec<BotStatus> {
        self.bots.lock().iter().map(|b| b.status()).collect()
    }

    pub fn bot_for(&self, symbol: &str) -> Option<Arc<TradingBot>> {
        self.bots
            .lock()
            .iter()
            .find(|b| b.symbol == symbol)
            .cloned()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::Instrument;
    use serde_json::json;

    fn orchestrator(symbols: &[&str]) -> MultiSymbolOrchestrator {
        let cfg = Arc::new(ConfigManager::in_memory());
        cfg.set("symbols", json!(symbols));
        let client = Arc::new(BybitClient::new("k", "s", true));
        let store = Arc::new(Store::open_in_memory().unwrap());
        let registry = Arc::new(InstrumentRegistry::new());
        for s in symbols {
            registry.insert(Instrument {
                symbol: s.to_string(),
                tick_size: 0.1,
                qty_step: 0.001,
                min_order_qty: 0.001,
                max_order_qty: 100.0,
                min_notional: 5.0,
            });
        }
        let kill_switch = Arc::new(KillSwitch::new(store.clone()));
        MultiSymbolOrchestrator::new(cfg, client, store, registry, kill_switch)
    }

    #[test]
    fn one_bot_per_symbol() {
        let orch = orchestrator(&["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
        let bots = orch.build_bots();
        assert_eq!(bots.len(), 3);
        let symbols: Vec<&str> = bots.iter().map(|b| b.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
    }

    #[test]
    fn bots_are_distinct_instances() {
        let orch = orchestrator(&["BTCUSDT", "ETHUSDT"]);
        let bots = orch.build_bots();
        let a = Arc::as_ptr(&bots[0]);
        let b = Arc::as_ptr(&bots[1]);
        assert_ne!(a, b);
    }

    #[test]
    fn status_covers_every_bot() {
        let orch = orchestrator(&["BTCUSDT", "ETHUSDT"]);
        orch.build_bots();
        let statuses = orch.status();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.iter().all(|s| !s.running));
        assert!(orch.bot_for("ETHUSDT").is_some());
        assert!(orch.bot_for("XRPUSDT").is_none());
    }

    #[tokio::test]
    async fn stop_joins_cleanly_with_no_bots() {
        let orch = orchestrator(&[]);
        orch.build_bots();
        orch.stop().await;
        assert!(orch.status().is_empty());
    }
}
