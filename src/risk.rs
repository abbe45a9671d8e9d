// =============================================================================
// Risk monitor — periodic checks against exchange state
// =============================================================================
//
// Runs on its own interval (default 30 s) and evaluates limits against what
// the VENUE reports, not local counters:
//
//   equity              = wallet balance + unrealized PnL
//   daily realized PnL  = sum of (closed_pnl - exec_fee) over today's fills
//   notional & leverage = from the venue position list
//   open-order count    = per symbol
//
// Verdicts: Allow (normal), Deny (block new trades), Stop (critical breach —
// trips the kill switch synchronously). Severity escalation: crossing the
// daily-loss limit is a Deny; crossing 1.5x the limit is a Stop.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::EngineResult;
use crate::exchange::BybitClient;
use crate::kill_switch::KillSwitch;

/// Limits sourced from config.
#[derive(Debug, Clone, Copy)]
pub struct RiskLimits {
    /// Max daily realized loss as percent of equity.
    pub max_daily_loss_pct: f64,
    pub max_leverage: f64,
    pub max_open_orders: u32,
    /// Max drawdown from today's peak equity, percent.
    pub max_drawdown_pct: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_daily_loss_pct: 3.0,
            max_leverage: 5.0,
            max_open_orders: 10,
            max_drawdown_pct: 10.0,
        }
    }
}

/// Outcome of one risk cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RiskVerdict {
    Allow,
    Deny(String),
    Stop(String),
}

impl RiskVerdict {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny(_) => "deny",
            Self::Stop(_) => "stop",
        }
    }
}

/// Structured snapshot of the last cycle, for the status surface.
#[derive(Debug, Clone, Serialize)]
pub struct RiskSnapshot {
    pub verdict: String,
    pub reason: Option<String>,
    pub equity: f64,
    pub daily_realized_pnl: f64,
    pub leverage: f64,
    pub open_orders: u32,
    pub peak_equity_today: f64,
    pub checked_at: String,
}

pub struct RiskMonitor {
    client: Arc<BybitClient>,
    kill_switch: Arc<KillSwitch>,
    symbol: String,
    limits: RiskLimits,
    /// Intra-day peak equity for drawdown tracking, reset on date roll.
    peak_equity: RwLock<(String, f64)>,
    last_snapshot: RwLock<Option<RiskSnapshot>>,
}

impl RiskMonitor {
    pub fn new(
        client: Arc<BybitClient>,
        kill_switch: Arc<KillSwitch>,
        symbol: &str,
        limits: RiskLimits,
    ) -> Self {
        Self {
            client,
            kill_switch,
            symbol: symbol.to_string(),
            limits,
            peak_equity: RwLock::new((today(), 0.0)),
            last_snapshot: RwLock::new(None),
        }
    }

    pub fn last_snapshot(&self) -> Option<RiskSnapshot> {
        self.last_snapshot.read().clone()
    }

    /// Run one check against the venue. A `Stop` verdict activates the kill
    /// switch before returning.
    pub async fn check(&self) -> EngineResult<RiskVerdict> {
        let wallet = self.client.get_wallet().await?;
        let positions = self.client.get_positions(&self.symbol).await?;
        let open_orders = self.client.get_open_orders(&self.symbol).await?;
        let executions = self.client.get_executions(&self.symbol, 100).await?;

        let equity = wallet.equity;

        // Today's realized PnL from venue executions.
        let midnight_ms = Utc::now()
            .date_naive()
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().timestamp_millis())
            .unwrap_or(0);
        let daily_realized: f64 = executions
            .iter()
            .filter(|e| e.exec_time >= midnight_ms)
            .map(|e| e.closed_pnl - e.fee)
            .sum();

        let leverage = positions.iter().map(|p| p.leverage).fold(0.0, f64::max);
        let open_count = open_orders
            .iter()
            .filter(|o| matches!(o.status.as_str(), "New" | "PartiallyFilled" | "Untriggered"))
            .count() as u32;

        // Track peak equity, resetting when the date rolls over.
        let peak = {
            let mut guard = self.peak_equity.write();
            let today = today();
            if guard.0 != today {
                info!(old_date = %guard.0, new_date = %today, "date rolled — resetting peak equity");
                *guard = (today, equity);
            } else if equity > guard.1 {
                guard.1 = equity;
            }
            guard.1
        };

        let verdict = self.evaluate(equity, daily_realized, leverage, open_count, peak);

        let snapshot = RiskSnapshot {
            verdict: verdict.code().to_string(),
            reason: match &verdict {
                RiskVerdict::Allow => None,
                RiskVerdict::Deny(r) | RiskVerdict::Stop(r) => Some(r.clone()),
            },
            equity,
            daily_realized_pnl: daily_realized,
            leverage,
            open_orders: open_count,
            peak_equity_today: peak,
            checked_at: Utc::now().to_rfc3339(),
        };
        debug!(
            symbol = %self.symbol,
            verdict = snapshot.verdict,
            equity,
            daily_realized,
            leverage,
            open_orders = open_count,
            "risk cycle complete"
        );
        *self.last_snapshot.write() = Some(snapshot);

        if let RiskVerdict::Stop(reason) = &verdict {
            self.kill_switch.activate(reason);
        }
        Ok(verdict)
    }

    /// Pure limit evaluation, separated for testing.
    fn evaluate(
        &self,
        equity: f64,
        daily_realized: f64,
        leverage: f64,
        open_orders: u32,
        peak_equity: f64,
    ) -> RiskVerdict {
        let l = &self.limits;

        if equity > 0.0 && daily_realized < 0.0 {
            let loss_pct = -daily_realized / equity * 100.0;
            // Severity escalation: 1.5x the daily limit is critical.
            if loss_pct >= l.max_daily_loss_pct * 1.5 {
                return RiskVerdict::Stop(format!(
                    "daily loss {loss_pct:.2}% >= {:.2}% (1.5x limit)",
                    l.max_daily_loss_pct * 1.5
                ));
            }
            if loss_pct >= l.max_daily_loss_pct {
                return RiskVerdict::Deny(format!(
                    "daily loss {loss_pct:.2}% >= {:.2}% limit",
                    l.max_daily_loss_pct
                ));
            }
        }

        if leverage > l.max_leverage * 2.0 {
            return RiskVerdict::Stop(format!(
                "leverage {leverage:.1}x > 2x limit ({:.1}x)",
                l.max_leverage
            ));
        }
        if leverage > l.max_leverage {
            return RiskVerdict::Deny(format!(
                "leverage {leverage:.1}x > {:.1}x limit",
                l.max_leverage
            ));
        }

        if peak_equity > 0.0 && equity < peak_equity {
            let drawdown_pct = (peak_equity - equity) / peak_equity * 100.0;
            if drawdown_pct >= l.max_drawdown_pct * 0.8 {
                return RiskVerdict::Stop(format!(
                    "drawdown {drawdown_pct:.2}% >= 80% of the {:.2}% cap",
                    l.max_drawdown_pct
                ));
            }
        }

        if open_orders >= l.max_open_orders {
            return RiskVerdict::Deny(format!(
                "open orders {open_orders} >= {} cap",
                l.max_open_orders
            ));
        }

        RiskVerdict::Allow
    }

    /// Background loop: check every `interval_secs` until `stop` is set.
    pub async fn run(self: Arc<Self>, interval_secs: u64, stop: Arc<AtomicBool>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        info!(symbol = %self.symbol, interval_secs, "risk monitor started");
        loop {
            interval.tick().await;
            if stop.load(Ordering::Relaxed) {
                info!(symbol = %self.symbol, "risk monitor stopping");
                return;
            }
            match self.check().await {
                Ok(RiskVerdict::Allow) => {}
                Ok(v) => warn!(symbol = %self.symbol, verdict = v.code(), "risk verdict"),
                Err(e) => warn!(symbol = %self.symbol, error = %e, "risk cycle failed"),
            }
        }
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn monitor(limits: RiskLimits) -> RiskMonitor {
        let client = Arc::new(BybitClient::new("k", "s", true));
        let ks = Arc::new(KillSwitch::new(Arc::new(Store::open_in_memory().unwrap())));
        RiskMonitor::new(client, ks, "BTCUSDT", limits)
    }

    #[test]
    fn allow_under_normal_conditions() {
        let m = monitor(RiskLimits::default());
        assert_eq!(
            m.evaluate(10_000.0, -100.0, 3.0, 2, 10_000.0),
            RiskVerdict::Allow
        );
    }

    #[test]
    fn daily_loss_deny_then_stop() {
        let m = monitor(RiskLimits::default());
        // 3% of 10k = 300: deny at the limit.
        match m.evaluate(10_000.0, -320.0, 1.0, 0, 10_000.0) {
            RiskVerdict::Deny(r) => assert!(r.contains("daily loss")),
            other => panic!("expected deny, got {other:?}"),
        }
        // 1.5x escalation: 450+ is a stop.
        match m.evaluate(10_000.0, -480.0, 1.0, 0, 10_000.0) {
            RiskVerdict::Stop(r) => assert!(r.contains("daily loss")),
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn leverage_breaches() {
        let m = monitor(RiskLimits::default());
        match m.evaluate(10_000.0, 0.0, 7.0, 0, 10_000.0) {
            RiskVerdict::Deny(r) => assert!(r.contains("leverage")),
            other => panic!("expected deny, got {other:?}"),
        }
        match m.evaluate(10_000.0, 0.0, 11.0, 0, 10_000.0) {
            RiskVerdict::Stop(r) => assert!(r.contains("leverage")),
            other => panic!("expected stop, got {other:?}"),
        }
    }

    #[test]
    fn drawdown_stop_at_80_pct_of_cap() {
        let m = monitor(RiskLimits::default());
        // Cap 10%, 80% of cap = 8%. Peak 10k, equity 9.1k = 9% drawdown.
        match m.evaluate(9_100.0, 0.0, 1.0, 0, 10_000.0) {
            RiskVerdict::Stop(r) => assert!(r.contains("drawdown")),
            other => panic!("expected stop, got {other:?}"),
        }
        // 5% drawdown passes.
        assert_eq!(
            m.evaluate(9_500.0, 0.0, 1.0, 0, 10_000.0),
            RiskVerdict::Allow
        );
    }

    #[test]
    fn open_order_cap_denies() {
        let m = monitor(RiskLimits::default());
        match m.evaluate(10_000.0, 0.0, 1.0, 10, 10_000.0) {
            RiskVerdict::Deny(r) => assert!(r.contains("open orders")),
            other => panic!("expected deny, got {other:?}"),
        }
    }

    #[test]
    fn verdict_codes() {
        assert_eq!(RiskVerdict::Allow.code(), "allow");
        assert_eq!(RiskVerdict::Deny("x".into()).code(), "deny");
        assert_eq!(RiskVerdict::Stop("x".into()).code(), "stop");
    }
}
