// =============================================================================
// Kill switch — persistent trading latch
// =============================================================================
//
// Two persistent signals participate:
//   (a) the `trading_disabled` flag in the store's config table, and
//   (b) append-only `kill_switch_activated` rows in the errors table.
//
// BOTH must be clear before trading may start. Activation sets both; reset
// clears both atomically and requires the explicit confirmation token. The
// engine checks the gate at startup and on every tick.
// =============================================================================

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::store::Store;

/// Token a caller must present to reset the switch.
pub const RESET_TOKEN: &str = "CONFIRM-RESET";

pub struct KillSwitch {
    store: Arc<Store>,
}

impl KillSwitch {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// True while the flag is set OR any unreset activation row exists.
    pub fn is_active(&self) -> bool {
        let flag = self
            .store
            .config_get("trading_disabled")
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(false);
        let rows = self.store.unreset_kill_rows().unwrap_or(0);
        flag || rows > 0
    }

    /// Human-readable gating condition, for the refuse-to-start log line.
    pub fn active_reason(&self) -> Option<String> {
        let flag = self
            .store
            .config_get("trading_disabled")
            .ok()
            .flatten()
            .map(|v| v == "true")
            .unwrap_or(false);
        let rows = self.store.unreset_kill_rows().unwrap_or(0);
        match (flag, rows) {
            (false, 0) => None,
            (true, 0) => Some("trading_disabled=true".to_string()),
            (false, n) => Some(format!("{n} unreset kill_switch_activated row(s)")),
            (true, n) => Some(format!(
                "trading_disabled=true and {n} unreset kill_switch_activated row(s)"
            )),
        }
    }

    /// Trip the switch: append an activation row and set the flag. Both
    /// writes are persistent so the latch survives restarts.
    pub fn activate(&self, reason: &str) {
        error!(reason, "KILL SWITCH ACTIVATED — trading halted");
        if let Err(e) = self.store.log_error("kill_switch_activated", reason) {
            error!(error = %e, "failed to persist kill-switch activation row");
        }
        if let Err(e) = self.store.config_set("trading_disabled", "true") {
            error!(error = %e, "failed to persist trading_disabled flag");
        }
    }

    /// Reset with an explicit confirmation token. Clears the flag and every
    /// open activation row in one transaction.
    pub fn reset(&self, token: &str) -> EngineResult<()> {
        if token != RESET_TOKEN {
            warn!("kill-switch reset rejected: bad confirmation token");
            return Err(EngineError::KillSwitchActive(
                "reset requires the confirmation token".to_string(),
            ));
        }
        self.store.clear_kill_switch()?;
        info!("kill switch reset — trading re-enabled");
        Ok(())
    }

    /// Gate used by order paths: error when the switch is active.
    pub fn guard(&self) -> EngineResult<()> {
        match self.active_reason() {
            None => Ok(()),
            Some(reason) => {
                if reason.starts_with("trading_disabled") {
                    Err(EngineError::TradingDisabled)
                } else {
                    Err(EngineError::KillSwitchActive(reason))
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn fresh() -> KillSwitch {
        KillSwitch::new(Arc::new(Store::open_in_memory().unwrap()))
    }

    #[test]
    fn inactive_by_default() {
        let ks = fresh();
        assert!(!ks.is_active());
        assert!(ks.guard().is_ok());
        assert!(ks.active_reason().is_none());
    }

    #[test]
    fn activation_sets_both_signals() {
        let ks = fresh();
        ks.activate("daily loss breached");
        assert!(ks.is_active());
        let reason = ks.active_reason().unwrap();
        assert!(reason.contains("trading_disabled=true"));
        assert!(reason.contains("kill_switch_activated"));
        assert_eq!(ks.guard().unwrap_err().kind(), "trading_disabled");
    }

    #[test]
    fn flag_alone_blocks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.config_set("trading_disabled", "true").unwrap();
        let ks = KillSwitch::new(store);
        assert!(ks.is_active());
        assert_eq!(ks.active_reason().unwrap(), "trading_disabled=true");
    }

    #[test]
    fn row_alone_blocks() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store
            .log_error("kill_switch_activated", "external stop")
            .unwrap();
        let ks = KillSwitch::new(store);
        assert!(ks.is_active());
        assert_eq!(ks.guard().unwrap_err().kind(), "kill_switch_active");
    }

    #[test]
    fn reset_requires_token_and_clears_both() {
        let ks = fresh();
        ks.activate("test");
        assert!(ks.reset("nope").is_err());
        assert!(ks.is_active());
        ks.reset(RESET_TOKEN).unwrap();
        assert!(!ks.is_active());
        assert!(ks.guard().is_ok());
    }
}
