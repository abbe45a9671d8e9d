// =============================================================================
// Instrument registry + price/quantity normalizer
// =============================================================================
//
// Venue metadata per symbol: tick size, quantity step, min/max order qty,
// minimum notional. Loaded once at startup and refreshed rarely. Every price
// and quantity that leaves the engine passes through `round_price` /
// `round_qty` first; orders failing min-notional or step constraints are
// rejected locally and never reach the venue.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::errors::{EngineError, EngineResult};

/// Per-symbol contract metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub tick_size: f64,
    pub qty_step: f64,
    pub min_order_qty: f64,
    pub max_order_qty: f64,
    pub min_notional: f64,
}

impl Instrument {
    /// Round a raw price to the nearest tick.
    pub fn round_price(&self, raw: f64) -> f64 {
        if self.tick_size <= 0.0 {
            return raw;
        }
        (raw / self.tick_size).round() * self.tick_size
    }

    /// Floor a raw quantity to the step grid. Flooring is the safe direction:
    /// it can only shrink exposure, never exceed it.
    pub fn round_qty(&self, raw: f64) -> f64 {
        if self.qty_step <= 0.0 {
            return raw;
        }
        // The epsilon protects values already sitting exactly on the grid
        // from being floored one step down by float noise.
        ((raw / self.qty_step) + 1e-9).floor() * self.qty_step
    }

    /// Validate a normalized (price, qty) pair against the contract limits.
    pub fn validate(&self, price: f64, qty: f64) -> EngineResult<()> {
        if !qty.is_finite() || qty <= 0.0 || qty < self.min_order_qty {
            return Err(EngineError::InvalidSize(format!(
                "{}: qty {} below min {}",
                self.symbol, qty, self.min_order_qty
            )));
        }
        if qty > self.max_order_qty {
            return Err(EngineError::InvalidSize(format!(
                "{}: qty {} above max {}",
                self.symbol, qty, self.max_order_qty
            )));
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::InvalidPrice(format!(
                "{}: price {} not positive",
                self.symbol, price
            )));
        }
        if qty * price < self.min_notional {
            return Err(EngineError::MinNotional(format!(
                "{}: notional {:.4} below min {}",
                self.symbol,
                qty * price,
                self.min_notional
            )));
        }
        Ok(())
    }
}

/// Thread-safe, read-mostly registry shared across all symbol bots.
pub struct InstrumentRegistry {
    instruments: RwLock<HashMap<String, Instrument>>,
}

impl InstrumentRegistry {
    pub fn new() -> Self {
        Self {
            instruments: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, instrument: Instrument) {
        info!(
            symbol = %instrument.symbol,
            tick_size = instrument.tick_size,
            qty_step = instrument.qty_step,
            min_notional = instrument.min_notional,
            "instrument registered"
        );
        self.instruments
            .write()
            .insert(instrument.symbol.clone(), instrument);
    }

    pub fn get(&self, symbol: &str) -> EngineResult<Instrument> {
        self.instruments
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| EngineError::MissingInstrument(symbol.to_string()))
    }

    pub fn len(&self) -> usize {
        self.instruments.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.read().is_empty()
    }
}

impl Default for InstrumentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn btc() -> Instrument {
        Instrument {
            symbol: "BTCUSDT".into(),
            tick_size: 0.1,
            qty_step: 0.001,
            min_order_qty: 0.001,
            max_order_qty: 100.0,
            min_notional: 5.0,
        }
    }

    #[test]
    fn price_rounds_to_tick() {
        let inst = btc();
        assert!((inst.round_price(50000.04) - 50000.0).abs() < 1e-9);
        assert!((inst.round_price(50000.06) - 50000.1).abs() < 1e-9);
    }

    #[test]
    fn qty_floors_to_step() {
        let inst = btc();
        assert!((inst.round_qty(0.0129) - 0.012).abs() < 1e-9);
        // Values already on the grid stay put.
        assert!((inst.round_qty(0.010) - 0.010).abs() < 1e-9);
    }

    #[test]
    fn normalization_is_idempotent() {
        let inst = btc();
        for raw in [50000.04, 49999.96, 0.1234, 12345.678] {
            let once = inst.round_price(raw);
            assert!((inst.round_price(once) - once).abs() < 1e-9);
        }
        for raw in [0.0129, 0.5555, 1.0, 0.001] {
            let once = inst.round_qty(raw);
            assert!((inst.round_qty(once) - once).abs() < 1e-9);
        }
    }

    #[test]
    fn validate_rejects_min_notional() {
        let inst = btc();
        let err = inst.validate(50000.0, 0.00009);
        assert!(err.is_err());
        // 0.001 * 1000 = 1.0 < 5.0 min notional
        let err = inst.validate(1000.0, 0.001).unwrap_err();
        assert_eq!(err.kind(), "min_notional");
        assert!(inst.validate(50000.0, 0.001).is_ok());
    }

    #[test]
    fn registry_missing_symbol() {
        let reg = InstrumentRegistry::new();
        let err = reg.get("NOPEUSDT").unwrap_err();
        assert_eq!(err.kind(), "missing_instrument");
        reg.insert(btc());
        assert!(reg.get("BTCUSDT").is_ok());
        assert_eq!(reg.len(), 1);
    }
}
