// =============================================================================
// Position manager — per-symbol position state
// =============================================================================
//
// In-memory position state keyed by symbol, updated on execution events and
// overwritten authoritatively by reconciliation. A reduce-only close fill
// transitions the symbol to flat. The manager also answers the policy
// question when a new entry signal meets an existing position: ignore
// (default), add, or flip.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::exchange::VenuePosition;
use crate::types::{Direction, PositionPolicy, PositionSide, Side};

/// What the engine should do with an accepted entry signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// No position: open normally.
    Open,
    /// Position already aligned or policy forbids stacking.
    Ignore,
    /// Add to the existing position.
    Add,
    /// Close the existing position, then open the opposite side.
    Flip,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionState {
    pub position_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub mark_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
    pub opened_at: String,
}

pub struct PositionManager {
    positions: RwLock<HashMap<String, PositionState>>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self {
            positions: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, symbol: &str) -> Option<PositionState> {
        self.positions.read().get(symbol).cloned()
    }

    pub fn all(&self) -> Vec<PositionState> {
        self.positions.read().values().cloned().collect()
    }

    /// Open a fresh local position; returns its id.
    pub fn open(
        &self,
        symbol: &str,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        leverage: f64,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let state = PositionState {
            position_id: id.clone(),
            symbol: symbol.to_string(),
            side,
            size,
            entry_price,
            leverage,
            mark_price: None,
            unrealized_pnl: None,
            opened_at: Utc::now().to_rfc3339(),
        };
        info!(symbol, %side, size, entry_price, leverage, position_id = %id, "position opened");
        self.positions.write().insert(symbol.to_string(), state);
        id
    }

    /// Apply a fill. Reduce-only fills shrink the position and flatten it
    /// when the remaining size reaches zero; entry fills grow it with a
    /// volume-weighted average entry.
    pub fn apply_fill(&self, symbol: &str, side: Side, qty: f64, price: f64, reduce_only: bool) {
        let mut map = self.positions.write();
        match map.get_mut(symbol) {
            Some(pos) if reduce_only || is_closing(pos.side, side) => {
                let remaining = (pos.size - qty).max(0.0);
                debug!(symbol, qty, remaining, "close fill applied");
                if remaining <= f64::EPSILON {
                    map.remove(symbol);
                    info!(symbol, "position flat");
                } else {
                    pos.size = remaining;
                }
            }
            Some(pos) => {
                // Adding to the same side: weighted average entry.
                let total = pos.size + qty;
                if total > 0.0 {
                    pos.entry_price = (pos.entry_price * pos.size + price * qty) / total;
                    pos.size = total;
                }
                debug!(symbol, qty, size = pos.size, entry = pos.entry_price, "entry fill applied");
            }
            None => {
                let side = match side {
                    Side::Buy => PositionSide::Long,
                    Side::Sell => PositionSide::Short,
                };
                drop(map);
                self.open(symbol, side, qty, price, 1.0);
            }
        }
    }

    /// Update the mark price and venue-supplied uPnL.
    pub fn update_mark(&self, symbol: &str, mark_price: f64, unrealized_pnl: Option<f64>) {
        if let Some(pos) = self.positions.write().get_mut(symbol) {
            pos.mark_price = Some(mark_price);
            if unrealized_pnl.is_some() {
                pos.unrealized_pnl = unrealized_pnl;
            }
        }
    }

    /// Reconciliation overwrite: venue state is authoritative.
    pub fn set_from_venue(&self, venue: &VenuePosition) -> String {
        let side = match venue.side.as_str() {
            "Buy" => PositionSide::Long,
            "Sell" => PositionSide::Short,
            _ => PositionSide::Flat,
        };
        let mut map = self.positions.write();
        if let Some(existing) = map.get_mut(&venue.symbol) {
            existing.side = side;
            existing.size = venue.size;
            existing.entry_price = venue.entry_price;
            existing.leverage = venue.leverage;
            existing.mark_price = venue.mark_price;
            existing.unrealized_pnl = venue.unrealised_pnl;
            existing.position_id.clone()
        } else {
            let id = Uuid::new_v4().to_string();
            map.insert(
                venue.symbol.clone(),
                PositionState {
                    position_id: id.clone(),
                    symbol: venue.symbol.clone(),
                    side,
                    size: venue.size,
                    entry_price: venue.entry_price,
                    leverage: venue.leverage,
                    mark_price: venue.mark_price,
                    unrealized_pnl: venue.unrealised_pnl,
                    opened_at: Utc::now().to_rfc3339(),
                },
            );
            id
        }
    }

    /// Reconciliation close: the venue says flat.
    pub fn close_local(&self, symbol: &str) {
        if self.positions.write().remove(symbol).is_some() {
            info!(symbol, "local position closed");
        }
    }

    /// Decide what to do with an accepted entry signal given the policy.
    pub fn on_new_signal(
        &self,
        symbol: &str,
        direction: Direction,
        policy: PositionPolicy,
    ) -> SignalAction {
        let Some(pos) = self.get(symbol) else {
            return SignalAction::Open;
        };

        let aligned = matches!(
            (pos.side, direction),
            (PositionSide::Long, Direction::Long) | (PositionSide::Short, Direction::Short)
        );

        match policy {
            PositionPolicy::Ignore => SignalAction::Ignore,
            PositionPolicy::Add if aligned => SignalAction::Add,
            PositionPolicy::Add => SignalAction::Ignore,
            PositionPolicy::Flip if aligned => SignalAction::Ignore,
            PositionPolicy::Flip => SignalAction::Flip,
        }
    }
}

fn is_closing(position_side: PositionSide, fill_side: Side) -> bool {
    matches!(
        (position_side, fill_side),
        (PositionSide::Long, Side::Sell) | (PositionSide::Short, Side::Buy)
    )
}

impl Default for PositionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionManager")
            .field("open_positions", &self.positions.read().len())
            .finish()
    }
}
