// =============================================================================
// Orderbook snapshots — validity checks, spread, depth imbalance
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One price level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Full snapshot: bids sorted descending, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub ts: i64,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn mid(&self) -> Option<f64> {
        Some((self.best_bid()? + self.best_ask()?) / 2.0)
    }

    /// Bid/ask spread as a percentage of the mid price.
    pub fn spread_pct(&self) -> Option<f64> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        let mid = (bid + ask) / 2.0;
        if mid > 0.0 {
            Some((ask - bid) / mid * 100.0)
        } else {
            None
        }
    }

    /// Depth imbalance over the top `levels`: (bid_vol - ask_vol) / total,
    /// in [-1, 1]. Positive = bid-heavy.
    pub fn depth_imbalance(&self, levels: usize) -> Option<f64> {
        if self.bids.is_empty() || self.asks.is_empty() {
            return None;
        }
        let bid_vol: f64 = self.bids.iter().take(levels).map(|l| l.size).sum();
        let ask_vol: f64 = self.asks.iter().take(levels).map(|l| l.size).sum();
        let total = bid_vol + ask_vol;
        if total > 0.0 {
            Some((bid_vol - ask_vol) / total)
        } else {
            None
        }
    }

    /// Structural validity: both sides present, sorted correctly, crossed
    /// books rejected, and best-of-book within `max_deviation_pct` of the
    /// last trade when one is known.
    pub fn is_valid(&self, last_trade: Option<f64>, max_deviation_pct: f64) -> bool {
        let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) else {
            return false;
        };
        if bid >= ask || bid <= 0.0 {
            return false;
        }
        if !self.bids.windows(2).all(|w| w[0].price >= w[1].price) {
            return false;
        }
        if !self.asks.windows(2).all(|w| w[0].price <= w[1].price) {
            return false;
        }
        if let Some(trade) = last_trade {
            if trade > 0.0 {
                let dev_bid = ((bid - trade) / trade).abs() * 100.0;
                let dev_ask = ((ask - trade) / trade).abs() * 100.0;
                if dev_bid.min(dev_ask) > max_deviation_pct {
                    return false;
                }
            }
        }
        true
    }
}

/// Latest snapshot per symbol, shared across tasks.
pub struct OrderBookManager {
    books: RwLock<HashMap<String, OrderBookSnapshot>>,
}

impl OrderBookManager {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    pub fn update(&self, snapshot: OrderBookSnapshot) {
        self.books
            .write()
            .insert(snapshot.symbol.clone(), snapshot);
    }

    pub fn get(&self, symbol: &str) -> Option<OrderBookSnapshot> {
        self.books.read().get(symbol).cloned()
    }

    pub fn spread_pct(&self, symbol: &str) -> Option<f64> {
        self.books.read().get(symbol).and_then(|b| b.spread_pct())
    }

    pub fn imbalance(&self, symbol: &str, levels: usize) -> Option<f64> {
        self.books
            .read()
            .get(symbol)
            .and_then(|b| b.depth_imbalance(levels))
    }
}

impl Default for OrderBookManager {
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

    fn book(bids: &[(f64, f64)], asks: &[(f64, f64)]) -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "BTCUSDT".into(),
            bids: bids
                .iter()
                .map(|&(price, size)| BookLevel { price, size })
                .collect(),
            asks: asks
                .iter()
                .map(|&(price, size)| BookLevel { price, size })
                .collect(),
            ts: 0,
        }
    }

    #[test]
    fn spread_and_mid() {
        let b = book(&[(99.0, 1.0)], &[(101.0, 1.0)]);
        assert_eq!(b.mid(), Some(100.0));
        assert!((b.spread_pct().unwrap() - 2.0).abs() < 1e-9);
    }

    #[test]
    fn crossed_book_invalid() {
        let b = book(&[(101.0, 1.0)], &[(100.0, 1.0)]);
        assert!(!b.is_valid(None, 1.0));
    }

    #[test]
    fn sorted_book_valid() {
        let b = book(&[(100.0, 1.0), (99.5, 2.0)], &[(100.5, 1.0), (101.0, 2.0)]);
        assert!(b.is_valid(Some(100.2), 1.0));
    }

    #[test]
    fn wrong_sort_order_invalid() {
        let b = book(&[(99.5, 1.0), (100.0, 2.0)], &[(100.5, 1.0)]);
        assert!(!b.is_valid(None, 1.0));
    }

    #[test]
    fn deviation_from_last_trade_invalid() {
        let b = book(&[(100.0, 1.0)], &[(100.1, 1.0)]);
        // Last trade far away from book.
        assert!(!b.is_valid(Some(110.0), 1.0));
        assert!(b.is_valid(Some(100.05), 1.0));
    }

    #[test]
    fn imbalance_sign() {
        let heavy_bid = book(&[(100.0, 9.0)], &[(100.1, 1.0)]);
        assert!(heavy_bid.depth_imbalance(5).unwrap() > 0.5);
        let heavy_ask = book(&[(100.0, 1.0)], &[(100.1, 9.0)]);
        assert!(heavy_ask.depth_imbalance(5).unwrap() < -0.5);
    }
}
