// =============================================================================
// Candle buffer — thread-safe rolling windows of closed bars
// =============================================================================
//
// Stores the most recent candles per (symbol, timeframe). Strategies only
// ever see closed bars; the live in-progress candle is kept separately and
// replaced in place as updates arrive. When a candle closes it becomes
// permanent and the ring is trimmed to `max_candles`.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A single OHLCV bar.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub close_time: i64,
    pub interval: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

impl Candle {
    /// OHLC sanity: high >= max(open, close) >= min(open, close) >= low and
    /// volume >= 0.
    pub fn is_valid(&self) -> bool {
        let body_hi = self.open.max(self.close);
        let body_lo = self.open.min(self.close);
        self.high >= body_hi && body_lo >= self.low && self.volume >= 0.0
    }
}

/// Composite key identifying a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: String,
}

impl CandleKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

/// Thread-safe ring buffer per (symbol, interval).
pub struct CandleBuffer {
    buffers: RwLock<HashMap<CandleKey, VecDeque<Candle>>>,
    max_candles: usize,
}

impl CandleBuffer {
    pub fn new(max_candles: usize) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            max_candles,
        }
    }

    /// Insert or replace the latest candle for the given key.
    ///
    /// A closed candle replaces any in-progress version of itself and trims
    /// the ring. An in-progress candle replaces the previous in-progress
    /// update with the same `open_time`.
    pub fn update(&self, key: CandleKey, candle: Candle) {
        let mut map = self.buffers.write();
        let ring = map
            .entry(key)
            .or_insert_with(|| VecDeque::with_capacity(self.max_candles + 1));

        if let Some(last) = ring.back() {
            if !last.is_closed && last.open_time == candle.open_time {
                ring.pop_back();
            }
        }
        ring.push_back(candle);

        while ring.iter().filter(|c| c.is_closed).count() > self.max_candles {
            ring.pop_front();
        }
    }

    /// Replace the whole series with a REST snapshot (closed bars only).
    pub fn replace_closed(&self, key: CandleKey, candles: Vec<Candle>) {
        let mut ring: VecDeque<Candle> =
            candles.into_iter().filter(|c| c.is_closed).collect();
        while ring.len() > self.max_candles {
            ring.pop_front();
        }
        self.buffers.write().insert(key, ring);
    }

    /// Most recent `count` closed candles, oldest first.
    pub fn get_closed(&self, key: &CandleKey, count: usize) -> Vec<Candle> {
        let map = self.buffers.read();
        match map.get(key) {
            Some(ring) => {
                let closed: Vec<&Candle> = ring.iter().filter(|c| c.is_closed).collect();
                let start = closed.len().saturating_sub(count);
                closed[start..].iter().map(|c| (*c).clone()).collect()
            }
            None => Vec::new(),
        }
    }

    /// Close price of the most recent closed candle.
    pub fn last_close(&self, key: &CandleKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key)
            .and_then(|ring| ring.iter().rev().find(|c| c.is_closed).map(|c| c.close))
    }

    pub fn closed_count(&self, key: &CandleKey) -> usize {
        let map = self.buffers.read();
        map.get(key)
            .map_or(0, |ring| ring.iter().filter(|c| c.is_closed).count())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn sample(open_time: i64, close: f64, is_closed: bool) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            interval: "1m".into(),
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            is_closed,
        }
    }

    fn key(sym: &str, iv: &str) -> CandleKey {
        CandleKey::new(sym, iv)
    }

    #[test]
    fn ring_trims_to_capacity() {
        let buf = CandleBuffer::new(3);
        let k = key("BTCUSDT", "1m");
        for i in 0..5 {
            buf.update(k.clone(), sample(i * 60_000, 100.0 + i as f64, true));
        }
        let closes: Vec<f64> = buf.get_closed(&k, 10).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn in_progress_candle_replaced_in_place() {
        let buf = CandleBuffer::new(10);
        let k = key("ETHUSDT", "5m");
        buf.update(k.clone(), sample(0, 50.0, false));
        buf.update(k.clone(), sample(0, 51.0, false));
        assert_eq!(buf.closed_count(&k), 0);
        buf.update(k.clone(), sample(0, 52.0, true));
        assert_eq!(buf.closed_count(&k), 1);
        assert_eq!(buf.last_close(&k), Some(52.0));
    }

    #[test]
    fn closed_query_excludes_live_candle() {
        let buf = CandleBuffer::new(10);
        let k = key("BTCUSDT", "1m");
        buf.update(k.clone(), sample(0, 100.0, true));
        buf.update(k.clone(), sample(60_000, 101.0, true));
        buf.update(k.clone(), sample(120_000, 102.0, false));
        assert_eq!(buf.get_closed(&k, 10).len(), 2);
    }

    #[test]
    fn replace_closed_swaps_snapshot() {
        let buf = CandleBuffer::new(10);
        let k = key("BTCUSDT", "5m");
        buf.update(k.clone(), sample(0, 100.0, true));
        let snapshot = vec![sample(0, 200.0, true), sample(300_000, 201.0, true)];
        buf.replace_closed(k.clone(), snapshot);
        assert_eq!(buf.last_close(&k), Some(201.0));
        assert_eq!(buf.closed_count(&k), 2);
    }

    #[test]
    fn candle_validity() {
        assert!(sample(0, 100.0, true).is_valid());
        let mut bad = sample(0, 100.0, true);
        bad.high = 98.0;
        assert!(!bad.is_valid());
        let mut doji = sample(0, 100.0, true);
        doji.open = 100.0;
        assert!(doji.is_valid());
    }
}
