// =============================================================================
// Feature pipeline — indicator frames from candles + orderbook + derivatives
// =============================================================================
//
// Consumes closed candles, the latest orderbook snapshot, and an optional
// derivatives snapshot, and produces a per-bar FeatureFrame. Orderflow
// features are computed exactly once here and attached to the last row;
// callers must never recompute them. Derivatives are attached only when the
// venue supplied them — their absence is not an error.
//
// Anomaly thresholds are physically meaningful: a wick is anomalous only when
// it BOTH exceeds 3x a floor-protected body AND exceeds 2% of price, so a
// plain doji never trips the wick flag by itself.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::indicators::adx::adx;
use crate::indicators::atr::{atr_pct, atr_series, atr_slope};
use crate::indicators::bollinger::{bollinger_at, width_change_pct};
use crate::indicators::ema::ema_series;
use crate::indicators::macd::{macd, Macd};
use crate::indicators::volume::{percentile_rank, zscore};
use crate::market_data::{Candle, OrderBookSnapshot};

// Wick anomaly gates.
const WICK_BODY_RATIO: f64 = 3.0;
const WICK_MIN_PCT: f64 = 2.0;
// Body floor as a fraction of price, so doji bodies do not explode the ratio.
const BODY_FLOOR_PCT: f64 = 0.05;
// Gap between consecutive closes considered anomalous.
const GAP_PCT: f64 = 1.0;
// Volume z-score below which the bar is considered too thin to trust.
const LOW_VOLUME_Z: f64 = -2.0;
// Liquidation wicks pair an extreme wick with a volume spike.
const LIQUIDATION_VOLUME_Z: f64 = 2.5;

/// Anomaly flags for one bar.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AnomalyFlags {
    pub wick: bool,
    pub low_volume: bool,
    pub gap: bool,
    pub liquidation_wick: bool,
}

impl AnomalyFlags {
    pub fn any(&self) -> bool {
        self.wick || self.low_volume || self.gap || self.liquidation_wick
    }

    /// Stable codes of the flags that fired, for decision records.
    pub fn active(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.wick {
            out.push("anomaly_wick");
        }
        if self.low_volume {
            out.push("anomaly_low_volume");
        }
        if self.gap {
            out.push("anomaly_gap");
        }
        if self.liquidation_wick {
            out.push("liquidation_wick");
        }
        out
    }
}

/// Orderflow features, computed once per iteration from the latest book.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct OrderflowFeatures {
    pub spread_pct: f64,
    pub depth_imbalance: f64,
    pub book_valid: bool,
}

/// Derivatives features, attached only when the venue supplied them.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct DerivativesFeatures {
    pub mark_index_deviation_pct: f64,
    pub funding_rate: f64,
    pub open_interest: f64,
    pub oi_change_pct: Option<f64>,
}

/// Raw derivatives snapshot as fetched from the venue tickers endpoint.
#[derive(Debug, Clone, Copy)]
pub struct DerivativesSnapshot {
    pub mark_price: f64,
    pub index_price: f64,
    pub funding_rate: f64,
    pub open_interest: f64,
    pub prev_open_interest: Option<f64>,
}

/// One row of the frame, keyed by close time.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRow {
    pub close_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    // Trend
    pub adx: Option<f64>,
    pub ema_fast: Option<f64>,
    pub ema_slow: Option<f64>,
    pub macd: Option<f64>,
    pub macd_histogram: Option<f64>,
    // Volatility
    pub atr: Option<f64>,
    pub atr_pct: Option<f64>,
    pub atr_slope: Option<f64>,
    pub bb_width: Option<f64>,
    pub bb_width_change_pct: Option<f64>,
    // Volume
    pub volume_zscore: Option<f64>,
    pub volume_percentile: Option<f64>,
    // Data quality
    pub anomalies: AnomalyFlags,
}

/// Tabular per-bar feature structure. Orderflow and derivatives belong to the
/// last row only.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureFrame {
    pub symbol: String,
    pub interval: String,
    pub rows: Vec<FeatureRow>,
    pub orderflow: Option<OrderflowFeatures>,
    pub derivatives: Option<DerivativesFeatures>,
}

impl FeatureFrame {
    pub fn last(&self) -> Option<&FeatureRow> {
        self.rows.last()
    }

    pub fn prev(&self) -> Option<&FeatureRow> {
        if self.rows.len() >= 2 {
            self.rows.get(self.rows.len() - 2)
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Tunables the pipeline needs; sourced from config by the bot.
#[derive(Debug, Clone, Copy)]
pub struct PipelineParams {
    pub ema_fast: usize,
    pub ema_slow: usize,
    pub adx_period: usize,
    pub atr_period: usize,
    pub bb_period: usize,
    pub bb_k: f64,
    pub volume_window: usize,
    pub max_book_deviation_pct: f64,
    pub imbalance_levels: usize,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            ema_fast: 21,
            ema_slow: 55,
            adx_period: 14,
            atr_period: 14,
            bb_period: 20,
            bb_k: 2.0,
            volume_window: 20,
            max_book_deviation_pct: 1.0,
            imbalance_levels: 10,
        }
    }
}

/// Build a feature frame. `candles` must contain only closed bars, oldest
/// first; unclosed bars are dropped defensively.
pub fn build_frame(
    symbol: &str,
    interval: &str,
    candles: &[Candle],
    orderbook: Option<&OrderBookSnapshot>,
    derivatives: Option<&DerivativesSnapshot>,
    params: &PipelineParams,
) -> FeatureFrame {
    let closed: Vec<&Candle> = candles
        .iter()
        .filter(|c| c.is_closed && c.is_valid())
        .collect();

    let closes: Vec<f64> = closed.iter().map(|c| c.close).collect();
    let volumes: Vec<f64> = closed.iter().map(|c| c.volume).collect();
    let owned: Vec<Candle> = closed.iter().map(|&c| c.clone()).collect();

    let ema_fast_series = ema_series(&closes, params.ema_fast);
    let ema_slow_series = ema_series(&closes, params.ema_slow);
    let atr_full = atr_series(&owned, params.atr_period);

    let mut rows = Vec::with_capacity(closed.len());
    for (i, candle) in closed.iter().enumerate() {
        let n = i + 1;

        let ema_fast = tail_at(&ema_fast_series, closes.len(), n);
        let ema_slow = tail_at(&ema_slow_series, closes.len(), n);
        let atr = tail_at(&atr_full, closes.len() - 1, n.saturating_sub(1));

        // Heavier indicators only matter on the decision row; computing them
        // for every historical row would be wasted work on each tick.
        let is_last = i == closed.len() - 1;
        let (adx_v, macd_v, atr_pct_v, atr_slope_v, bb, bbw_change, vol_z, vol_pct) = if is_last {
            let macd_val: Option<Macd> = macd(&closes, 12, 26, 9);
            (
                adx(&owned, params.adx_period),
                macd_val,
                atr_pct(&owned, params.atr_period),
                atr_slope(&owned, params.atr_period, 5),
                bollinger_at(&closes, closes.len(), params.bb_period, params.bb_k),
                width_change_pct(&closes, params.bb_period, params.bb_k, 5),
                zscore(&volumes, params.volume_window),
                percentile_rank(&volumes, params.volume_window),
            )
        } else {
            (None, None, None, None, None, None, None, None)
        };

        let prev_close = if i > 0 { Some(closed[i - 1].close) } else { None };
        let anomalies = detect_anomalies(candle, prev_close, vol_z);

        rows.push(FeatureRow {
            close_time: candle.close_time,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            adx: adx_v,
            ema_fast,
            ema_slow,
            macd: macd_v.map(|m| m.macd),
            macd_histogram: macd_v.map(|m| m.histogram),
            atr,
            atr_pct: atr_pct_v,
            atr_slope: atr_slope_v,
            bb_width: bb.map(|b| b.width),
            bb_width_change_pct: bbw_change,
            volume_zscore: vol_z,
            volume_percentile: vol_pct,
            anomalies,
        });
    }

    // Orderflow: computed exactly once, here, for the last row.
    let last_close = rows.last().map(|r| r.close);
    let orderflow = orderbook.map(|book| {
        let book_valid = book.is_valid(last_close, params.max_book_deviation_pct);
        OrderflowFeatures {
            spread_pct: book.spread_pct().unwrap_or(f64::INFINITY),
            depth_imbalance: book.depth_imbalance(params.imbalance_levels).unwrap_or(0.0),
            book_valid,
        }
    });

    let derivatives = derivatives.map(|d| DerivativesFeatures {
        mark_index_deviation_pct: if d.index_price > 0.0 {
            (d.mark_price - d.index_price) / d.index_price * 100.0
        } else {
            0.0
        },
        funding_rate: d.funding_rate,
        open_interest: d.open_interest,
        oi_change_pct: d.prev_open_interest.and_then(|prev| {
            if prev > 0.0 {
                Some((d.open_interest - prev) / prev * 100.0)
            } else {
                None
            }
        }),
    });

    debug!(
        symbol,
        interval,
        rows = rows.len(),
        has_orderflow = orderflow.is_some(),
        has_derivatives = derivatives.is_some(),
        "feature frame built"
    );

    FeatureFrame {
        symbol: symbol.to_string(),
        interval: interval.to_string(),
        rows,
        orderflow,
        derivatives,
    }
}

/// Value of a tail-aligned series as of the first `n` inputs. Series produced
/// by the indicators end at the last input; element for input `n` exists only
/// once the seed window is filled.
fn tail_at(series: &[f64], total_inputs: usize, n: usize) -> Option<f64> {
    if series.is_empty() || n == 0 {
        return None;
    }
    let missing = total_inputs - series.len();
    if n <= missing {
        return None;
    }
    series.get(n - missing - 1).copied()
}

/// Per-bar anomaly detection.
fn detect_anomalies(candle: &Candle, prev_close: Option<f64>, volume_z: Option<f64>) -> AnomalyFlags {
    let mut flags = AnomalyFlags::default();
    let price = candle.close.max(f64::EPSILON);

    // Wick: both conditions must hold; the body floor keeps a doji from
    // producing an infinite ratio.
    let body = (candle.close - candle.open).abs();
    let body_floored = body.max(price * BODY_FLOOR_PCT / 100.0);
    let upper_wick = candle.high - candle.open.max(candle.close);
    let lower_wick = candle.open.min(candle.close) - candle.low;
    let wick = upper_wick.max(lower_wick).max(0.0);
    let wick_pct = wick / price * 100.0;
    if wick > WICK_BODY_RATIO * body_floored && wick_pct > WICK_MIN_PCT {
        flags.wick = true;
        if let Some(z) = volume_z {
            if z > LIQUIDATION_VOLUME_Z {
                flags.liquidation_wick = true;
            }
        }
    }

    if let Some(prev) = prev_close {
        if prev > 0.0 {
            let gap_pct = ((candle.open - prev) / prev).abs() * 100.0;
            if gap_pct > GAP_PCT {
                flags.gap = true;
            }
        }
    }

    if let Some(z) = volume_z {
        if z < LOW_VOLUME_Z {
            flags.low_volume = true;
        }
    }

    flags
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::{BookLevel, OrderBookSnapshot};

    fn candle(i: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle {
            open_time: i * 300_000,
            close_time: (i + 1) * 300_000 - 1,
            interval: "5m".into(),
            open,
            high,
            low,
            close,
            volume,
            is_closed: true,
        }
    }

    fn normal_series(n: usize) -> Vec<Candle> {
        (0..n as i64)
            .map(|i| {
                let base = 50_000.0 + (i % 7) as f64 * 10.0;
                candle(i, base, base + 40.0, base - 40.0, base + 5.0, 100.0)
            })
            .collect()
    }

    #[test]
    fn doji_alone_does_not_trip_wick_anomaly() {
        // open == close, small wicks relative to price: a plain doji.
        let mut series = normal_series(40);
        series.push(candle(40, 50_000.0, 50_040.0, 49_960.0, 50_000.0, 100.0));
        let frame = build_frame("BTCUSDT", "5m", &series, None, None, &PipelineParams::default());
        let last = frame.last().unwrap();
        assert!(!last.anomalies.wick, "doji must not trigger anomaly_wick");
        assert!(!last.anomalies.any());
    }

    #[test]
    fn large_wick_with_tiny_body_trips_anomaly() {
        let mut series = normal_series(40);
        // 3% lower wick, near-zero body.
        series.push(candle(40, 50_000.0, 50_010.0, 48_400.0, 49_990.0, 100.0));
        let frame = build_frame("BTCUSDT", "5m", &series, None, None, &PipelineParams::default());
        assert!(frame.last().unwrap().anomalies.wick);
    }

    #[test]
    fn big_wick_on_small_price_move_not_anomalous_below_two_pct() {
        let mut series = normal_series(40);
        // Wick is 10x the body but only ~0.5% of price.
        series.push(candle(40, 50_000.0, 50_010.0, 49_750.0, 49_995.0, 100.0));
        let frame = build_frame("BTCUSDT", "5m", &series, None, None, &PipelineParams::default());
        assert!(!frame.last().unwrap().anomalies.wick);
    }

    #[test]
    fn gap_detection() {
        let mut series = normal_series(40);
        let prev_close = series.last().unwrap().close;
        let open = prev_close * 1.02;
        series.push(candle(40, open, open + 20.0, open - 20.0, open, 100.0));
        let frame = build_frame("BTCUSDT", "5m", &series, None, None, &PipelineParams::default());
        assert!(frame.last().unwrap().anomalies.gap);
    }

    #[test]
    fn orderflow_attached_to_frame_once() {
        let series = normal_series(60);
        let last = series.last().unwrap().close;
        let book = OrderBookSnapshot {
            symbol: "BTCUSDT".into(),
            bids: vec![BookLevel { price: last - 1.0, size: 5.0 }],
            asks: vec![BookLevel { price: last + 1.0, size: 5.0 }],
            ts: 0,
        };
        let frame = build_frame(
            "BTCUSDT",
            "5m",
            &series,
            Some(&book),
            None,
            &PipelineParams::default(),
        );
        let of = frame.orderflow.expect("orderflow attached");
        assert!(of.book_valid);
        assert!(of.spread_pct < 0.01);
        assert!(frame.derivatives.is_none(), "absent derivatives is not an error");
    }

    #[test]
    fn derivatives_attached_when_supplied() {
        let series = normal_series(60);
        let snap = DerivativesSnapshot {
            mark_price: 50_100.0,
            index_price: 50_000.0,
            funding_rate: 0.0001,
            open_interest: 1_000_000.0,
            prev_open_interest: Some(900_000.0),
        };
        let frame = build_frame(
            "BTCUSDT",
            "5m",
            &series,
            None,
            Some(&snap),
            &PipelineParams::default(),
        );
        let d = frame.derivatives.unwrap();
        assert!((d.mark_index_deviation_pct - 0.2).abs() < 1e-9);
        let oi = d.oi_change_pct.unwrap();
        assert!((oi - 11.111).abs() < 0.01);
    }

    #[test]
    fn indicators_present_on_last_row() {
        let series = normal_series(80);
        let frame = build_frame("BTCUSDT", "5m", &series, None, None, &PipelineParams::default());
        let last = frame.last().unwrap();
        assert!(last.atr.is_some());
        assert!(last.adx.is_some());
        assert!(last.ema_fast.is_some());
        assert!(last.bb_width.is_some());
        assert!(last.volume_zscore.is_some());
    }
}
