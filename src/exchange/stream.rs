// =============================================================================
// Venue WebSocket streams — public klines, private order/execution/position
// =============================================================================
//
// Each stream runs until it disconnects or errors, then returns so the
// supervising task can reconnect after a delay. The private stream
// authenticates once per connection (HMAC over "GET/realtime{expires}") and
// resubscribes on every reconnect.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::market_data::{Candle, CandleBuffer, CandleKey};
use crate::positions::PositionManager;
use crate::store::{ExecutionRecord, Store};
use crate::types::OrderStatus;

type HmacSha256 = Hmac<Sha256>;

const PUBLIC_MAINNET: &str = "wss://stream.bybit.com/v5/public/linear";
const PUBLIC_TESTNET: &str = "wss://stream-testnet.bybit.com/v5/public/linear";
const PRIVATE_MAINNET: &str = "wss://stream.bybit.com/v5/private";
const PRIVATE_TESTNET: &str = "wss://stream-testnet.bybit.com/v5/private";

pub fn public_url(testnet: bool) -> &'static str {
    if testnet {
        PUBLIC_TESTNET
    } else {
        PUBLIC_MAINNET
    }
}

pub fn private_url(testnet: bool) -> &'static str {
    if testnet {
        PRIVATE_TESTNET
    } else {
        PRIVATE_MAINNET
    }
}

// -----------------------------------------------------------------------------
// Public kline stream
// -----------------------------------------------------------------------------

/// Subscribe to kline topics for one symbol across `intervals` and feed
/// closed candles into the buffer. Returns on disconnect.
pub async fn run_kline_stream(
    testnet: bool,
    symbol: &str,
    intervals: &[&str],
    buffer: &Arc<CandleBuffer>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    let url = public_url(testnet);
    info!(url, symbol, ?intervals, "connecting public kline stream");

    let (ws, _) = connect_async(url)
        .await
        .context("failed to connect public stream")?;
    let (mut write, mut read) = ws.split();

    let args: Vec<String> = intervals
        .iter()
        .map(|iv| format!("kline.{}.{}", interval_topic(iv), symbol))
        .collect();
    let sub = serde_json::json!({ "op": "subscribe", "args": args });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("kline subscribe failed")?;

    while let Some(msg) = read.next().await {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        match msg {
            Ok(Message::Text(text)) => {
                if let Some((key, candle)) = parse_kline_message(&text) {
                    debug!(key = %key, close = candle.close, closed = candle.is_closed, "candle update");
                    buffer.update(key, candle);
                }
            }
            Ok(Message::Ping(p)) => {
                let _ = write.send(Message::Pong(p)).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(symbol, error = %e, "public stream read error");
                return Err(e.into());
            }
        }
    }
    warn!(symbol, "public stream ended");
    Ok(())
}

/// Parse one kline push message.
///
/// Shape:
/// ```json
/// { "topic": "kline.5.BTCUSDT",
///   "data": [{ "start": ..., "end": ..., "open": "..", "confirm": true, ... }] }
/// ```
fn parse_kline_message(text: &str) -> Option<(CandleKey, Candle)> {
    let root: serde_json::Value = serde_json::from_str(text).ok()?;
    let topic = root["topic"].as_str()?;
    let mut parts = topic.split('.');
    if parts.next()? != "kline" {
        return None;
    }
    let interval = topic_interval(parts.next()?);
    let symbol = parts.next()?.to_string();

    let row = root["data"].as_array()?.first()?;
    let candle = Candle {
        open_time: row["start"].as_i64()?,
        close_time: row["end"].as_i64()? - 1,
        interval: interval.to_string(),
        open: str_f64(&row["open"])?,
        high: str_f64(&row["high"])?,
        low: str_f64(&row["low"])?,
        close: str_f64(&row["close"])?,
        volume: str_f64(&row["volume"])?,
        is_closed: row["confirm"].as_bool().unwrap_or(false),
    };
    Some((CandleKey::new(symbol, interval), candle))
}

// -----------------------------------------------------------------------------
// Private stream
// -----------------------------------------------------------------------------

/// Connect, authenticate, and subscribe to order / execution / position
/// topics. Fills update the position manager and the store; order updates
/// refresh order status rows. Returns on disconnect so the caller can
/// reconnect with a fresh auth.
pub async fn run_private_stream(
    testnet: bool,
    api_key: &str,
    api_secret: &str,
    store: &Arc<Store>,
    positions: &Arc<PositionManager>,
    stop: &Arc<AtomicBool>,
) -> Result<()> {
    let url = private_url(testnet);
    info!(url, "connecting private stream");

    let (ws, _) = connect_async(url)
        .await
        .context("failed to connect private stream")?;
    let (mut write, mut read) = ws.split();

    // Auth: signature over "GET/realtime{expires}".
    let expires = (chrono::Utc::now().timestamp_millis() + 10_000) as u64;
    let mut mac =
        HmacSha256::new_from_slice(api_secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(format!("GET/realtime{expires}").as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());

    let auth = serde_json::json!({ "op": "auth", "args": [api_key, expires, signature] });
    write
        .send(Message::Text(auth.to_string()))
        .await
        .context("private auth send failed")?;

    let sub = serde_json::json!({ "op": "subscribe", "args": ["order", "execution", "position"] });
    write
        .send(Message::Text(sub.to_string()))
        .await
        .context("private subscribe failed")?;

    while let Some(msg) = read.next().await {
        if stop.load(Ordering::Relaxed) {
            return Ok(());
        }
        match msg {
            Ok(Message::Text(text)) => handle_private_message(&text, store, positions),
            Ok(Message::Ping(p)) => {
                let _ = write.send(Message::Pong(p)).await;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "private stream read error");
                return Err(e.into());
            }
        }
    }
    warn!("private stream ended");
    Ok(())
}

fn handle_private_message(text: &str, store: &Arc<Store>, positions: &Arc<PositionManager>) {
    let Ok(root) = serde_json::from_str::<serde_json::Value>(text) else {
        return;
    };

    if let Some(success) = root["success"].as_bool() {
        let op = root["op"].as_str().unwrap_or("");
        if success {
            debug!(op, "private stream op acknowledged");
        } else {
            warn!(op, msg = ?root["ret_msg"], "private stream op failed");
        }
        return;
    }

    let topic = root["topic"].as_str().unwrap_or("");
    let Some(rows) = root["data"].as_array() else {
        return;
    };

    match topic {
        "execution" => {
            for row in rows {
                let rec = ExecutionRecord {
                    exec_id: row["execId"].as_str().unwrap_or("").to_string(),
                    order_id: row["orderId"].as_str().unwrap_or("").to_string(),
                    symbol: row["symbol"].as_str().unwrap_or("").to_string(),
                    side: row["side"].as_str().unwrap_or("").to_string(),
                    price: str_f64(&row["execPrice"]).unwrap_or(0.0),
                    qty: str_f64(&row["execQty"]).unwrap_or(0.0),
                    fee: str_f64(&row["execFee"]).unwrap_or(0.0),
                    is_maker: row["isMaker"].as_bool().unwrap_or(false),
                    exec_time: str_f64(&row["execTime"]).unwrap_or(0.0) as i64,
                    closed_pnl: str_f64(&row["closedPnl"]).unwrap_or(0.0),
                };
                if rec.exec_id.is_empty() {
                    continue;
                }
                let side = if rec.side == "Buy" {
                    crate::types::Side::Buy
                } else {
                    crate::types::Side::Sell
                };
                let reduce = row["closedSize"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|v| v > 0.0)
                    .unwrap_or(false);
                positions.apply_fill(&rec.symbol, side, rec.qty, rec.price, reduce);
                if let Err(e) = store.insert_execution_if_absent(&rec) {
                    warn!(error = %e, "failed to persist stream execution");
                }
            }
        }
        "order" => {
            for row in rows {
                let order_id = row["orderId"].as_str().unwrap_or("");
                let status = OrderStatus::from_wire(row["orderStatus"].as_str().unwrap_or(""));
                if order_id.is_empty() {
                    continue;
                }
                if let Err(e) = store.update_order_status(order_id, status) {
                    warn!(error = %e, order_id, "failed to update order status from stream");
                }
                debug!(order_id, %status, "order update");
            }
        }
        "position" => {
            for row in rows {
                let symbol = row["symbol"].as_str().unwrap_or("");
                let mark = str_f64(&row["markPrice"]);
                let upnl = str_f64(&row["unrealisedPnl"]);
                if let Some(mark) = mark {
                    positions.update_mark(symbol, mark, upnl);
                }
            }
        }
        _ => {}
    }
}

fn interval_topic(interval: &str) -> &str {
    match interval {
        "1m" => "1",
        "5m" => "5",
        "15m" => "15",
        "1h" => "60",
        other => other,
    }
}

fn topic_interval(code: &str) -> &str {
    match code {
        "1" => "1m",
        "5" => "5m",
        "15" => "15m",
        "60" => "1h",
        other => other,
    }
}

fn str_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}
