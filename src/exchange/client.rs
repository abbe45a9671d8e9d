// =============================================================================
// Bybit V5 REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret never appears in logs or Debug output.
//
// THE SIGNING CONTRACT: the string that is signed must be byte-identical to
// the string transmitted on the wire.
//   GET  — the query string is built exactly once (sorted keys, URL-encoded)
//          and that same String is used in both the signature and the URL.
//   POST — the body is serialized exactly once (compact, declaration-order
//          keys) and that same String is sent as the raw body.
//
// signature = HMAC-SHA256(timestamp || api_key || recv_window || payload)
// Headers: X-BAPI-API-KEY, X-BAPI-TIMESTAMP, X-BAPI-RECV-WINDOW, X-BAPI-SIGN,
// and the explicit signature-type marker X-BAPI-SIGN-TYPE: 2 (HMAC-SHA256).
//
// Retries are bounded (3 attempts, exponential backoff) and confined to the
// transient transport family. Order creation stays safe to retry because the
// order manager supplies a deterministic orderLinkId.
// =============================================================================

use hmac::{Hmac, Mac};
use reqwest::StatusCode;
use serde::Serialize;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::errors::{EngineError, EngineResult};
use crate::features::DerivativesSnapshot;
use crate::instruments::Instrument;
use crate::market_data::{BookLevel, Candle, OrderBookSnapshot};

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5_000;
/// Bounded retry budget for transient transport failures.
const MAX_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 250;
/// Explicit signature-type marker: 2 = HMAC-SHA256.
const SIGN_TYPE: &str = "2";

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";

#[derive(Clone)]
pub struct BybitClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

// -----------------------------------------------------------------------------
// Venue DTOs
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub symbol: String,
    /// "Buy" (long), "Sell" (short).
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub mark_price: Option<f64>,
    pub unrealised_pnl: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct VenueOrder {
    pub order_id: String,
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub status: String,
    pub reduce_only: bool,
    pub created_time: i64,
}

#[derive(Debug, Clone)]
pub struct VenueExecution {
    pub exec_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub fee: f64,
    pub is_maker: bool,
    pub exec_time: i64,
    pub closed_pnl: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct WalletSnapshot {
    pub wallet_balance: f64,
    pub unrealised_pnl: f64,
    pub equity: f64,
}

#[derive(Debug, Clone)]
pub struct CreatedOrder {
    pub order_id: String,
    pub order_link_id: String,
}

/// Order-create request body. Field order is the serialization order; the
/// struct is serialized exactly once per submission. Numeric fields are
/// strings because the venue requires string-encoded decimals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub category: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
    pub time_in_force: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
    pub order_link_id: String,
}

/// Trading-stop request: one call sets or clears both levels on the
/// position. "0" clears a level. Inherently reduce-only on the venue side.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradingStopRequest {
    pub category: String,
    pub symbol: String,
    pub position_idx: u8,
    pub stop_loss: String,
    pub take_profit: String,
    pub sl_trigger_by: String,
    pub tp_trigger_by: String,
    pub tpsl_mode: String,
}

impl BybitClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    pub fn new(api_key: impl Into<String>, secret: impl Into<String>, testnet: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        debug!(base_url, "BybitClient initialised");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: base_url.to_string(),
            client,
        }
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    /// HMAC-SHA256 over `timestamp || api_key || recv_window || payload`,
    /// hex lowercase.
    pub fn sign(&self, timestamp_ms: u64, payload: &str) -> String {
        let prehash = format!("{timestamp_ms}{}{RECV_WINDOW}{payload}", self.api_key);
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(prehash.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build the canonical query string: keys sorted, values URL-encoded.
    /// This single String is both signed and transmitted.
    pub fn build_query(params: &[(&str, String)]) -> String {
        let mut sorted: Vec<&(&str, String)> = params.iter().collect();
        sorted.sort_by_key(|(k, _)| *k);
        sorted
            .iter()
            .map(|(k, v)| format!("{k}={}", url_encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    async fn signed_get(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> EngineResult<serde_json::Value> {
        self.with_retry(|| self.signed_get_once(path, params)).await
    }

    async fn signed_get_once(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> EngineResult<serde_json::Value> {
        // The query string is built once; the signature covers exactly the
        // bytes that go on the wire.
        let query = Self::build_query(params);
        let ts = Self::timestamp_ms();
        let sig = self.sign(ts, &query);
        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self
            .client
            .get(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .header("X-BAPI-SIGN-TYPE", SIGN_TYPE)
            .send()
            .await
            .map_err(classify_reqwest)?;

        Self::handle_response(resp).await
    }

    async fn public_get(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> EngineResult<serde_json::Value> {
        self.with_retry(|| self.public_get_once(path, params)).await
    }

    async fn public_get_once(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> EngineResult<serde_json::Value> {
        let query = Self::build_query(params);
        let url = format!("{}{}?{}", self.base_url, path, query);
        let resp = self.client.get(&url).send().await.map_err(classify_reqwest)?;
        Self::handle_response(resp).await
    }

    async fn signed_post<B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> EngineResult<serde_json::Value> {
        // Serialized exactly once; the same bytes are signed and sent on
        // every attempt.
        let body_raw = serde_json::to_string(body)
            .map_err(|e| EngineError::Internal(anyhow::anyhow!("body serialization: {e}")))?;

        self.with_retry(|| self.signed_post_once(path, &body_raw))
            .await
    }

    async fn signed_post_once(
        &self,
        path: &str,
        body_raw: &str,
    ) -> EngineResult<serde_json::Value> {
        let ts = Self::timestamp_ms();
        let sig = self.sign(ts, body_raw);
        let url = format!("{}{}", self.base_url, path);

        let resp = self
            .client
            .post(&url)
            .header("X-BAPI-API-KEY", &self.api_key)
            .header("X-BAPI-TIMESTAMP", ts.to_string())
            .header("X-BAPI-RECV-WINDOW", RECV_WINDOW.to_string())
            .header("X-BAPI-SIGN", sig)
            .header("X-BAPI-SIGN-TYPE", SIGN_TYPE)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_raw.to_string())
            .send()
            .await
            .map_err(classify_reqwest)?;

        Self::handle_response(resp).await
    }

    async fn handle_response(resp: reqwest::Response) -> EngineResult<serde_json::Value> {
        let status = resp.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(EngineError::RateLimited(format!("http {status}")));
        }
        if status.is_server_error() {
            return Err(EngineError::Server(format!("http {status}")));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| EngineError::Network(format!("body parse: {e}")))?;

        let ret_code = body["retCode"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let msg = body["retMsg"].as_str().unwrap_or("").to_string();
            return Err(classify_ret_code(ret_code, msg));
        }
        Ok(body)
    }

    /// Bounded exponential-backoff retry, transient failures only.
    async fn with_retry<F, Fut>(&self, mut op: F) -> EngineResult<serde_json::Value>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = EngineResult<serde_json::Value>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = BACKOFF_BASE_MS * 2u64.pow(attempt);
                    warn!(kind = e.kind(), attempt, delay_ms = delay, "transient venue error — retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /v5/market/kline. Returns closed candles oldest-first; the venue's
    /// newest-first list is reversed and the (possibly unclosed) newest bar
    /// is marked by comparing its window against the current clock.
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u32,
    ) -> EngineResult<Vec<Candle>> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("interval", interval_code(interval).to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.public_get("/v5/market/kline", &params).await?;

        let list = body["result"]["list"]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let interval_ms = interval_millis(interval);
        let now_ms = Self::timestamp_ms() as i64;

        let mut candles: Vec<Candle> = Vec::with_capacity(list.len());
        for entry in list.iter().rev() {
            let arr = match entry.as_array() {
                Some(a) if a.len() >= 6 => a,
                _ => {
                    warn!("skipping malformed kline entry");
                    continue;
                }
            };
            let open_time = parse_f64(&arr[0]) as i64;
            let close_time = open_time + interval_ms - 1;
            candles.push(Candle {
                open_time,
                close_time,
                interval: interval.to_string(),
                open: parse_f64(&arr[1]),
                high: parse_f64(&arr[2]),
                low: parse_f64(&arr[3]),
                close: parse_f64(&arr[4]),
                volume: parse_f64(&arr[5]),
                is_closed: close_time < now_ms,
            });
        }

        debug!(symbol, interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }

    /// GET /v5/market/orderbook.
    pub async fn get_orderbook(&self, symbol: &str, depth: u32) -> EngineResult<OrderBookSnapshot> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("limit", depth.to_string()),
        ];
        let body = self.public_get("/v5/market/orderbook", &params).await?;
        let result = &body["result"];

        let parse_side = |key: &str| -> Vec<BookLevel> {
            result[key]
                .as_array()
                .map(|levels| {
                    levels
                        .iter()
                        .filter_map(|l| {
                            let pair = l.as_array()?;
                            Some(BookLevel {
                                price: parse_f64(pair.first()?),
                                size: parse_f64(pair.get(1)?),
                            })
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(OrderBookSnapshot {
            symbol: symbol.to_string(),
            bids: parse_side("b"),
            asks: parse_side("a"),
            ts: result["ts"].as_i64().unwrap_or(0),
        })
    }

    /// GET /v5/market/tickers + /v5/market/open-interest merged into the
    /// derivatives snapshot. A missing snapshot is reported as Ok(None)
    /// upstream by the caller; here any parse gap simply yields zeros.
    pub async fn get_derivatives(&self, symbol: &str) -> EngineResult<DerivativesSnapshot> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let body = self.public_get("/v5/market/tickers", &params).await?;
        let row = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .cloned()
            .unwrap_or_default();

        Ok(DerivativesSnapshot {
            mark_price: parse_f64(&row["markPrice"]),
            index_price: parse_f64(&row["indexPrice"]),
            funding_rate: parse_f64(&row["fundingRate"]),
            open_interest: parse_f64(&row["openInterest"]),
            prev_open_interest: None,
        })
    }

    /// GET /v5/market/instruments-info for one symbol.
    pub async fn get_instrument(&self, symbol: &str) -> EngineResult<Instrument> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let body = self.public_get("/v5/market/instruments-info", &params).await?;
        let info = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .cloned()
            .ok_or_else(|| EngineError::MissingInstrument(symbol.to_string()))?;

        Ok(Instrument {
            symbol: symbol.to_string(),
            tick_size: parse_f64(&info["priceFilter"]["tickSize"]),
            qty_step: parse_f64(&info["lotSizeFilter"]["qtyStep"]),
            min_order_qty: parse_f64(&info["lotSizeFilter"]["minOrderQty"]),
            max_order_qty: parse_f64(&info["lotSizeFilter"]["maxOrderQty"]),
            min_notional: parse_f64(&info["lotSizeFilter"]["minNotionalValue"]),
        })
    }

    // -------------------------------------------------------------------------
    // Private account data
    // -------------------------------------------------------------------------

    /// GET /v5/account/wallet-balance (signed).
    pub async fn get_wallet(&self) -> EngineResult<WalletSnapshot> {
        let params = [("accountType", "UNIFIED".to_string())];
        let body = self.signed_get("/v5/account/wallet-balance", &params).await?;
        let row = body["result"]["list"]
            .as_array()
            .and_then(|l| l.first())
            .cloned()
            .unwrap_or_default();

        let wallet_balance = parse_f64(&row["totalWalletBalance"]);
        let unrealised_pnl = parse_f64(&row["totalPerpUPL"]);
        Ok(WalletSnapshot {
            wallet_balance,
            unrealised_pnl,
            equity: wallet_balance + unrealised_pnl,
        })
    }

    /// GET /v5/position/list (signed).
    pub async fn get_positions(&self, symbol: &str) -> EngineResult<Vec<VenuePosition>> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
        ];
        let body = self.signed_get("/v5/position/list", &params).await?;
        let list = body["result"]["list"].as_array().cloned().unwrap_or_default();

        let positions = list
            .iter()
            .filter(|p| parse_f64(&p["size"]) > 0.0)
            .map(|p| VenuePosition {
                symbol: p["symbol"].as_str().unwrap_or(symbol).to_string(),
                side: p["side"].as_str().unwrap_or("").to_string(),
                size: parse_f64(&p["size"]),
                entry_price: parse_f64(&p["avgPrice"]),
                leverage: parse_f64(&p["leverage"]),
                mark_price: opt_f64(&p["markPrice"]),
                unrealised_pnl: opt_f64(&p["unrealisedPnl"]),
            })
            .collect();
        Ok(positions)
    }

    /// GET /v5/order/realtime (signed) — open orders for a symbol.
    pub async fn get_open_orders(&self, symbol: &str) -> EngineResult<Vec<VenueOrder>> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("openOnly", "0".to_string()),
        ];
        let body = self.signed_get("/v5/order/realtime", &params).await?;
        Ok(parse_orders(&body))
    }

    /// GET /v5/order/realtime filtered by orderLinkId (signed). Used by the
    /// idempotent submission path.
    pub async fn find_order_by_link_id(
        &self,
        symbol: &str,
        order_link_id: &str,
    ) -> EngineResult<Option<VenueOrder>> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("orderLinkId", order_link_id.to_string()),
        ];
        let body = self.signed_get("/v5/order/realtime", &params).await?;
        Ok(parse_orders(&body).into_iter().next())
    }

    /// GET /v5/execution/list (signed).
    pub async fn get_executions(
        &self,
        symbol: &str,
        limit: u32,
    ) -> EngineResult<Vec<VenueExecution>> {
        let params = [
            ("category", "linear".to_string()),
            ("symbol", symbol.to_string()),
            ("limit", limit.to_string()),
        ];
        let body = self.signed_get("/v5/execution/list", &params).await?;
        let list = body["result"]["list"].as_array().cloned().unwrap_or_default();

        let execs = list
            .iter()
            .map(|e| VenueExecution {
                exec_id: e["execId"].as_str().unwrap_or("").to_string(),
                order_id: e["orderId"].as_str().unwrap_or("").to_string(),
                symbol: e["symbol"].as_str().unwrap_or(symbol).to_string(),
                side: e["side"].as_str().unwrap_or("").to_string(),
                price: parse_f64(&e["execPrice"]),
                qty: parse_f64(&e["execQty"]),
                fee: parse_f64(&e["execFee"]),
                is_maker: e["isMaker"].as_bool().unwrap_or(false),
                exec_time: parse_f64(&e["execTime"]) as i64,
                closed_pnl: parse_f64(&e["closedPnl"]),
            })
            .collect();
        Ok(execs)
    }

    // -------------------------------------------------------------------------
    // Order lifecycle
    // -------------------------------------------------------------------------

    /// POST /v5/order/create (signed).
    pub async fn create_order(&self, req: &CreateOrderRequest) -> EngineResult<CreatedOrder> {
        debug!(
            symbol = %req.symbol,
            side = %req.side,
            order_type = %req.order_type,
            qty = %req.qty,
            order_link_id = %req.order_link_id,
            "creating order"
        );
        let body = self.signed_post("/v5/order/create", req).await?;
        Ok(CreatedOrder {
            order_id: body["result"]["orderId"].as_str().unwrap_or("").to_string(),
            order_link_id: body["result"]["orderLinkId"]
                .as_str()
                .unwrap_or(&req.order_link_id)
                .to_string(),
        })
    }

    /// POST /v5/order/cancel (signed).
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> EngineResult<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct CancelRequest<'a> {
            category: &'a str,
            symbol: &'a str,
            order_id: &'a str,
        }
        self.signed_post(
            "/v5/order/cancel",
            &CancelRequest {
                category: "linear",
                symbol,
                order_id,
            },
        )
        .await?;
        Ok(())
    }

    /// POST /v5/order/cancel-all (signed).
    pub async fn cancel_all_orders(&self, symbol: &str) -> EngineResult<()> {
        #[derive(Serialize)]
        struct CancelAllRequest<'a> {
            category: &'a str,
            symbol: &'a str,
        }
        self.signed_post(
            "/v5/order/cancel-all",
            &CancelAllRequest {
                category: "linear",
                symbol,
            },
        )
        .await?;
        Ok(())
    }

    /// POST /v5/position/trading-stop (signed). Pass `None` to clear a
    /// level; one call manages both.
    pub async fn set_trading_stop(
        &self,
        symbol: &str,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    ) -> EngineResult<()> {
        let fmt = |v: Option<f64>| match v {
            Some(x) => format!("{x}"),
            None => "0".to_string(),
        };
        let req = TradingStopRequest {
            category: "linear".to_string(),
            symbol: symbol.to_string(),
            position_idx: 0,
            stop_loss: fmt(stop_loss),
            take_profit: fmt(take_profit),
            sl_trigger_by: "LastPrice".to_string(),
            tp_trigger_by: "LastPrice".to_string(),
            tpsl_mode: "Full".to_string(),
        };
        self.signed_post("/v5/position/trading-stop", &req).await?;
        debug!(symbol, ?stop_loss, ?take_profit, "trading stop set");
        Ok(())
    }

    /// POST /v5/position/set-leverage (signed). "Leverage not modified" is
    /// success.
    pub async fn set_leverage(&self, symbol: &str, leverage: f64) -> EngineResult<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct LeverageRequest<'a> {
            category: &'a str,
            symbol: &'a str,
            buy_leverage: String,
            sell_leverage: String,
        }
        let req = LeverageRequest {
            category: "linear",
            symbol,
            buy_leverage: format!("{leverage}"),
            sell_leverage: format!("{leverage}"),
        };
        match self.signed_post("/v5/position/set-leverage", &req).await {
            Ok(_) => Ok(()),
            Err(EngineError::Server(msg)) if msg.contains("110043") => Ok(()),
            Err(e) => Err(e),
        }
    }
}

// -----------------------------------------------------------------------------
// Classification + parsing helpers
// -----------------------------------------------------------------------------

fn classify_reqwest(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Timeout(e.to_string())
    } else {
        EngineError::Network(e.to_string())
    }
}

/// Map the venue's retCode families onto the engine taxonomy.
fn classify_ret_code(code: i64, msg: String) -> EngineError {
    match code {
        10004 => EngineError::SignatureMismatch(format!("retCode {code}: {msg}")),
        10003 | 10005 | 33004 | 10010 => EngineError::Auth(format!("retCode {code}: {msg}")),
        10006 | 10018 => EngineError::RateLimited(format!("retCode {code}: {msg}")),
        110001 => EngineError::OrderNotFound(format!("retCode {code}: {msg}")),
        110017 | 110003 => EngineError::InvalidPrice(format!("retCode {code}: {msg}")),
        110007 | 110012 => EngineError::InvalidSize(format!("retCode {code}: {msg}")),
        110072 => EngineError::DuplicateOrder(format!("retCode {code}: {msg}")),
        _ => EngineError::Server(format!("retCode {code}: {msg}")),
    }
}

fn parse_orders(body: &serde_json::Value) -> Vec<VenueOrder> {
    body["result"]["list"]
        .as_array()
        .map(|list| {
            list.iter()
                .map(|o| VenueOrder {
                    order_id: o["orderId"].as_str().unwrap_or("").to_string(),
                    order_link_id: o["orderLinkId"].as_str().unwrap_or("").to_string(),
                    symbol: o["symbol"].as_str().unwrap_or("").to_string(),
                    side: o["side"].as_str().unwrap_or("").to_string(),
                    order_type: o["orderType"].as_str().unwrap_or("").to_string(),
                    qty: parse_f64(&o["qty"]),
                    price: opt_f64(&o["price"]),
                    status: o["orderStatus"].as_str().unwrap_or("").to_string(),
                    reduce_only: o["reduceOnly"].as_bool().unwrap_or(false),
                    created_time: parse_f64(&o["createdTime"]) as i64,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// The venue serializes numbers as strings; accept both.
fn parse_f64(val: &serde_json::Value) -> f64 {
    match val {
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn opt_f64(val: &serde_json::Value) -> Option<f64> {
    match val {
        serde_json::Value::String(s) if !s.is_empty() => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Map engine interval names onto the venue's codes.
fn interval_code(interval: &str) -> &str {
    match interval {
        "1m" => "1",
        "3m" => "3",
        "5m" => "5",
        "15m" => "15",
        "30m" => "30",
        "1h" => "60",
        "4h" => "240",
        "1d" => "D",
        other => other,
    }
}

fn interval_millis(interval: &str) -> i64 {
    match interval {
        "1m" => 60_000,
        "3m" => 180_000,
        "5m" => 300_000,
        "15m" => 900_000,
        "30m" => 1_800_000,
        "1h" => 3_600_000,
        "4h" => 14_400_000,
        "1d" => 86_400_000,
        _ => 60_000,
    }
}

/// Minimal percent-encoding for query values (RFC 3986 unreserved set kept).
fn url_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            other => out.push_str(&format!("%{other:02X}")),
        }
    }
    out
}

impl std::fmt::Debug for BybitClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BybitClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> BybitClient {
        BybitClient::new("test-key", "test-secret", true)
    }

    #[test]
    fn signature_is_deterministic() {
        let c = client();
        let payload = "category=linear&symbol=BTCUSDT";
        let a = c.sign(1_700_000_000_000, payload);
        let b = c.sign(1_700_000_000_000, payload);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64, "hex sha256 digest");
        // Different timestamp, different signature.
        assert_ne!(a, c.sign(1_700_000_000_001, payload));
        // Different payload, different signature.
        assert_ne!(a, c.sign(1_700_000_000_000, "category=linear&symbol=ETHUSDT"));
    }

    #[test]
    fn query_built_once_is_sorted_and_stable() {
        let params = [
            ("symbol", "BTCUSDT".to_string()),
            ("category", "linear".to_string()),
            ("limit", "50".to_string()),
        ];
        let q1 = BybitClient::build_query(&params);
        let q2 = BybitClient::build_query(&params);
        // Byte-identical on every build: what is signed is what is sent.
        assert_eq!(q1, q2);
        assert_eq!(q1, "category=linear&limit=50&symbol=BTCUSDT");
    }

    #[test]
    fn query_encoding_is_canonical() {
        let params = [("cursor", "abc=1&next".to_string())];
        assert_eq!(BybitClient::build_query(&params), "cursor=abc%3D1%26next");
    }

    #[test]
    fn post_body_serialization_is_stable_and_compact() {
        let req = CreateOrderRequest {
            category: "linear".into(),
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            order_type: "Market".into(),
            qty: "0.01".into(),
            price: None,
            time_in_force: "GTC".into(),
            reduce_only: None,
            order_link_id: "mean_reversion_BTCUSDT_28333333_L".into(),
        };
        let a = serde_json::to_string(&req).unwrap();
        let b = serde_json::to_string(&req).unwrap();
        assert_eq!(a, b, "round-tripping reproduces identical bytes");
        assert!(!a.contains(' '), "compact serialization");
        assert_eq!(
            a,
            r#"{"category":"linear","symbol":"BTCUSDT","side":"Buy","orderType":"Market","qty":"0.01","timeInForce":"GTC","orderLinkId":"mean_reversion_BTCUSDT_28333333_L"}"#
        );

        // The same bytes produce the same signature.
        let c = client();
        assert_eq!(c.sign(1_700_000_000_000, &a), c.sign(1_700_000_000_000, &b));
    }

    #[test]
    fn ret_code_classification() {
        assert_eq!(
            classify_ret_code(10004, "error sign".into()).kind(),
            "signature_mismatch"
        );
        assert_eq!(classify_ret_code(10003, "bad key".into()).kind(), "auth_error");
        assert_eq!(classify_ret_code(10006, "slow down".into()).kind(), "rate_limited");
        assert_eq!(
            classify_ret_code(110001, "order not exists".into()).kind(),
            "order_not_found"
        );
        assert!(classify_ret_code(10006, "x".into()).is_transient());
        assert!(!classify_ret_code(10003, "x".into()).is_transient());
    }

    #[test]
    fn interval_mapping() {
        assert_eq!(interval_code("1m"), "1");
        assert_eq!(interval_code("1h"), "60");
        assert_eq!(interval_millis("5m"), 300_000);
    }

    #[test]
    fn trading_stop_clears_with_zeroes() {
        let fmt = |v: Option<f64>| match v {
            Some(x) => format!("{x}"),
            None => "0".to_string(),
        };
        assert_eq!(fmt(None), "0");
        assert_eq!(fmt(Some(49250.0)), "49250");
    }

    #[test]
    fn debug_redacts_credentials() {
        let c = client();
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("test-secret"));
        assert!(!dbg.contains("test-key"));
    }
}
