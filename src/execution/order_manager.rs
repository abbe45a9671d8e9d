// =============================================================================
// Order manager — idempotent submission with a unified result type
// =============================================================================
//
// IDEMPOTENCY CONTRACT: every submission carries a client order id that is
// deterministic for the same trading intent within a temporal bucket:
//
//   {strategy}_{symbol}_{floor(ts / bucket_seconds)}_{L|S}
//
// A retry of the same intent inside the bucket produces the identical id.
// Before submitting, the local store and then the venue are consulted by
// link id; a hit short-circuits to the existing order. After a successful
// create the order row is persisted atomically.
//
// Every lifecycle call returns `OrderResult`; no caller inspects venue
// return codes directly. Prices and quantities are normalized before any
// venue call; local validation failures never leave the process.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::EngineError;
use crate::exchange::{BybitClient, CreateOrderRequest};
use crate::instruments::InstrumentRegistry;
use crate::store::{OrderRecord, Store};
use crate::types::{Direction, OrderType, Side, TimeInForce};

/// Deterministic client order id for one intent within one bucket.
pub fn order_link_id(
    strategy: &str,
    symbol: &str,
    unix_ts_secs: i64,
    bucket_seconds: i64,
    direction: Direction,
) -> String {
    let bucket = unix_ts_secs.div_euclid(bucket_seconds.max(1));
    format!("{strategy}_{symbol}_{bucket}_{}", direction.tag())
}

/// Unified result of any order-lifecycle call. Truthiness == `success`.
#[derive(Debug, Clone, Serialize)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub error: Option<String>,
    pub raw: Option<serde_json::Value>,
}

impl OrderResult {
    pub fn ok(order_id: impl Into<String>) -> Self {
        Self {
            success: true,
            order_id: Some(order_id.into()),
            error: None,
            raw: None,
        }
    }

    pub fn fail(err: &EngineError) -> Self {
        Self {
            success: false,
            order_id: None,
            error: Some(format!("{}: {err}", err.kind())),
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

impl std::fmt::Display for OrderResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.success {
            write!(f, "ok({})", self.order_id.as_deref().unwrap_or("-"))
        } else {
            write!(f, "failed({})", self.error.as_deref().unwrap_or("-"))
        }
    }
}

/// A validated entry intent ready for submission.
#[derive(Debug, Clone)]
pub struct EntryOrder {
    pub symbol: String,
    pub direction: Direction,
    pub qty: f64,
    /// Limit price; `None` submits a market order.
    pub limit_price: Option<f64>,
    /// Last trade price, used for notional validation of market orders.
    pub reference_price: f64,
    pub strategy: String,
    pub time_in_force: TimeInForce,
    /// Intent timestamp (unix seconds) feeding the idempotency bucket.
    pub ts_secs: i64,
}

pub struct OrderManager {
    client: Arc<BybitClient>,
    store: Arc<Store>,
    registry: Arc<InstrumentRegistry>,
    bucket_seconds: i64,
}

impl OrderManager {
    pub fn new(
        client: Arc<BybitClient>,
        store: Arc<Store>,
        registry: Arc<InstrumentRegistry>,
        bucket_seconds: i64,
    ) -> Self {
        Self {
            client,
            store,
            registry,
            bucket_seconds,
        }
    }

    /// Submit an entry order through the idempotent path.
    pub async fn submit_entry(&self, order: &EntryOrder) -> OrderResult {
        // --- Normalize first; invalid sizes never reach the venue ----------
        let instrument = match self.registry.get(&order.symbol) {
            Ok(i) => i,
            Err(e) => return OrderResult::fail(&e),
        };

        let qty = instrument.round_qty(order.qty);
        let limit_price = order.limit_price.map(|p| instrument.round_price(p));
        let check_price = limit_price.unwrap_or(order.reference_price);
        if let Err(e) = instrument.validate(check_price, qty) {
            warn!(symbol = %order.symbol, error = %e, "order rejected locally");
            return OrderResult::fail(&e);
        }

        let link_id = order_link_id(
            &order.strategy,
            &order.symbol,
            order.ts_secs,
            self.bucket_seconds,
            order.direction,
        );

        // --- Duplicate detection: store, then venue ------------------------
        match self.store.find_order_by_link_id(&link_id) {
            Ok(Some(existing)) => {
                info!(
                    symbol = %order.symbol,
                    order_link_id = %link_id,
                    order_id = %existing.order_id,
                    "duplicate intent — returning existing order"
                );
                return OrderResult::ok(existing.order_id);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "store lookup failed, continuing to venue check");
            }
        }

        match self
            .client
            .find_order_by_link_id(&order.symbol, &link_id)
            .await
        {
            Ok(Some(existing)) => {
                info!(
                    symbol = %order.symbol,
                    order_link_id = %link_id,
                    order_id = %existing.order_id,
                    "intent already on venue — adopting"
                );
                let rec = self.record_for(order, &existing.order_id, &link_id, qty, limit_price);
                if let Err(e) = self.store.insert_order_if_absent(&rec) {
                    warn!(error = %e, "failed to persist adopted order");
                }
                return OrderResult::ok(existing.order_id);
            }
            Ok(None) => {}
            Err(e) => {
                // A failed lookup is not fatal: creation itself is
                // idempotent under the link id.
                debug!(error = %e, "venue lookup failed, proceeding to create");
            }
        }

        // --- Create ---------------------------------------------------------
        let req = CreateOrderRequest {
            category: "linear".to_string(),
            symbol: order.symbol.clone(),
            side: order.direction.order_side().to_string(),
            order_type: if limit_price.is_some() {
                OrderType::Limit.to_string()
            } else {
                OrderType::Market.to_string()
            },
            qty: format_qty(qty),
            price: limit_price.map(|p| format!("{p}")),
            time_in_force: order.time_in_force.to_string(),
            reduce_only: None,
            order_link_id: link_id.clone(),
        };

        match self.client.create_order(&req).await {
            Ok(created) => {
                let rec = self.record_for(order, &created.order_id, &link_id, qty, limit_price);
                if let Err(e) = self.store.insert_order(&rec) {
                    warn!(error = %e, order_id = %created.order_id, "order persisted on venue but not locally");
                }
                info!(
                    symbol = %order.symbol,
                    side = %req.side,
                    qty = %req.qty,
                    order_id = %created.order_id,
                    order_link_id = %created.order_link_id,
                    "order created"
                );
                let raw = serde_json::json!({
                    "orderId": created.order_id,
                    "orderLinkId": created.order_link_id,
                });
                OrderResult::ok(created.order_id).with_raw(raw)
            }
            Err(EngineError::DuplicateOrder(msg)) => {
                // The venue saw the link id land twice; adopt the original.
                info!(order_link_id = %link_id, msg, "venue reports duplicate — adopting existing");
                match self
                    .client
                    .find_order_by_link_id(&order.symbol, &link_id)
                    .await
                {
                    Ok(Some(existing)) => OrderResult::ok(existing.order_id),
                    _ => OrderResult::fail(&EngineError::DuplicateOrder(link_id)),
                }
            }
            Err(e) => {
                warn!(symbol = %order.symbol, error = %e, "order creation failed");
                OrderResult::fail(&e)
            }
        }
    }

    /// Submit a reduce-only market close.
    pub async fn submit_close(
        &self,
        symbol: &str,
        close_side: Side,
        qty: f64,
        exit_reason: &str,
        ts_secs: i64,
    ) -> OrderResult {
        let instrument = match self.registry.get(symbol) {
            Ok(i) => i,
            Err(e) => return OrderResult::fail(&e),
        };
        let qty = instrument.round_qty(qty);
        if qty <= 0.0 {
            return OrderResult::fail(&EngineError::InvalidSize(format!(
                "{symbol}: close qty rounds to zero"
            )));
        }

        let direction = match close_side {
            Side::Sell => Direction::CloseLong,
            Side::Buy => Direction::CloseShort,
        };
        let link_id = order_link_id(exit_reason, symbol, ts_secs, self.bucket_seconds, direction);

        let req = CreateOrderRequest {
            category: "linear".to_string(),
            symbol: symbol.to_string(),
            side: close_side.to_string(),
            order_type: OrderType::Market.to_string(),
            qty: format_qty(qty),
            price: None,
            time_in_force: TimeInForce::Ioc.to_string(),
            reduce_only: Some(true),
            order_link_id: link_id.clone(),
        };

        match self.client.create_order(&req).await {
            Ok(created) => {
                let rec = OrderRecord {
                    order_id: created.order_id.clone(),
                    order_link_id: link_id,
                    symbol: symbol.to_string(),
                    side: close_side.to_string(),
                    order_type: OrderType::Market.to_string(),
                    qty,
                    price: None,
                    time_in_force: TimeInForce::Ioc.to_string(),
                    reduce_only: true,
                    status: "New".to_string(),
                    created_at: Utc::now().to_rfc3339(),
                    updated_at: Utc::now().to_rfc3339(),
                };
                if let Err(e) = self.store.insert_order_if_absent(&rec) {
                    warn!(error = %e, "failed to persist close order");
                }
                info!(symbol, side = %close_side, qty, exit_reason, "close order created");
                OrderResult::ok(created.order_id)
            }
            Err(e) => {
                warn!(symbol, error = %e, "close order failed");
                OrderResult::fail(&e)
            }
        }
    }

    /// Cancel one order.
    pub async fn cancel(&self, symbol: &str, order_id: &str) -> OrderResult {
        match self.client.cancel_order(symbol, order_id).await {
            Ok(()) => {
                if let Err(e) = self
                    .store
                    .update_order_status(order_id, crate::types::OrderStatus::Cancelled)
                {
                    warn!(error = %e, order_id, "cancelled on venue but not locally");
                }
                OrderResult::ok(order_id)
            }
            Err(e) => OrderResult::fail(&e),
        }
    }

    fn record_for(
        &self,
        order: &EntryOrder,
        order_id: &str,
        link_id: &str,
        qty: f64,
        limit_price: Option<f64>,
    ) -> OrderRecord {
        let now = Utc::now().to_rfc3339();
        OrderRecord {
            order_id: order_id.to_string(),
            order_link_id: link_id.to_string(),
            symbol: order.symbol.clone(),
            side: order.direction.order_side().to_string(),
            order_type: if limit_price.is_some() {
                OrderType::Limit.to_string()
            } else {
                OrderType::Market.to_string()
            },
            qty,
            price: limit_price,
            time_in_force: order.time_in_force.to_string(),
            reduce_only: false,
            status: "New".to_string(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Trim trailing float noise from step-rounded quantities.
fn format_qty(qty: f64) -> String {
    let s = format!("{qty:.8}");
    s.trim_end_matches('0').trim_end_matches('.').to_string()
}
