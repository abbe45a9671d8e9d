// =============================================================================
// Reconciliation service — bring local state into agreement with the venue
// =============================================================================
//
// Runs synchronously before a live bot starts trading and then on its own
// interval. The venue is authoritative:
//
//   positions  — missing locally -> add; missing on venue -> close locally;
//                size/entry drift -> overwrite local
//   orders     — active locally but gone on venue -> mark cancelled;
//                on venue but unknown locally -> insert
//   executions — last N fetched, unseen exec ids inserted
//
// Every correction logs a WARNING. A failed cycle is logged and retried on
// the next interval; it never crashes the bot.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::errors::EngineResult;
use crate::exchange::BybitClient;
use crate::positions::PositionManager;
use crate::store::{ExecutionRecord, OrderRecord, PositionRecord, Store};
use crate::types::OrderStatus;

/// Counters from one reconciliation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub positions_added: u32,
    pub positions_closed: u32,
    pub positions_overwritten: u32,
    pub orders_cancelled: u32,
    pub orders_inserted: u32,
    pub executions_inserted: u32,
    pub timestamp: String,
}

pub struct ReconciliationService {
    client: Arc<BybitClient>,
    store: Arc<Store>,
    positions: Arc<PositionManager>,
    symbol: String,
    executions_lookback: u32,
}

impl ReconciliationService {
    pub fn new(
        client: Arc<BybitClient>,
        store: Arc<Store>,
        positions: Arc<PositionManager>,
        symbol: &str,
        executions_lookback: u32,
    ) -> Self {
        Self {
            client,
            store,
            positions,
            symbol: symbol.to_string(),
            executions_lookback,
        }
    }

    /// One full pass: positions, open orders, executions.
    pub async fn run_once(&self) -> EngineResult<ReconcileSummary> {
        let mut summary = ReconcileSummary {
            timestamp: Utc::now().to_rfc3339(),
            ..Default::default()
        };

        self.reconcile_positions(&mut summary).await?;
        self.reconcile_orders(&mut summary).await?;
        self.reconcile_executions(&mut summary).await?;

        info!(
            symbol = %self.symbol,
            positions_added = summary.positions_added,
            positions_closed = summary.positions_closed,
            positions_overwritten = summary.positions_overwritten,
            orders_cancelled = summary.orders_cancelled,
            orders_inserted = summary.orders_inserted,
            executions_inserted = summary.executions_inserted,
            "reconciliation pass complete"
        );
        Ok(summary)
    }

    async fn reconcile_positions(&self, summary: &mut ReconcileSummary) -> EngineResult<()> {
        let venue_positions = self.client.get_positions(&self.symbol).await?;
        let local = self.positions.get(&self.symbol);

        match (venue_positions.first(), local) {
            (Some(venue), None) => {
                warn!(
                    symbol = %self.symbol,
                    size = venue.size,
                    entry = venue.entry_price,
                    "venue position missing locally — adding"
                );
                self.positions.set_from_venue(venue);
                self.persist_position(venue)?;
                summary.positions_added += 1;
            }
            (None, Some(_)) => {
                warn!(symbol = %self.symbol, "local position missing on venue — closing locally");
                self.positions.close_local(&self.symbol);
                self.store.delete_position(&self.symbol)?;
                summary.positions_closed += 1;
            }
            (Some(venue), Some(local)) => {
                let size_drift = (venue.size - local.size).abs() > 1e-12;
                let entry_drift = (venue.entry_price - local.entry_price).abs() > 1e-9;
                if size_drift || entry_drift {
                    warn!(
                        symbol = %self.symbol,
                        local_size = local.size,
                        venue_size = venue.size,
                        local_entry = local.entry_price,
                        venue_entry = venue.entry_price,
                        "position drift — overwriting local with venue state"
                    );
                    self.positions.set_from_venue(venue);
                    self.persist_position(venue)?;
                    summary.positions_overwritten += 1;
                } else {
                    // Keep mark/uPnL fresh even without drift.
                    if let Some(mark) = venue.mark_price {
                        self.positions
                            .update_mark(&self.symbol, mark, venue.unrealised_pnl);
                    }
                }
            }
            (None, None) => {}
        }
        Ok(())
    }

    async fn reconcile_orders(&self, summary: &mut ReconcileSummary) -> EngineResult<()> {
        let venue_orders = self.client.get_open_orders(&self.symbol).await?;
        let local_open = self.store.open_orders(&self.symbol)?;

        let venue_ids: std::collections::HashSet<&str> = venue_orders
            .iter()
            .map(|o| o.order_id.as_str())
            .collect();

        // Locally active but gone on the venue: cancelled (or filled and the
        // stream missed it; the execution pass below repairs fills).
        for order in &local_open {
            if !venue_ids.contains(order.order_id.as_str()) {
                warn!(
                    symbol = %self.symbol,
                    order_id = %order.order_id,
                    "local open order not on venue — marking cancelled"
                );
                self.store
                    .update_order_status(&order.order_id, OrderStatus::Cancelled)?;
                summary.orders_cancelled += 1;
            }
        }

        // On the venue but unknown locally: insert.
        for order in &venue_orders {
            let known = self
                .store
                .find_order_by_link_id(&order.order_link_id)?
                .is_some();
            if !known {
                warn!(
                    symbol = %self.symbol,
                    order_id = %order.order_id,
                    order_link_id = %order.order_link_id,
                    "venue order unknown locally — inserting"
                );
                let now = Utc::now().to_rfc3339();
                let inserted = self.store.insert_order_if_absent(&OrderRecord {
                    order_id: order.order_id.clone(),
                    order_link_id: if order.order_link_id.is_empty() {
                        // External orders may carry no link id; synthesize a
                        // unique one so the constraint holds.
                        format!("ext_{}", order.order_id)
                    } else {
                        order.order_link_id.clone()
                    },
                    symbol: order.symbol.clone(),
                    side: order.side.clone(),
                    order_type: order.order_type.clone(),
                    qty: order.qty,
                    price: order.price,
                    time_in_force: "GTC".to_string(),
                    reduce_only: order.reduce_only,
                    status: OrderStatus::from_wire(&order.status).to_string(),
                    created_at: now.clone(),
                    updated_at: now,
                })?;
                if inserted {
                    summary.orders_inserted += 1;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_executions(&self, summary: &mut ReconcileSummary) -> EngineResult<()> {
        let executions = self
            .client
            .get_executions(&self.symbol, self.executions_lookback)
            .await?;

        for exec in &executions {
            let rec = ExecutionRecord {
                exec_id: exec.exec_id.clone(),
                order_id: exec.order_id.clone(),
                symbol: exec.symbol.clone(),
                side: exec.side.clone(),
                price: exec.price,
                qty: exec.qty,
                fee: exec.fee,
                is_maker: exec.is_maker,
                exec_time: exec.exec_time,
                closed_pnl: exec.closed_pnl,
            };
            if self.store.insert_execution_if_absent(&rec)? {
                warn!(
                    symbol = %self.symbol,
                    exec_id = %exec.exec_id,
                    "execution missing locally — inserted"
                );
                summary.executions_inserted += 1;
            }
        }
        debug!(symbol = %self.symbol, fetched = executions.len(), "executions reconciled");
        Ok(())
    }

    fn persist_position(&self, venue: &crate::exchange::VenuePosition) -> EngineResult<()> {
        let side = match venue.side.as_str() {
            "Buy" => "long",
            "Sell" => "short",
            _ => "flat",
        };
        self.store.upsert_position(&PositionRecord {
            symbol: venue.symbol.clone(),
            side: side.to_string(),
            size: venue.size,
            entry_price: venue.entry_price,
            leverage: venue.leverage,
            updated_at: Utc::now().to_rfc3339(),
        })?;
        Ok(())
    }

    /// Background loop. Failures are logged and retried next interval.
    pub async fn run(self: Arc<Self>, interval_secs: u64, stop: Arc<AtomicBool>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_secs.max(1)));
        info!(symbol = %self.symbol, interval_secs, "reconciliation service started");
        loop {
            interval.tick().await;
            if stop.load(Ordering::Relaxed) {
                info!(symbol = %self.symbol, "reconciliation service stopping");
                return;
            }
            if let Err(e) = self.run_once().await {
                warn!(symbol = %self.symbol, error = %e, "reconciliation failed — will retry");
            }
        }
    }
}
