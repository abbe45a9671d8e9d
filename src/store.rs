// =============================================================================
// Persistent store — single-connection SQLite with WAL
// =============================================================================
//
// One process-wide connection in WAL mode with a 5 s busy timeout. Every
// write goes through the store mutex, serializing writers so the per-symbol
// tasks never observe `database is locked`. Natural keys carry UNIQUE
// constraints (order_id, order_link_id, exec_id) so reconciliation inserts
// are idempotent.
//
// The config table doubles as the kill switch's persistent home:
// `trading_disabled` lives here, activation rows live in `errors`.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::types::OrderStatus;

/// Busy timeout applied to the shared connection.
const BUSY_TIMEOUT_MS: u64 = 5_000;

pub struct Store {
    conn: Mutex<Connection>,
}

// -----------------------------------------------------------------------------
// Records
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub order_link_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub qty: f64,
    pub price: Option<f64>,
    pub time_in_force: String,
    pub reduce_only: bool,
    pub status: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: String,
    pub symbol: String,
    pub strategy: String,
    pub direction: String,
    /// "ACCEPTED" or "REJECTED".
    pub stage: String,
    pub reason: Option<String>,
    pub confidence: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub entry_price: f64,
    pub leverage: f64,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlTpRecord {
    pub position_id: String,
    pub symbol: String,
    pub side: String,
    pub entry: f64,
    pub qty: f64,
    pub atr: Option<f64>,
    pub sl: f64,
    pub tp: f64,
    pub closed_qty: f64,
    pub sl_hit: bool,
    pub tp_hit: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntentRecord {
    pub id: String,
    pub symbol: String,
    pub side: String,
    pub price: f64,
    pub qty: f64,
    pub leverage: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub strategy: String,
    pub regime: String,
    pub atr: Option<f64>,
    pub final_score: f64,
    /// JSON blob of the hygiene decisions behind the intent.
    pub hygiene: String,
    pub created_at: String,
}

// -----------------------------------------------------------------------------
// Construction
// -----------------------------------------------------------------------------

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).context("open store")?;
        Self::init(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))
            .context("set busy timeout")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS orders (
                order_id        TEXT NOT NULL UNIQUE,
                order_link_id   TEXT NOT NULL UNIQUE,
                symbol          TEXT NOT NULL,
                side            TEXT NOT NULL,
                order_type      TEXT NOT NULL,
                qty             REAL NOT NULL,
                price           REAL,
                time_in_force   TEXT NOT NULL,
                reduce_only     INTEGER NOT NULL,
                status          TEXT NOT NULL,
                created_at      TEXT NOT NULL,
                updated_at      TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_symbol_status ON orders(symbol, status);

            CREATE TABLE IF NOT EXISTS executions (
                exec_id     TEXT PRIMARY KEY,
                order_id    TEXT NOT NULL,
                symbol      TEXT NOT NULL,
                side        TEXT NOT NULL,
                price       REAL NOT NULL,
                qty         REAL NOT NULL,
                fee         REAL NOT NULL,
                is_maker    INTEGER NOT NULL,
                exec_time   INTEGER NOT NULL,
                closed_pnl  REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_executions_symbol_time ON executions(symbol, exec_time DESC);

            CREATE TABLE IF NOT EXISTS signals (
                id          TEXT PRIMARY KEY,
                symbol      TEXT NOT NULL,
                strategy    TEXT NOT NULL,
                direction   TEXT NOT NULL,
                stage       TEXT NOT NULL,
                reason      TEXT,
                confidence  REAL NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_signals_symbol_created ON signals(symbol, created_at DESC);

            CREATE TABLE IF NOT EXISTS positions (
                symbol      TEXT PRIMARY KEY,
                side        TEXT NOT NULL,
                size        REAL NOT NULL,
                entry_price REAL NOT NULL,
                leverage    REAL NOT NULL,
                updated_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sl_tp_levels (
                position_id TEXT PRIMARY KEY,
                symbol      TEXT NOT NULL,
                side        TEXT NOT NULL,
                entry       REAL NOT NULL,
                qty         REAL NOT NULL,
                atr         REAL,
                sl          REAL NOT NULL,
                tp          REAL NOT NULL,
                closed_qty  REAL NOT NULL DEFAULT 0,
                sl_hit      INTEGER NOT NULL DEFAULT 0,
                tp_hit      INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS order_intents (
                id          TEXT PRIMARY KEY,
                symbol      TEXT NOT NULL,
                side        TEXT NOT NULL,
                price       REAL NOT NULL,
                qty         REAL NOT NULL,
                leverage    REAL NOT NULL,
                stop_loss   REAL NOT NULL,
                take_profit REAL NOT NULL,
                strategy    TEXT NOT NULL,
                regime      TEXT NOT NULL,
                atr         REAL,
                final_score REAL NOT NULL,
                hygiene     TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_order_intents_created ON order_intents(created_at DESC);

            CREATE TABLE IF NOT EXISTS errors (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                kind        TEXT NOT NULL,
                message     TEXT NOT NULL,
                reset_at    TEXT,
                created_at  TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_errors_kind ON errors(kind, reset_at);

            CREATE TABLE IF NOT EXISTS config (
                key         TEXT PRIMARY KEY,
                value       TEXT NOT NULL,
                _version    INTEGER NOT NULL DEFAULT 1,
                _updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS instruments (
                symbol        TEXT PRIMARY KEY,
                tick_size     REAL NOT NULL,
                qty_step      REAL NOT NULL,
                min_order_qty REAL NOT NULL,
                max_order_qty REAL NOT NULL,
                min_notional  REAL NOT NULL,
                updated_at    TEXT NOT NULL
            );",
        )
        .context("create tables")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn insert_order(&self, rec: &OrderRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders (order_id, order_link_id, symbol, side, order_type, qty, price,
                                 time_in_force, reduce_only, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rec.order_id,
                rec.order_link_id,
                rec.symbol,
                rec.side,
                rec.order_type,
                rec.qty,
                rec.price,
                rec.time_in_force,
                rec.reduce_only as i64,
                rec.status,
                rec.created_at,
                rec.updated_at,
            ],
        )
        .context("insert order")?;
        Ok(())
    }

    /// Insert ignoring duplicates (reconciliation path). Returns true when a
    /// new row was written.
    pub fn insert_order_if_absent(&self, rec: &OrderRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO orders (order_id, order_link_id, symbol, side, order_type,
                     qty, price, time_in_force, reduce_only, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    rec.order_id,
                    rec.order_link_id,
                    rec.symbol,
                    rec.side,
                    rec.order_type,
                    rec.qty,
                    rec.price,
                    rec.time_in_force,
                    rec.reduce_only as i64,
                    rec.status,
                    rec.created_at,
                    rec.updated_at,
                ],
            )
            .context("insert order if absent")?;
        Ok(n > 0)
    }

    pub fn find_order_by_link_id(&self, order_link_id: &str) -> Result<Option<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, order_link_id, symbol, side, order_type, qty, price,
                    time_in_force, reduce_only, status, created_at, updated_at
             FROM orders WHERE order_link_id = ?1",
        )?;
        let rec = stmt
            .query_row(params![order_link_id], row_to_order)
            .optional()
            .context("find order by link id")?;
        Ok(rec)
    }

    pub fn update_order_status(&self, order_id: &str, status: OrderStatus) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = ?2, updated_at = ?3 WHERE order_id = ?1",
            params![order_id, status.to_string(), now()],
        )
        .context("update order status")?;
        Ok(())
    }

    pub fn open_orders(&self, symbol: &str) -> Result<Vec<OrderRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT order_id, order_link_id, symbol, side, order_type, qty, price,
                    time_in_force, reduce_only, status, created_at, updated_at
             FROM orders WHERE symbol = ?1 AND status IN ('New', 'PartiallyFilled')",
        )?;
        let rows = stmt
            .query_map(params![symbol], row_to_order)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query open orders")?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Executions
    // -------------------------------------------------------------------------

    /// Insert unless the exec_id is already present. Returns true when new.
    pub fn insert_execution_if_absent(&self, rec: &ExecutionRecord) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn
            .execute(
                "INSERT OR IGNORE INTO executions (exec_id, order_id, symbol, side, price, qty,
                     fee, is_maker, exec_time, closed_pnl)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    rec.exec_id,
                    rec.order_id,
                    rec.symbol,
                    rec.side,
                    rec.price,
                    rec.qty,
                    rec.fee,
                    rec.is_maker as i64,
                    rec.exec_time,
                    rec.closed_pnl,
                ],
            )
            .context("insert execution")?;
        Ok(n > 0)
    }

    pub fn executions_since(&self, symbol: &str, since_ms: i64) -> Result<Vec<ExecutionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT exec_id, order_id, symbol, side, price, qty, fee, is_maker, exec_time, closed_pnl
             FROM executions WHERE symbol = ?1 AND exec_time >= ?2 ORDER BY exec_time ASC",
        )?;
        let rows = stmt
            .query_map(params![symbol, since_ms], |row| {
                Ok(ExecutionRecord {
                    exec_id: row.get(0)?,
                    order_id: row.get(1)?,
                    symbol: row.get(2)?,
                    side: row.get(3)?,
                    price: row.get(4)?,
                    qty: row.get(5)?,
                    fee: row.get(6)?,
                    is_maker: row.get::<_, i64>(7)? != 0,
                    exec_time: row.get(8)?,
                    closed_pnl: row.get(9)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query executions")?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Signals
    // -------------------------------------------------------------------------

    pub fn insert_signal(&self, rec: &SignalRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO signals (id, symbol, strategy, direction, stage, reason, confidence, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                rec.id,
                rec.symbol,
                rec.strategy,
                rec.direction,
                rec.stage,
                rec.reason,
                rec.confidence,
                rec.created_at,
            ],
        )
        .context("insert signal")?;
        Ok(())
    }

    pub fn recent_signals(&self, symbol: &str, limit: usize) -> Result<Vec<SignalRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, symbol, strategy, direction, stage, reason, confidence, created_at
             FROM signals WHERE symbol = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![symbol, limit as i64], |row| {
                Ok(SignalRecord {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    strategy: row.get(2)?,
                    direction: row.get(3)?,
                    stage: row.get(4)?,
                    reason: row.get(5)?,
                    confidence: row.get(6)?,
                    created_at: row.get(7)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("query signals")?;
        Ok(rows)
    }

    // -------------------------------------------------------------------------
    // Positions
    // -------------------------------------------------------------------------

    pub fn upsert_position(&self, rec: &PositionRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO positions (symbol, side, size, entry_price, leverage, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(symbol) DO UPDATE SET
                side = excluded.side, size = excluded.size,
                entry_price = excluded.entry_price, leverage = excluded.leverage,
                updated_at = excluded.updated_at",
            params![
                rec.symbol,
                rec.side,
                rec.size,
                rec.entry_price,
                rec.leverage,
                rec.updated_at,
            ],
        )
        .context("upsert position")?;
        Ok(())
    }

    pub fn delete_position(&self, symbol: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM positions WHERE symbol = ?1", params![symbol])
            .context("delete position")?;
        Ok(())
    }

    pub fn get_position(&self, symbol: &str) -> Result<Option<PositionRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, side, size, entry_price, leverage, updated_at
             FROM positions WHERE symbol = ?1",
        )?;
        let rec = stmt
            .query_row(params![symbol], |row| {
                Ok(PositionRecord {
                    symbol: row.get(0)?,
                    side: row.get(1)?,
                    size: row.get(2)?,
                    entry_price: row.get(3)?,
                    leverage: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })
            .optional()
            .context("get position")?;
        Ok(rec)
    }

    // -------------------------------------------------------------------------
    // SL/TP levels
    // -------------------------------------------------------------------------

    pub fn insert_sl_tp(&self, rec: &SlTpRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sl_tp_levels (position_id, symbol, side, entry, qty, atr,
                 sl, tp, closed_qty, sl_hit, tp_hit, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                rec.position_id,
                rec.symbol,
                rec.side,
                rec.entry,
                rec.qty,
                rec.atr,
                rec.sl,
                rec.tp,
                rec.closed_qty,
                rec.sl_hit as i64,
                rec.tp_hit as i64,
                rec.created_at,
            ],
        )
        .context("insert sl_tp level")?;
        Ok(())
    }

    pub fn update_sl(&self, position_id: &str, sl: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sl_tp_levels SET sl = ?2 WHERE position_id = ?1",
            params![position_id, sl],
        )
        .context("update sl")?;
        Ok(())
    }

    pub fn mark_sl_tp_hit(&self, position_id: &str, sl_hit: bool, tp_hit: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sl_tp_levels SET sl_hit = ?2, tp_hit = ?3 WHERE position_id = ?1",
            params![position_id, sl_hit as i64, tp_hit as i64],
        )
        .context("mark sl_tp hit")?;
        Ok(())
    }

    pub fn add_closed_qty(&self, position_id: &str, qty: f64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE sl_tp_levels SET closed_qty = closed_qty + ?2 WHERE position_id = ?1",
            params![position_id, qty],
        )
        .context("add closed qty")?;
        Ok(())
    }

    pub fn get_sl_tp(&self, position_id: &str) -> Result<Option<SlTpRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT position_id, symbol, side, entry, qty, atr, sl, tp, closed_qty,
                    sl_hit, tp_hit, created_at
             FROM sl_tp_levels WHERE position_id = ?1",
        )?;
        let rec = stmt
            .query_row(params![position_id], |row| {
                Ok(SlTpRecord {
                    position_id: row.get(0)?,
                    symbol: row.get(1)?,
                    side: row.get(2)?,
                    entry: row.get(3)?,
                    qty: row.get(4)?,
                    atr: row.get(5)?,
                    sl: row.get(6)?,
                    tp: row.get(7)?,
                    closed_qty: row.get(8)?,
                    sl_hit: row.get::<_, i64>(9)? != 0,
                    tp_hit: row.get::<_, i64>(10)? != 0,
                    created_at: row.get(11)?,
                })
            })
            .optional()
            .context("get sl_tp")?;
        Ok(rec)
    }

    // -------------------------------------------------------------------------
    // Order intents (dry-run audit trail, append-only)
    // -------------------------------------------------------------------------

    pub fn insert_order_intent(&self, rec: &OrderIntentRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO order_intents (id, symbol, side, price, qty, leverage, stop_loss,
                 take_profit, strategy, regime, atr, final_score, hygiene, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                rec.id,
                rec.symbol,
                rec.side,
                rec.price,
                rec.qty,
                rec.leverage,
                rec.stop_loss,
                rec.take_profit,
                rec.strategy,
                rec.regime,
                rec.atr,
                rec.final_score,
                rec.hygiene,
                rec.created_at,
            ],
        )
        .context("insert order intent")?;
        Ok(())
    }

    pub fn last_order_intent(&self, symbol: Option<&str>) -> Result<Option<OrderIntentRecord>> {
        let conn = self.conn.lock();
        let map = |row: &rusqlite::Row<'_>| {
            Ok(OrderIntentRecord {
                id: row.get(0)?,
                symbol: row.get(1)?,
                side: row.get(2)?,
                price: row.get(3)?,
                qty: row.get(4)?,
                leverage: row.get(5)?,
                stop_loss: row.get(6)?,
                take_profit: row.get(7)?,
                strategy: row.get(8)?,
                regime: row.get(9)?,
                atr: row.get(10)?,
                final_score: row.get(11)?,
                hygiene: row.get(12)?,
                created_at: row.get(13)?,
            })
        };
        let rec = match symbol {
            Some(sym) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, symbol, side, price, qty, leverage, stop_loss, take_profit,
                            strategy, regime, atr, final_score, hygiene, created_at
                     FROM order_intents WHERE symbol = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                )?;
                stmt.query_row(params![sym], map).optional()
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, symbol, side, price, qty, leverage, stop_loss, take_profit,
                            strategy, regime, atr, final_score, hygiene, created_at
                     FROM order_intents ORDER BY created_at DESC, rowid DESC LIMIT 1",
                )?;
                stmt.query_row([], map).optional()
            }
        }
        .context("last order intent")?;
        Ok(rec)
    }

    pub fn order_intent_count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM order_intents", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    // -------------------------------------------------------------------------
    // Errors + kill-switch rows
    // -------------------------------------------------------------------------

    pub fn log_error(&self, kind: &str, message: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO errors (kind, message, created_at) VALUES (?1, ?2, ?3)",
            params![kind, message, now()],
        )
        .context("log error")?;
        Ok(())
    }

    /// Count `kill_switch_activated` rows that have not been reset.
    pub fn unreset_kill_rows(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM errors WHERE kind = 'kill_switch_activated' AND reset_at IS NULL",
            [],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    }

    pub fn mark_kill_rows_reset(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE errors SET reset_at = ?1
             WHERE kind = 'kill_switch_activated' AND reset_at IS NULL",
            params![now()],
        )
        .context("mark kill rows reset")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Config key/value
    // -------------------------------------------------------------------------

    pub fn config_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        let v = conn
            .query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![key],
                |r| r.get::<_, String>(0),
            )
            .optional()
            .context("config get")?;
        Ok(v)
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO config (key, value, _version, _updated_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                _version = config._version + 1,
                _updated_at = excluded._updated_at",
            params![key, value, now()],
        )
        .context("config set")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Instruments cache
    // -------------------------------------------------------------------------

    pub fn upsert_instrument(&self, inst: &crate::instruments::Instrument) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO instruments (symbol, tick_size, qty_step, min_order_qty,
                 max_order_qty, min_notional, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(symbol) DO UPDATE SET
                tick_size = excluded.tick_size, qty_step = excluded.qty_step,
                min_order_qty = excluded.min_order_qty,
                max_order_qty = excluded.max_order_qty,
                min_notional = excluded.min_notional,
                updated_at = excluded.updated_at",
            params![
                inst.symbol,
                inst.tick_size,
                inst.qty_step,
                inst.min_order_qty,
                inst.max_order_qty,
                inst.min_notional,
                now(),
            ],
        )
        .context("upsert instrument")?;
        Ok(())
    }

    /// Cached instrument metadata, used when the venue is unreachable at
    /// startup.
    pub fn get_instrument(&self, symbol: &str) -> Result<Option<crate::instruments::Instrument>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT symbol, tick_size, qty_step, min_order_qty, max_order_qty, min_notional
             FROM instruments WHERE symbol = ?1",
        )?;
        let rec = stmt
            .query_row(params![symbol], |row| {
                Ok(crate::instruments::Instrument {
                    symbol: row.get(0)?,
                    tick_size: row.get(1)?,
                    qty_step: row.get(2)?,
                    min_order_qty: row.get(3)?,
                    max_order_qty: row.get(4)?,
                    min_notional: row.get(5)?,
                })
            })
            .optional()
            .context("get instrument")?;
        Ok(rec)
    }

    /// Atomically clear the kill switch: flips `trading_disabled` to false
    /// and stamps every open activation row in one transaction.
    pub fn clear_kill_switch(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("begin kill-switch reset")?;
        tx.execute(
            "INSERT INTO config (key, value, _version, _updated_at)
             VALUES ('trading_disabled', 'false', 1, ?1)
             ON CONFLICT(key) DO UPDATE SET
                value = 'false',
                _version = config._version + 1,
                _updated_at = excluded._updated_at",
            params![now()],
        )?;
        tx.execute(
            "UPDATE errors SET reset_at = ?1
             WHERE kind = 'kill_switch_activated' AND reset_at IS NULL",
            params![now()],
        )?;
        tx.commit().context("commit kill-switch reset")?;
        Ok(())
    }
}

fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    Ok(OrderRecord {
        order_id: row.get(0)?,
        order_link_id: row.get(1)?,
        symbol: row.get(2)?,
        side: row.get(3)?,
        order_type: row.get(4)?,
        qty: row.get(5)?,
        price: row.get(6)?,
        time_in_force: row.get(7)?,
        reduce_only: row.get::<_, i64>(8)? != 0,
        status: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn order(link_id: &str) -> OrderRecord {
        OrderRecord {
            order_id: format!("venue-{link_id}"),
            order_link_id: link_id.to_string(),
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            order_type: "Market".into(),
            qty: 0.01,
            price: None,
            time_in_force: "GTC".into(),
            reduce_only: false,
            status: "New".into(),
            created_at: now(),
            updated_at: now(),
        }
    }

    #[test]
    fn order_link_id_is_unique() {
        let store = Store::open_in_memory().unwrap();
        store.insert_order(&order("abc")).unwrap();
        assert!(store.insert_order(&order("abc")).is_err());
        assert!(!store.insert_order_if_absent(&order("abc")).unwrap());
        let found = store.find_order_by_link_id("abc").unwrap().unwrap();
        assert_eq!(found.order_id, "venue-abc");
    }

    #[test]
    fn order_status_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        store.insert_order(&order("x")).unwrap();
        assert_eq!(store.open_orders("BTCUSDT").unwrap().len(), 1);
        store
            .update_order_status("venue-x", OrderStatus::Filled)
            .unwrap();
        assert!(store.open_orders("BTCUSDT").unwrap().is_empty());
    }

    #[test]
    fn execution_dedup_by_exec_id() {
        let store = Store::open_in_memory().unwrap();
        let exec = ExecutionRecord {
            exec_id: "e1".into(),
            order_id: "o1".into(),
            symbol: "BTCUSDT".into(),
            side: "Buy".into(),
            price: 50_000.0,
            qty: 0.01,
            fee: 0.05,
            is_maker: false,
            exec_time: 1_700_000_000_000,
            closed_pnl: 0.0,
        };
        assert!(store.insert_execution_if_absent(&exec).unwrap());
        assert!(!store.insert_execution_if_absent(&exec).unwrap());
        let rows = store.executions_since("BTCUSDT", 0).unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_maker);
    }

    #[test]
    fn position_upsert_and_delete() {
        let store = Store::open_in_memory().unwrap();
        let rec = PositionRecord {
            symbol: "BTCUSDT".into(),
            side: "long".into(),
            size: 0.01,
            entry_price: 50_000.0,
            leverage: 3.0,
            updated_at: now(),
        };
        store.upsert_position(&rec).unwrap();
        let mut rec2 = rec.clone();
        rec2.size = 0.02;
        store.upsert_position(&rec2).unwrap();
        assert_eq!(store.get_position("BTCUSDT").unwrap().unwrap().size, 0.02);
        store.delete_position("BTCUSDT").unwrap();
        assert!(store.get_position("BTCUSDT").unwrap().is_none());
    }

    #[test]
    fn sl_tp_partial_close_accounting() {
        let store = Store::open_in_memory().unwrap();
        let rec = SlTpRecord {
            position_id: "p1".into(),
            symbol: "BTCUSDT".into(),
            side: "long".into(),
            entry: 50_000.0,
            qty: 0.02,
            atr: Some(500.0),
            sl: 49_250.0,
            tp: 51_000.0,
            closed_qty: 0.0,
            sl_hit: false,
            tp_hit: false,
            created_at: now(),
        };
        store.insert_sl_tp(&rec).unwrap();
        store.add_closed_qty("p1", 0.01).unwrap();
        store.update_sl("p1", 50_500.0).unwrap();
        let got = store.get_sl_tp("p1").unwrap().unwrap();
        assert!((got.closed_qty - 0.01).abs() < 1e-9);
        assert!((got.sl - 50_500.0).abs() < 1e-9);
    }

    #[test]
    fn last_order_intent_returns_newest() {
        let store = Store::open_in_memory().unwrap();
        for (i, sym) in ["BTCUSDT", "ETHUSDT", "BTCUSDT"].iter().enumerate() {
            store
                .insert_order_intent(&OrderIntentRecord {
                    id: format!("i{i}"),
                    symbol: sym.to_string(),
                    side: "Buy".into(),
                    price: 50_000.0 + i as f64,
                    qty: 0.01,
                    leverage: 3.0,
                    stop_loss: 49_000.0,
                    take_profit: 51_000.0,
                    strategy: "trend_pullback".into(),
                    regime: "trend_up".into(),
                    atr: Some(500.0),
                    final_score: 0.8,
                    hygiene: "{}".into(),
                    created_at: format!("2026-01-01T00:00:0{i}Z"),
                })
                .unwrap();
        }
        let last = store.last_order_intent(None).unwrap().unwrap();
        assert_eq!(last.id, "i2");
        let last_eth = store.last_order_intent(Some("ETHUSDT")).unwrap().unwrap();
        assert_eq!(last_eth.id, "i1");
        assert_eq!(store.order_intent_count().unwrap(), 3);
    }

    #[test]
    fn instrument_cache_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let inst = crate::instruments::Instrument {
            symbol: "BTCUSDT".into(),
            tick_size: 0.1,
            qty_step: 0.001,
            min_order_qty: 0.001,
            max_order_qty: 100.0,
            min_notional: 5.0,
        };
        store.upsert_instrument(&inst).unwrap();
        let cached = store.get_instrument("BTCUSDT").unwrap().unwrap();
        assert!((cached.tick_size - 0.1).abs() < 1e-12);
        assert!(store.get_instrument("ETHUSDT").unwrap().is_none());

        // Upsert refreshes in place.
        let mut inst2 = inst;
        inst2.min_notional = 10.0;
        store.upsert_instrument(&inst2).unwrap();
        let cached = store.get_instrument("BTCUSDT").unwrap().unwrap();
        assert!((cached.min_notional - 10.0).abs() < 1e-12);
    }

    #[test]
    fn kill_switch_rows_and_flag() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.unreset_kill_rows().unwrap(), 0);
        store
            .log_error("kill_switch_activated", "daily loss breached")
            .unwrap();
        store.config_set("trading_disabled", "true").unwrap();
        assert_eq!(store.unreset_kill_rows().unwrap(), 1);
        assert_eq!(
            store.config_get("trading_disabled").unwrap().as_deref(),
            Some("true")
        );

        store.clear_kill_switch().unwrap();
        assert_eq!(store.unreset_kill_rows().unwrap(), 0);
        assert_eq!(
            store.config_get("trading_disabled").unwrap().as_deref(),
            Some("false")
        );
    }
}
