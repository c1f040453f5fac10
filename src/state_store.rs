// =============================================================================
// Position State Store — externalized position lifecycle state
// =============================================================================
//
// The engine runs as short-lived stateless invocations, so everything a
// future invocation needs — exit levels, last-trade times, last signal
// strengths — lives in the remote ledger and nowhere else. This module is
// the only code that touches the ledger tables.
//
// Failure policy:
//   - Read failures degrade to "not found" (a position is treated as
//     unprotected rather than blocking the invocation).
//   - Write failures return `false`; the caller surfaces the trade as
//     executed-but-unprotected.
//   - A levels record with neither stop-loss nor take-profit is rejected
//     before it ever reaches the ledger.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::ledger::{Ledger, LEVELS_TABLE, SIGNALS_TABLE, TRADES_TABLE};
use crate::types::{OrderSide, PositionSide};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// The one live exit-level record for a symbol.
///
/// `expires_at` is a dead-man's-switch: once passed, the record is treated
/// as absent on read and deleted, regardless of what the broker reports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionLevels {
    pub symbol: String,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub entry_price: f64,
    pub side: PositionSide,
    pub quantity: u32,
    pub strategy: String,
    pub order_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Caller-supplied fields of a levels record; the store stamps the
/// timestamps.
#[derive(Debug, Clone)]
pub struct NewPositionLevels {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub entry_price: f64,
    pub side: PositionSide,
    pub quantity: u32,
    pub strategy: String,
    pub order_id: String,
}

/// Most recent executed trade for a symbol. Only the timestamp drives
/// logic (the cooldown); the rest is audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub symbol: String,
    pub side: OrderSide,
    pub strategy: String,
    pub quantity: u32,
    pub price: f64,
    pub order_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Most recent signal submitted for a symbol+side. `order_id` stays empty
/// until the resulting trade executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalRecord {
    pub symbol: String,
    pub side: PositionSide,
    pub strategy: String,
    pub signal_strength: f64,
    #[serde(default)]
    pub order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Diagnostic aggregate over the levels table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelsStats {
    pub total: usize,
    pub valid: usize,
    pub expired: usize,
    pub by_side: HashMap<String, usize>,
    pub by_strategy: HashMap<String, usize>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Domain operations over the ledger tables.
pub struct PositionStateStore {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl PositionStateStore {
    /// Create a store with the given record time-to-live.
    pub fn new(ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>, ttl_hours: i64) -> Self {
        Self {
            ledger,
            clock,
            ttl: Duration::hours(ttl_hours),
        }
    }

    fn normalize_symbol(symbol: &str) -> String {
        symbol.trim().to_uppercase()
    }

    fn signal_key(symbol: &str, side: PositionSide) -> String {
        format!("{}:{}", Self::normalize_symbol(symbol), side)
    }

    // -------------------------------------------------------------------------
    // Exit levels
    // -------------------------------------------------------------------------

    /// Persist exit levels for `symbol`, overwriting any live record.
    ///
    /// Stamps `created_at` and `expires_at`; rejects a record with neither
    /// stop-loss nor take-profit, or a zero quantity. Returns `false` on
    /// rejection or write failure — the caller must treat the position as
    /// unprotected.
    pub async fn store_levels(&self, symbol: &str, new: NewPositionLevels) -> bool {
        if new.stop_loss.is_none() && new.take_profit.is_none() {
            warn!(symbol, "rejecting levels record with neither stop-loss nor take-profit");
            return false;
        }
        if new.quantity == 0 {
            warn!(symbol, "rejecting levels record with zero quantity");
            return false;
        }

        let symbol = Self::normalize_symbol(symbol);
        let now = self.clock.now();
        let record = PositionLevels {
            symbol: symbol.clone(),
            stop_loss: new.stop_loss,
            take_profit: new.take_profit,
            entry_price: new.entry_price,
            side: new.side,
            quantity: new.quantity,
            strategy: new.strategy,
            order_id: new.order_id,
            created_at: now,
            expires_at: now + self.ttl,
        };

        let row = match serde_json::to_value(&record) {
            Ok(row) => row,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "failed to serialise levels record");
                return false;
            }
        };

        match self.ledger.put(LEVELS_TABLE, &symbol, row).await {
            Ok(()) => {
                info!(
                    symbol = %symbol,
                    side = %record.side,
                    stop_loss = ?record.stop_loss,
                    take_profit = ?record.take_profit,
                    expires_at = %record.expires_at,
                    "exit levels stored"
                );
                true
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "failed to store exit levels");
                false
            }
        }
    }

    /// Fetch the live levels record for `symbol`, if any.
    ///
    /// An expired record is treated as absent and deleted as a side effect
    /// (lazy expiry). Ledger read failures degrade to `None`.
    pub async fn get_levels(&self, symbol: &str) -> Option<PositionLevels> {
        let symbol = Self::normalize_symbol(symbol);

        let row = match self.ledger.get(LEVELS_TABLE, &symbol).await {
            Ok(row) => row?,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "levels read failed — treating as absent");
                return None;
            }
        };

        let record: PositionLevels = match serde_json::from_value(row) {
            Ok(record) => record,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "unparseable levels row — treating as absent");
                return None;
            }
        };

        if record.expires_at < self.clock.now() {
            info!(
                symbol = %symbol,
                expired_at = %record.expires_at,
                "levels record expired — discarding"
            );
            if let Err(e) = self.ledger.delete(LEVELS_TABLE, &symbol).await {
                debug!(symbol = %symbol, error = %e, "lazy expiry delete failed");
            }
            return None;
        }

        Some(record)
    }

    /// Delete the levels record for `symbol`.
    ///
    /// Idempotent: returns `true` whether or not a record existed; `false`
    /// only on a transport failure.
    pub async fn remove_levels(&self, symbol: &str) -> bool {
        let symbol = Self::normalize_symbol(symbol);
        match self.ledger.delete(LEVELS_TABLE, &symbol).await {
            Ok(()) => {
                debug!(symbol = %symbol, "exit levels removed");
                true
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "failed to remove exit levels");
                false
            }
        }
    }

    /// Every symbol with a stored levels row, expired rows included.
    ///
    /// Full-table scan — reconciliation sweeps only, never the hot path.
    pub async fn list_symbols(&self) -> Vec<String> {
        let rows = match self.ledger.scan_all(LEVELS_TABLE).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "levels scan failed — returning empty symbol list");
                return Vec::new();
            }
        };

        let mut symbols = Vec::new();
        for row in rows {
            if let Some(symbol) = row["symbol"].as_str() {
                let symbol = symbol.to_uppercase();
                if !symbols.contains(&symbol) {
                    symbols.push(symbol);
                }
            }
        }
        symbols
    }

    /// Aggregate view of the levels table for diagnostics.
    pub async fn stats(&self) -> LevelsStats {
        let now = self.clock.now();
        let rows = match self.ledger.scan_all(LEVELS_TABLE).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "levels scan failed — returning empty stats");
                return LevelsStats {
                    total: 0,
                    valid: 0,
                    expired: 0,
                    by_side: HashMap::new(),
                    by_strategy: HashMap::new(),
                };
            }
        };

        let mut stats = LevelsStats {
            total: rows.len(),
            valid: 0,
            expired: 0,
            by_side: HashMap::new(),
            by_strategy: HashMap::new(),
        };

        for row in rows {
            let record: PositionLevels = match serde_json::from_value(row) {
                Ok(record) => record,
                Err(_) => continue,
            };
            if record.expires_at < now {
                stats.expired += 1;
            } else {
                stats.valid += 1;
            }
            *stats.by_side.entry(record.side.to_string()).or_insert(0) += 1;
            *stats
                .by_strategy
                .entry(record.strategy.clone())
                .or_insert(0) += 1;
        }
        stats
    }

    // -------------------------------------------------------------------------
    // Trade state (cooldown input)
    // -------------------------------------------------------------------------

    /// Record an executed trade, stamping the timestamp. Returns `false` on
    /// write failure; the cooldown then has a gap the operator should know
    /// about.
    pub async fn record_trade(
        &self,
        symbol: &str,
        side: OrderSide,
        strategy: &str,
        quantity: u32,
        price: f64,
        order_id: &str,
    ) -> bool {
        let symbol = Self::normalize_symbol(symbol);
        let record = TradeRecord {
            symbol: symbol.clone(),
            side,
            strategy: strategy.to_string(),
            quantity,
            price,
            order_id: order_id.to_string(),
            timestamp: self.clock.now(),
        };

        let row = match serde_json::to_value(&record) {
            Ok(row) => row,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "failed to serialise trade record");
                return false;
            }
        };

        match self.ledger.put(TRADES_TABLE, &symbol, row).await {
            Ok(()) => {
                debug!(symbol = %symbol, side = %side, price, "trade recorded");
                true
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "failed to record trade");
                false
            }
        }
    }

    /// Most recent trade for `symbol`. Read failures degrade to `None`,
    /// which disables the cooldown for this invocation rather than
    /// blocking it.
    pub async fn last_trade(&self, symbol: &str) -> Option<TradeRecord> {
        let symbol = Self::normalize_symbol(symbol);
        let row = match self.ledger.get(TRADES_TABLE, &symbol).await {
            Ok(row) => row?,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "trade read failed — treating as absent");
                return None;
            }
        };

        match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "unparseable trade row — treating as absent");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Signal strength (re-entry gate input)
    // -------------------------------------------------------------------------

    /// Record the strength of a submitted signal, stamping the timestamp.
    pub async fn record_signal(
        &self,
        symbol: &str,
        side: PositionSide,
        strategy: &str,
        signal_strength: f64,
        order_id: Option<&str>,
    ) -> bool {
        let key = Self::signal_key(symbol, side);
        let record = SignalRecord {
            symbol: Self::normalize_symbol(symbol),
            side,
            strategy: strategy.to_string(),
            signal_strength,
            order_id: order_id.map(|s| s.to_string()),
            timestamp: self.clock.now(),
        };

        let row = match serde_json::to_value(&record) {
            Ok(row) => row,
            Err(e) => {
                error!(key = %key, error = %e, "failed to serialise signal record");
                return false;
            }
        };

        match self.ledger.put(SIGNALS_TABLE, &key, row).await {
            Ok(()) => {
                debug!(key = %key, signal_strength, "signal strength recorded");
                true
            }
            Err(e) => {
                error!(key = %key, error = %e, "failed to record signal strength");
                false
            }
        }
    }

    /// Most recent signal for `symbol` on `side`.
    pub async fn last_signal(&self, symbol: &str, side: PositionSide) -> Option<SignalRecord> {
        let key = Self::signal_key(symbol, side);
        let row = match self.ledger.get(SIGNALS_TABLE, &key).await {
            Ok(row) => row?,
            Err(e) => {
                warn!(key = %key, error = %e, "signal read failed — treating as absent");
                return None;
            }
        };

        match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(key = %key, error = %e, "unparseable signal row — treating as absent");
                None
            }
        }
    }
}

impl std::fmt::Debug for PositionStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionStateStore")
            .field("ttl_hours", &self.ttl.num_hours())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
