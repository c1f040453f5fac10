// =============================================================================
// Test support — scriptable in-process broker
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;

use crate::broker::{AccountSnapshot, Broker, BrokerPosition, Order, OrderRequest, Quote};
use crate::ledger::{Ledger, MemoryLedger};
use crate::types::PositionSide;

/// Scriptable broker double. Positions, quotes, and failure behaviour are
/// set per test; every submitted order is captured for assertion.
pub struct MockBroker {
    account: RwLock<AccountSnapshot>,
    positions: RwLock<Vec<BrokerPosition>>,
    quotes: RwLock<HashMap<String, Quote>>,
    market_open: RwLock<bool>,
    /// Number of upcoming submit calls that should fail.
    submit_failures: RwLock<u32>,
    /// Fill price assigned to the next successfully submitted order.
    next_fill_price: RwLock<Option<f64>>,
    submitted: RwLock<Vec<OrderRequest>>,
    fills: RwLock<HashMap<String, f64>>,
    fail_account_reads: RwLock<bool>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self {
            account: RwLock::new(AccountSnapshot {
                equity: 100_000.0,
                cash: 50_000.0,
                buying_power: 200_000.0,
            }),
            positions: RwLock::new(Vec::new()),
            quotes: RwLock::new(HashMap::new()),
            market_open: RwLock::new(true),
            submit_failures: RwLock::new(0),
            next_fill_price: RwLock::new(None),
            submitted: RwLock::new(Vec::new()),
            fills: RwLock::new(HashMap::new()),
            fail_account_reads: RwLock::new(false),
        }
    }

    // ── Scripting ───────────────────────────────────────────────────────

    pub fn set_account(&self, equity: f64, cash: f64, buying_power: f64) {
        *self.account.write() = AccountSnapshot {
            equity,
            cash,
            buying_power,
        };
    }

    pub fn add_long_position(&self, symbol: &str, qty: f64, entry: f64) {
        self.positions.write().push(BrokerPosition {
            symbol: symbol.to_uppercase(),
            qty,
            side: PositionSide::Long,
            avg_entry_price: entry,
            current_price: entry,
        });
    }

    pub fn add_short_position(&self, symbol: &str, qty: f64, entry: f64) {
        self.positions.write().push(BrokerPosition {
            symbol: symbol.to_uppercase(),
            qty: -qty.abs(),
            side: PositionSide::Short,
            avg_entry_price: entry,
            current_price: entry,
        });
    }

    pub fn set_quote(&self, symbol: &str, bid: f64, ask: f64) {
        self.quotes
            .write()
            .insert(symbol.to_uppercase(), Quote { bid, ask });
    }

    pub fn set_market_open(&self, open: bool) {
        *self.market_open.write() = open;
    }

    /// Fail the next `count` submit calls (`u32::MAX` = always fail).
    pub fn fail_next_submits(&self, count: u32) {
        *self.submit_failures.write() = count;
    }

    pub fn set_next_fill_price(&self, price: f64) {
        *self.next_fill_price.write() = Some(price);
    }

    pub fn fail_account_reads(&self, fail: bool) {
        *self.fail_account_reads.write() = fail;
    }

    // ── Assertions ──────────────────────────────────────────────────────

    pub fn submitted_orders(&self) -> Vec<OrderRequest> {
        self.submitted.read().clone()
    }
}

impl Default for MockBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn get_account(&self) -> Result<AccountSnapshot> {
        if *self.fail_account_reads.read() {
            anyhow::bail!("simulated account read failure");
        }
        Ok(self.account.read().clone())
    }

    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        Ok(self.positions.read().clone())
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        self.quotes
            .read()
            .get(&symbol.to_uppercase())
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no quote scripted for {symbol}"))
    }

    async fn submit_order(&self, req: &OrderRequest) -> Result<Order> {
        {
            let mut failures = self.submit_failures.write();
            if *failures > 0 {
                if *failures != u32::MAX {
                    *failures -= 1;
                }
                anyhow::bail!("simulated submit failure");
            }
        }

        let mut submitted = self.submitted.write();
        submitted.push(req.clone());
        let id = format!("ord-{}", submitted.len());

        if let Some(fill) = self.next_fill_price.write().take() {
            self.fills.write().insert(id.clone(), fill);
        }

        Ok(Order {
            id,
            status: "accepted".to_string(),
            filled_avg_price: None,
        })
    }

    async fn get_order(&self, id: &str) -> Result<Order> {
        match self.fills.read().get(id) {
            Some(&fill) => Ok(Order {
                id: id.to_string(),
                status: "filled".to_string(),
                filled_avg_price: Some(fill),
            }),
            None => Ok(Order {
                id: id.to_string(),
                status: "accepted".to_string(),
                filled_avg_price: None,
            }),
        }
    }

    async fn is_market_open(&self) -> Result<bool> {
        Ok(*self.market_open.read())
    }
}

/// Ledger double that can be scripted to fail writes on one table while
/// behaving normally everywhere else.
pub struct FlakyLedger {
    inner: MemoryLedger,
    fail_puts_table: RwLock<Option<String>>,
}

impl FlakyLedger {
    pub fn new() -> Self {
        Self {
            inner: MemoryLedger::new(),
            fail_puts_table: RwLock::new(None),
        }
    }

    pub fn fail_puts_on(&self, table: &str) {
        *self.fail_puts_table.write() = Some(table.to_string());
    }
}

impl Default for FlakyLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn get(&self, table: &str, key: &str) -> Result<Option<serde_json::Value>> {
        self.inner.get(table, key).await
    }

    async fn put(&self, table: &str, key: &str, row: serde_json::Value) -> Result<()> {
        if self.fail_puts_table.read().as_deref() == Some(table) {
            anyhow::bail!("simulated ledger write failure on {table}");
        }
        self.inner.put(table, key, row).await
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        self.inner.delete(table, key).await
    }

    async fn scan_all(&self, table: &str) -> Result<Vec<serde_json::Value>> {
        self.inner.scan_all(table).await
    }
}
