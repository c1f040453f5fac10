// =============================================================================
// Persistent Ledger — the engine's only cross-invocation state
// =============================================================================
//
// The ledger is a remote, rate-limited tabular store: rows are JSON objects
// addressed by (table, key). There is no secondary index and no
// compare-and-swap; `get` resolves a key by scanning from the most recent
// row backward, and `put` updates in place when the key already exists.
// Callers must tolerate transient failures on every operation.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod memory;
pub mod rate_limit;
pub mod rest;

pub use memory::MemoryLedger;
pub use rest::RestLedgerClient;

/// Table holding the one live exit-level record per symbol.
pub const LEVELS_TABLE: &str = "position_levels";
/// Table holding the most recent trade per symbol (cooldown input).
pub const TRADES_TABLE: &str = "trade_state";
/// Table holding the most recent signal strength per symbol+side.
pub const SIGNALS_TABLE: &str = "signal_strength";

/// Row-level access to the remote tabular store.
///
/// Semantics every implementation must honour:
/// - `get` returns the most recent row matching `key`, or `None`.
/// - `put` overwrites the row for `key` in place if one exists, else appends.
/// - `delete` removes the row(s) for `key`; deleting an absent key succeeds.
/// - `scan_all` returns every row of the table, oldest first.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>>;
    async fn put(&self, table: &str, key: &str, row: Value) -> Result<()>;
    async fn delete(&self, table: &str, key: &str) -> Result<()>;
    async fn scan_all(&self, table: &str) -> Result<Vec<Value>>;
}
