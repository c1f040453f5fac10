// =============================================================================
// MemoryLedger — in-process table store with ledger scan semantics
// =============================================================================
//
// Backs Demo account mode and the test suite. Rows live in insertion order
// per table, so keyed reads scan backward exactly like the remote store:
// the most recent matching row wins.
// =============================================================================

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::ledger::Ledger;

/// In-memory tabular store. Cheap to clone behind an `Arc`.
#[derive(Default)]
pub struct MemoryLedger {
    tables: RwLock<HashMap<String, Vec<(String, Value)>>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently held in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .map(|rows| rows.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let tables = self.tables.read();
        let row = tables
            .get(table)
            .and_then(|rows| rows.iter().rev().find(|(k, _)| k == key))
            .map(|(_, v)| v.clone());
        Ok(row)
    }

    async fn put(&self, table: &str, key: &str, row: Value) -> Result<()> {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();

        // Update-in-place if the key already has a row, else append.
        match rows.iter_mut().rev().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = row,
            None => rows.push((key.to_string(), row)),
        }
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        let mut tables = self.tables.write();
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|(k, _)| k != key);
        }
        Ok(())
    }

    async fn scan_all(&self, table: &str) -> Result<Vec<Value>> {
        let tables = self.tables.read();
        Ok(tables
            .get(table)
            .map(|rows| rows.iter().map(|(_, v)| v.clone()).collect())
            .unwrap_or_default())
    }
}

impl std::fmt::Debug for MemoryLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryLedger")
            .field("tables", &tables.len())
            .field("rows", &tables.values().map(|r| r.len()).sum::<usize>())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_overwrites_in_place() {
        let ledger = MemoryLedger::new();
        ledger.put("t", "AAPL", json!({"v": 1})).await.unwrap();
        ledger.put("t", "AAPL", json!({"v": 2})).await.unwrap();

        assert_eq!(ledger.row_count("t"), 1);
        let row = ledger.get("t", "AAPL").await.unwrap().unwrap();
        assert_eq!(row["v"], 2);
    }

    #[tokio::test]
    async fn get_returns_most_recent_match() {
        let ledger = MemoryLedger::new();
        ledger.put("t", "A", json!({"n": 1})).await.unwrap();
        ledger.put("t", "B", json!({"n": 2})).await.unwrap();

        assert_eq!(ledger.get("t", "B").await.unwrap().unwrap()["n"], 2);
        assert!(ledger.get("t", "C").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_absent_key_succeeds() {
        let ledger = MemoryLedger::new();
        assert!(ledger.delete("t", "MISSING").await.is_ok());

        ledger.put("t", "A", json!({})).await.unwrap();
        ledger.delete("t", "A").await.unwrap();
        ledger.delete("t", "A").await.unwrap();
        assert_eq!(ledger.row_count("t"), 0);
    }

    #[tokio::test]
    async fn scan_all_preserves_insertion_order() {
        let ledger = MemoryLedger::new();
        ledger.put("t", "A", json!({"n": 1})).await.unwrap();
        ledger.put("t", "B", json!({"n": 2})).await.unwrap();
        ledger.put("t", "C", json!({"n": 3})).await.unwrap();

        let rows = ledger.scan_all("t").await.unwrap();
        let ns: Vec<i64> = rows.iter().map(|r| r["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![1, 2, 3]);
    }
}
