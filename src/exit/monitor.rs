// =============================================================================
// Exit Monitor — per-invocation sweep over broker-held positions
// =============================================================================
//
// Each invocation:
//   1. Pull live broker positions (the source of truth for what is held).
//   2. For each position, sequentially: fetch stored levels, fetch the
//      quote, evaluate the trigger, and submit an exit order when a level
//      has been crossed.
//   3. Reconcile: delete stored levels for symbols no longer held.
//
// Positions are processed one at a time. Each exit is a stateful sequence
// (quote → evaluate → submit → poll fill → delete record) against a store
// with no compare-and-swap; interleaving two exits on the same key would
// risk lost updates.
//
// A failed exit order leaves its stored levels intact — the next
// invocation retries from scratch. That is the sole recovery mechanism
// for exit-side failures.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerPosition, Order, OrderRequest};
use crate::exit::trigger::{evaluate_trigger, ExitTrigger};
use crate::state_store::{PositionLevels, PositionStateStore};

// ---------------------------------------------------------------------------
// Configuration & result types
// ---------------------------------------------------------------------------

/// Monitor tunables supplied at construction time.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Fractional buffer applied to trigger thresholds (e.g. 0.001).
    pub trigger_buffer: f64,
    /// Maximum exit order submission attempts.
    pub max_exit_retries: u32,
    /// Fixed delay between submission attempts, in milliseconds.
    pub exit_retry_delay_ms: u64,
    /// Delay before the single post-submit fill poll, in milliseconds.
    pub fill_poll_delay_ms: u64,
    /// Whether the operator emergency stop is armed.
    pub emergency_stop_enabled: bool,
}

/// Terminal state of one triggered exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Exited,
    ExitFailed,
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited => write!(f, "exited"),
            Self::ExitFailed => write!(f, "exit_failed"),
        }
    }
}

/// Outcome of one triggered exit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub symbol: String,
    pub trigger: ExitTrigger,
    pub status: ExitStatus,
    pub quantity: f64,
    pub attempts: u32,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub fill_price: Option<f64>,
    /// Realized P&L from the observed fill; `None` when the single fill
    /// poll did not observe one (reported as unknown, never guessed).
    #[serde(default)]
    pub realized_pnl: Option<f64>,
}

/// Summary of one monitoring sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepReport {
    /// Broker positions examined.
    pub evaluated: usize,
    /// Triggered exits, successful or not.
    pub exits: Vec<ExitOutcome>,
    /// Held symbols with no stored exit levels.
    pub unprotected: Vec<String>,
    /// Orphaned level records deleted by the reconciliation pass.
    pub cleaned_count: usize,
    /// Per-position errors; one bad position never aborts the sweep.
    pub errors: Vec<String>,
    pub timestamp: String,
}

/// Summary of an operator-invoked emergency stop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyStopReport {
    pub flattened: Vec<String>,
    pub failures: Vec<String>,
    pub levels_cleared: usize,
}

// ---------------------------------------------------------------------------
// Monitor
// ---------------------------------------------------------------------------

/// Reconciles stored exit levels against live broker positions and fires
/// exit orders when levels are crossed.
pub struct ExitMonitor {
    broker: Arc<dyn Broker>,
    store: Arc<PositionStateStore>,
    config: MonitorConfig,
}

impl ExitMonitor {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<PositionStateStore>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            broker,
            store,
            config,
        }
    }

    // -------------------------------------------------------------------------
    // Sweep
    // -------------------------------------------------------------------------

    /// Run one monitoring sweep.
    pub async fn run_sweep(&self) -> SweepReport {
        let timestamp = Utc::now().to_rfc3339();
        let mut report = SweepReport {
            evaluated: 0,
            exits: Vec::new(),
            unprotected: Vec::new(),
            cleaned_count: 0,
            errors: Vec::new(),
            timestamp,
        };

        let positions = match self.broker.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "sweep aborted — could not fetch broker positions");
                report.errors.push(format!("position fetch failed: {e}"));
                return report;
            }
        };

        report.evaluated = positions.len();
        debug!(count = positions.len(), "exit sweep: evaluating positions");

        for position in &positions {
            if let Err(e) = self.process_position(position, &mut report).await {
                // One bad position must not abort monitoring of the rest.
                error!(symbol = %position.symbol, error = %e, "position sweep error");
                report.errors.push(format!("{}: {e}", position.symbol));
            }
        }

        self.reconcile(&positions, &mut report).await;

        info!(
            evaluated = report.evaluated,
            exits = report.exits.len(),
            unprotected = report.unprotected.len(),
            cleaned = report.cleaned_count,
            errors = report.errors.len(),
            "exit sweep completed"
        );
        report
    }

    /// Evaluate one broker position and execute its exit if triggered.
    async fn process_position(
        &self,
        position: &BrokerPosition,
        report: &mut SweepReport,
    ) -> anyhow::Result<()> {
        let symbol = position.symbol.to_uppercase();

        let levels = match self.store.get_levels(&symbol).await {
            Some(levels) => levels,
            None => {
                warn!(
                    symbol = %symbol,
                    qty = position.qty,
                    "held position has no stored exit levels — unprotected"
                );
                report.unprotected.push(symbol);
                return Ok(());
            }
        };

        let quote = self
            .broker
            .get_quote(&symbol)
            .await
            .map_err(|e| anyhow::anyhow!("quote fetch failed: {e}"))?;

        let trigger = match evaluate_trigger(&levels, &quote, self.config.trigger_buffer) {
            Some(trigger) => trigger,
            None => {
                debug!(
                    symbol = %symbol,
                    bid = quote.bid,
                    ask = quote.ask,
                    stop_loss = ?levels.stop_loss,
                    take_profit = ?levels.take_profit,
                    "held — no trigger"
                );
                return Ok(());
            }
        };

        info!(
            symbol = %symbol,
            trigger = %trigger,
            side = %levels.side,
            bid = quote.bid,
            ask = quote.ask,
            stop_loss = ?levels.stop_loss,
            take_profit = ?levels.take_profit,
            "exit level crossed — closing position"
        );

        let outcome = self.execute_exit(position, &levels, trigger).await;

        if outcome.status == ExitStatus::Exited && !self.store.remove_levels(&symbol).await {
            // Orphan: the reconciliation pass of a later invocation cleans it.
            warn!(symbol = %symbol, "exit filled but levels removal failed — orphan left behind");
            report
                .errors
                .push(format!("{symbol}: levels removal failed after exit"));
        }

        report.exits.push(outcome);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Exit execution
    // -------------------------------------------------------------------------

    /// Submit the closing order, with retries, and attempt to observe the
    /// fill for P&L reporting.
    ///
    /// The order is sized at the full absolute broker-reported quantity —
    /// never the stored quantity, which can drift through partial fills.
    async fn execute_exit(
        &self,
        position: &BrokerPosition,
        levels: &PositionLevels,
        trigger: ExitTrigger,
    ) -> ExitOutcome {
        let symbol = position.symbol.to_uppercase();
        let qty = position.qty.abs();
        let order_side = position.side.closing_order_side();
        let request = OrderRequest::market(symbol.clone(), qty, order_side);

        let (order, attempts) = match self.submit_with_retries(&request).await {
            Ok(result) => result,
            Err((attempts, e)) => {
                error!(
                    symbol = %symbol,
                    attempts,
                    error = %e,
                    "exit order failed after exhausting retries — levels retained"
                );
                return ExitOutcome {
                    symbol,
                    trigger,
                    status: ExitStatus::ExitFailed,
                    quantity: qty,
                    attempts,
                    order_id: None,
                    fill_price: None,
                    realized_pnl: None,
                };
            }
        };

        // One bounded poll for the fill price; unknown P&L beats a guess.
        let fill_price = self.poll_fill_once(&order).await;
        let realized_pnl = fill_price
            .map(|fill| position.side.direction() * (fill - levels.entry_price) * qty);

        info!(
            symbol = %symbol,
            trigger = %trigger,
            order_id = %order.id,
            qty,
            attempts,
            fill_price = ?fill_price,
            realized_pnl = ?realized_pnl,
            "EXIT EXECUTED"
        );

        ExitOutcome {
            symbol,
            trigger,
            status: ExitStatus::Exited,
            quantity: qty,
            attempts,
            order_id: Some(order.id),
            fill_price,
            realized_pnl,
        }
    }

    /// Submit an order with up to `max_exit_retries` attempts and a fixed
    /// delay between them. Returns the attempt count alongside the result.
    async fn submit_with_retries(
        &self,
        request: &OrderRequest,
    ) -> Result<(Order, u32), (u32, anyhow::Error)> {
        let max = self.config.max_exit_retries.max(1);
        let mut last_err = None;

        for attempt in 1..=max {
            match self.broker.submit_order(request).await {
                Ok(order) => return Ok((order, attempt)),
                Err(e) => {
                    warn!(
                        symbol = %request.symbol,
                        attempt,
                        max_attempts = max,
                        error = %e,
                        "exit order submission failed"
                    );
                    last_err = Some(e);
                    if attempt < max {
                        tokio::time::sleep(std::time::Duration::from_millis(
                            self.config.exit_retry_delay_ms,
                        ))
                        .await;
                    }
                }
            }
        }

        Err((max, last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made"))))
    }

    /// Wait briefly, then poll the order status once for the fill price.
    async fn poll_fill_once(&self, order: &Order) -> Option<f64> {
        tokio::time::sleep(std::time::Duration::from_millis(self.config.fill_poll_delay_ms))
            .await;

        match self.broker.get_order(&order.id).await {
            Ok(polled) if polled.is_filled() => polled.filled_avg_price,
            Ok(polled) => {
                debug!(
                    order_id = %order.id,
                    status = %polled.status,
                    "fill not observed in single poll — P&L unknown"
                );
                None
            }
            Err(e) => {
                warn!(order_id = %order.id, error = %e, "fill poll failed — P&L unknown");
                None
            }
        }
    }

    // -------------------------------------------------------------------------
    // Reconciliation
    // -------------------------------------------------------------------------

    /// Delete stored levels for symbols the broker no longer holds (manual
    /// close, external liquidation, or a prior exit whose cleanup failed).
    async fn reconcile(&self, positions: &[BrokerPosition], report: &mut SweepReport) {
        let held: HashSet<String> = positions
            .iter()
            .map(|p| p.symbol.to_uppercase())
            .collect();

        for symbol in self.store.list_symbols().await {
            if held.contains(&symbol) {
                continue;
            }
            info!(symbol = %symbol, "orphaned levels — position no longer held, cleaning");
            if self.store.remove_levels(&symbol).await {
                report.cleaned_count += 1;
            } else {
                report
                    .errors
                    .push(format!("{symbol}: orphan cleanup failed"));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Emergency stop
    // -------------------------------------------------------------------------

    /// Flatten every held position with market orders and clear all stored
    /// levels. Operator-invoked only; per-symbol failures are collected,
    /// not fatal.
    pub async fn emergency_stop(&self) -> anyhow::Result<EmergencyStopReport> {
        if !self.config.emergency_stop_enabled {
            anyhow::bail!("emergency stop is disabled in configuration");
        }

        warn!("EMERGENCY STOP invoked — flattening all positions");

        let positions = self
            .broker
            .get_positions()
            .await
            .map_err(|e| anyhow::anyhow!("emergency stop aborted — position fetch failed: {e}"))?;

        let mut report = EmergencyStopReport {
            flattened: Vec::new(),
            failures: Vec::new(),
            levels_cleared: 0,
        };

        for position in &positions {
            let symbol = position.symbol.to_uppercase();
            let request = OrderRequest::market(
                symbol.clone(),
                position.qty.abs(),
                position.side.closing_order_side(),
            );

            match self.submit_with_retries(&request).await {
                Ok((order, _)) => {
                    info!(symbol = %symbol, order_id = %order.id, "position flattened");
                    report.flattened.push(symbol);
                }
                Err((_, e)) => {
                    error!(symbol = %symbol, error = %e, "emergency flatten failed");
                    report.failures.push(format!("{symbol}: {e}"));
                }
            }
        }

        for symbol in self.store.list_symbols().await {
            if self.store.remove_levels(&symbol).await {
                report.levels_cleared += 1;
            } else {
                report.failures.push(format!("{symbol}: levels clear failed"));
            }
        }

        warn!(
            flattened = report.flattened.len(),
            failures = report.failures.len(),
            levels_cleared = report.levels_cleared,
            "emergency stop completed"
        );
        Ok(report)
    }
}

impl std::fmt::Debug for ExitMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitMonitor")
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::ledger::MemoryLedger;
    use crate::state_store::NewPositionLevels;
    use crate::testutil::MockBroker;
    use crate::types::{OrderSide, PositionSide};

    fn monitor_config() -> MonitorConfig {
        MonitorConfig {
            trigger_buffer: 0.001,
            max_exit_retries: 3,
            exit_retry_delay_ms: 0,
            fill_poll_delay_ms: 0,
            emergency_stop_enabled: true,
        }
    }

    fn fixture() -> (ExitMonitor, Arc<MockBroker>, Arc<PositionStateStore>, Arc<FixedClock>) {
        let broker = Arc::new(MockBroker::new());
        let clock = Arc::new(FixedClock::default_start());
        let store = Arc::new(PositionStateStore::new(
            Arc::new(MemoryLedger::new()),
            clock.clone(),
            24,
        ));
        let monitor = ExitMonitor::new(broker.clone(), store.clone(), monitor_config());
        (monitor, broker, store, clock)
    }

    fn levels(sl: f64, tp: f64, entry: f64) -> NewPositionLevels {
        NewPositionLevels {
            stop_loss: Some(sl),
            take_profit: Some(tp),
            entry_price: entry,
            side: PositionSide::Long,
            quantity: 10,
            strategy: "ma-cross".to_string(),
            order_id: "entry-1".to_string(),
        }
    }

    #[tokio::test]
    async fn take_profit_exit_end_to_end() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("X", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("X", 10.0, 50.0);
        broker.set_quote("X", 53.10, 53.12);
        broker.set_next_fill_price(53.10);

        let report = monitor.run_sweep().await;

        assert_eq!(report.evaluated, 1);
        assert_eq!(report.exits.len(), 1);
        let exit = &report.exits[0];
        assert_eq!(exit.status, ExitStatus::Exited);
        assert_eq!(exit.trigger, ExitTrigger::TakeProfit);
        assert_eq!(exit.quantity, 10.0);
        assert!((exit.realized_pnl.unwrap() - 31.0).abs() < 1e-9);

        // The closing order was an opposite-side market order.
        let submitted = broker.submitted_orders();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].side, OrderSide::Sell);
        assert_eq!(submitted[0].qty, 10.0);
        assert_eq!(submitted[0].order_type, "market");

        // Stored levels were removed.
        assert!(store.get_levels("X").await.is_none());
    }

    #[tokio::test]
    async fn held_position_inside_levels_takes_no_action() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("X", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("X", 10.0, 50.0);
        broker.set_quote("X", 50.50, 50.52);

        let report = monitor.run_sweep().await;

        assert!(report.exits.is_empty());
        assert!(report.unprotected.is_empty());
        assert_eq!(broker.submitted_orders().len(), 0);
        assert!(store.get_levels("X").await.is_some());
    }

    #[tokio::test]
    async fn unprotected_position_is_reported_not_exited() {
        let (monitor, broker, _, _) = fixture();
        broker.add_long_position("X", 10.0, 50.0);
        broker.set_quote("X", 40.0, 40.02);

        let report = monitor.run_sweep().await;

        assert_eq!(report.unprotected, vec!["X"]);
        assert!(report.exits.is_empty());
        assert_eq!(broker.submitted_orders().len(), 0);
    }

    #[tokio::test]
    async fn exit_retry_exhaustion_retains_levels() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("X", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("X", 10.0, 50.0);
        broker.set_quote("X", 47.0, 47.02);
        broker.fail_next_submits(u32::MAX);

        let report = monitor.run_sweep().await;

        assert_eq!(report.exits.len(), 1);
        let exit = &report.exits[0];
        assert_eq!(exit.status, ExitStatus::ExitFailed);
        assert_eq!(exit.trigger, ExitTrigger::StopLoss);
        assert_eq!(exit.attempts, 3);
        assert!(exit.order_id.is_none());

        // Levels survive so the next invocation retries the exit.
        assert!(store.get_levels("X").await.is_some());
    }

    #[tokio::test]
    async fn transient_submit_failure_recovers_within_retries() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("X", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("X", 10.0, 50.0);
        broker.set_quote("X", 53.20, 53.22);
        broker.fail_next_submits(2);

        let report = monitor.run_sweep().await;

        let exit = &report.exits[0];
        assert_eq!(exit.status, ExitStatus::Exited);
        assert_eq!(exit.attempts, 3);
        assert!(store.get_levels("X").await.is_none());
    }

    #[tokio::test]
    async fn unobserved_fill_reports_unknown_pnl() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("X", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("X", 10.0, 50.0);
        broker.set_quote("X", 53.20, 53.22);
        // No fill price scripted: the single poll sees an unfilled order.

        let report = monitor.run_sweep().await;

        let exit = &report.exits[0];
        assert_eq!(exit.status, ExitStatus::Exited);
        assert!(exit.fill_price.is_none());
        assert!(exit.realized_pnl.is_none());
    }

    #[tokio::test]
    async fn exit_order_uses_broker_quantity_not_stored() {
        let (monitor, broker, store, _) = fixture();
        // Stored quantity says 10, but the broker reports a drifted 7.
        store.store_levels("X", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("X", 7.0, 50.0);
        broker.set_quote("X", 53.20, 53.22);

        monitor.run_sweep().await;

        let submitted = broker.submitted_orders();
        assert_eq!(submitted[0].qty, 7.0);
    }

    #[tokio::test]
    async fn short_position_exit_buys_to_cover() {
        let (monitor, broker, store, _) = fixture();
        let mut short = levels(103.0, 95.0, 100.0);
        short.side = PositionSide::Short;
        store.store_levels("X", short).await;
        broker.add_short_position("X", 10.0, 100.0);
        broker.set_quote("X", 94.98, 95.00);
        broker.set_next_fill_price(95.00);

        let report = monitor.run_sweep().await;

        let exit = &report.exits[0];
        assert_eq!(exit.trigger, ExitTrigger::TakeProfit);
        let submitted = broker.submitted_orders();
        assert_eq!(submitted[0].side, OrderSide::Buy);
        // Short: entry 100, cover at 95 → +5/share on 10 shares.
        assert!((exit.realized_pnl.unwrap() - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn reconciliation_cleans_orphaned_levels() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("A", levels(48.5, 53.0, 50.0)).await;
        store.store_levels("B", levels(48.5, 53.0, 50.0)).await;
        store.store_levels("C", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("A", 10.0, 50.0);
        broker.set_quote("A", 50.0, 50.02);

        let report = monitor.run_sweep().await;

        assert_eq!(report.cleaned_count, 2);
        assert!(store.get_levels("A").await.is_some());
        assert!(store.get_levels("B").await.is_none());
        assert!(store.get_levels("C").await.is_none());
    }

    #[tokio::test]
    async fn expired_levels_leave_position_unprotected() {
        let (monitor, broker, store, clock) = fixture();
        store.store_levels("X", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("X", 10.0, 50.0);
        broker.set_quote("X", 40.0, 40.02);

        clock.advance(chrono::Duration::hours(25));
        let report = monitor.run_sweep().await;

        // Dead-man's-switch: the stale record is discarded, not acted on.
        assert!(report.exits.is_empty());
        assert_eq!(report.unprotected, vec!["X"]);
        assert_eq!(broker.submitted_orders().len(), 0);
    }

    #[tokio::test]
    async fn quote_failure_is_collected_not_fatal() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("A", levels(48.5, 53.0, 50.0)).await;
        store.store_levels("B", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("A", 10.0, 50.0);
        broker.add_long_position("B", 5.0, 50.0);
        // Only B has a quote; A's fetch fails.
        broker.set_quote("B", 53.20, 53.22);

        let report = monitor.run_sweep().await;

        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("A:"));
        // B was still evaluated and exited.
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.exits[0].symbol, "B");
    }

    #[tokio::test]
    async fn emergency_stop_flattens_and_clears() {
        let (monitor, broker, store, _) = fixture();
        store.store_levels("A", levels(48.5, 53.0, 50.0)).await;
        store.store_levels("B", levels(48.5, 53.0, 50.0)).await;
        broker.add_long_position("A", 10.0, 50.0);
        broker.add_short_position("C", 5.0, 80.0);

        let report = monitor.emergency_stop().await.unwrap();

        assert_eq!(report.flattened, vec!["A", "C"]);
        assert!(report.failures.is_empty());
        assert_eq!(report.levels_cleared, 2);
        assert_eq!(broker.submitted_orders().len(), 2);
        assert!(store.get_levels("A").await.is_none());
        assert!(store.get_levels("B").await.is_none());
    }

    #[tokio::test]
    async fn emergency_stop_requires_config_flag() {
        let (_, broker, store, _) = fixture();
        let mut config = monitor_config();
        config.emergency_stop_enabled = false;
        let monitor = ExitMonitor::new(broker.clone(), store, config);

        assert!(monitor.emergency_stop().await.is_err());
        assert_eq!(broker.submitted_orders().len(), 0);
    }

    #[tokio::test]
    async fn emergency_stop_collects_partial_failures() {
        let (monitor, broker, store, _) = fixture();
        broker.add_long_position("A", 10.0, 50.0);
        broker.add_long_position("B", 5.0, 60.0);
        broker.fail_next_submits(3); // A's retries all fail; B succeeds.

        let report = monitor.emergency_stop().await.unwrap();

        assert_eq!(report.flattened, vec!["B"]);
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].starts_with("A:"));
        let _ = store;
    }
}
