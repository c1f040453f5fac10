// =============================================================================
// Trading Engine — one stateless invocation from end to end
// =============================================================================
//
// Each invocation runs the same fixed sequence:
//
//   1. Exit sweep — close anything whose levels have been crossed.
//   2. One account + positions read — after exits, so freed capital is
//      visible to sizing checks.
//   3. Per-signal validation and entry — sequentially, through the gate.
//
// The process keeps no state between invocations; everything a future
// invocation needs is written through the Position State Store before this
// one returns.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, OrderRequest};
use crate::clock::Clock;
use crate::exit::{EmergencyStopReport, ExitMonitor, SweepReport};
use crate::gate::TradeGate;
use crate::runtime_config::RuntimeConfig;
use crate::state_store::{NewPositionLevels, PositionStateStore};
use crate::types::{TradeReport, TradeSignal, TradeStatus, TradingMode};

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Terminal state of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InvocationStatus {
    Completed,
    Skipped,
    Failed,
}

impl std::fmt::Display for InvocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Everything one invocation did, for the operator and the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationReport {
    pub status: InvocationStatus,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub sweep: Option<SweepReport>,
    pub trades: Vec<TradeReport>,
    pub timestamp: String,
}

impl InvocationReport {
    fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::Skipped,
            reason: Some(reason.into()),
            sweep: None,
            trades: Vec::new(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: InvocationStatus::Failed,
            reason: Some(reason.into()),
            sweep: None,
            trades: Vec::new(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Ties the broker, state store, gate, and exit monitor into one
/// invocation pipeline.
pub struct TradingEngine {
    broker: Arc<dyn Broker>,
    store: Arc<PositionStateStore>,
    clock: Arc<dyn Clock>,
    config: Arc<RwLock<RuntimeConfig>>,
}

impl TradingEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<PositionStateStore>,
        clock: Arc<dyn Clock>,
        config: Arc<RwLock<RuntimeConfig>>,
    ) -> Self {
        Self {
            broker,
            store,
            clock,
            config,
        }
    }

    pub fn store(&self) -> Arc<PositionStateStore> {
        self.store.clone()
    }

    // -------------------------------------------------------------------------
    // Invocation
    // -------------------------------------------------------------------------

    /// Run one invocation: exit sweep first, then candidate entries.
    pub async fn run_invocation(&self, signals: Vec<TradeSignal>) -> InvocationReport {
        // Snapshot the config up front; the lock must not be held across
        // awaits.
        let cfg = self.config.read().clone();

        match self.broker.is_market_open().await {
            Ok(true) => {}
            Ok(false) => {
                info!("invocation skipped — market closed");
                return InvocationReport::skipped("market closed");
            }
            Err(e) => {
                error!(error = %e, "invocation failed — market clock unavailable");
                return InvocationReport::failed(format!("market clock unavailable: {e}"));
            }
        }

        // ── 1. Exits before new capital is committed ────────────────
        let monitor = ExitMonitor::new(
            self.broker.clone(),
            self.store.clone(),
            cfg.monitor_config(),
        );
        let sweep = monitor.run_sweep().await;

        let mut report = InvocationReport {
            status: InvocationStatus::Completed,
            reason: None,
            sweep: Some(sweep),
            trades: Vec::new(),
            timestamp: Utc::now().to_rfc3339(),
        };

        if signals.is_empty() {
            return report;
        }

        // ── 2. Entry gating ─────────────────────────────────────────
        if cfg.trading_mode != TradingMode::Live {
            let reason = format!("trading mode is {} — entries blocked", cfg.trading_mode);
            warn!(mode = %cfg.trading_mode, candidates = signals.len(), "{reason}");
            for signal in &signals {
                report.trades.push(TradeReport {
                    symbol: signal.symbol.to_uppercase(),
                    status: TradeStatus::Skipped,
                    reasons: vec![reason.clone()],
                    order_id: None,
                    unprotected: false,
                });
            }
            return report;
        }

        // One account and positions read for the whole invocation,
        // taken after the sweep so exited capital is visible.
        let account = match self.broker.get_account().await {
            Ok(account) => account,
            Err(e) => {
                error!(error = %e, "account unavailable — rejecting all candidates");
                for signal in &signals {
                    report.trades.push(TradeReport {
                        symbol: signal.symbol.to_uppercase(),
                        status: TradeStatus::Skipped,
                        reasons: vec![format!("account unavailable: {e}")],
                        order_id: None,
                        unprotected: false,
                    });
                }
                return report;
            }
        };
        let positions = match self.broker.get_positions().await {
            Ok(positions) => positions,
            Err(e) => {
                error!(error = %e, "positions unavailable — rejecting all candidates");
                for signal in &signals {
                    report.trades.push(TradeReport {
                        symbol: signal.symbol.to_uppercase(),
                        status: TradeStatus::Skipped,
                        reasons: vec![format!("positions unavailable: {e}")],
                        order_id: None,
                        unprotected: false,
                    });
                }
                return report;
            }
        };

        let gate = TradeGate::new(self.store.clone(), self.clock.clone(), cfg.gate_config());

        // ── 3. Sequential entries ───────────────────────────────────
        for signal in signals {
            let outcome = gate.validate(&signal, &account, &positions).await;
            if !outcome.can_trade {
                info!(
                    symbol = %signal.symbol,
                    reasons = ?outcome.reasons,
                    "candidate rejected by gate"
                );
                report.trades.push(TradeReport {
                    symbol: signal.symbol.to_uppercase(),
                    status: TradeStatus::Skipped,
                    reasons: outcome.reasons,
                    order_id: None,
                    unprotected: false,
                });
                continue;
            }

            report.trades.push(self.execute_entry(signal).await);
        }

        report
    }

    // -------------------------------------------------------------------------
    // Entry execution
    // -------------------------------------------------------------------------

    /// Submit an accepted candidate and persist its externalized state:
    /// signal strength, trade record, and exit levels.
    async fn execute_entry(&self, signal: TradeSignal) -> TradeReport {
        let symbol = signal.symbol.to_uppercase();
        let mut reasons = Vec::new();

        // Record the signal before submission so the strength gate sees it
        // even if the order is rejected downstream.
        if !self
            .store
            .record_signal(&symbol, signal.side, &signal.strategy, signal.signal_strength, None)
            .await
        {
            reasons.push("signal audit write failed".to_string());
        }

        let request = OrderRequest::market(
            symbol.clone(),
            f64::from(signal.quantity),
            signal.side.opening_order_side(),
        )
        .with_client_order_id(Uuid::new_v4().to_string());

        let order = match self.broker.submit_order(&request).await {
            Ok(order) => order,
            Err(e) => {
                error!(symbol = %symbol, error = %e, "entry order submission failed");
                reasons.push(format!("order submission failed: {e}"));
                return TradeReport {
                    symbol,
                    status: TradeStatus::Failed,
                    reasons,
                    order_id: None,
                    unprotected: false,
                };
            }
        };

        if !self
            .store
            .record_trade(
                &symbol,
                signal.side.opening_order_side(),
                &signal.strategy,
                signal.quantity,
                signal.price,
                &order.id,
            )
            .await
        {
            reasons.push("trade audit write failed — cooldown gap until next record".to_string());
        }

        // Attach the executed order id to the signal record.
        self.store
            .record_signal(
                &symbol,
                signal.side,
                &signal.strategy,
                signal.signal_strength,
                Some(&order.id),
            )
            .await;

        // ── Persist exit levels ─────────────────────────────────────
        let unprotected = if signal.stop_loss.is_some() || signal.take_profit.is_some() {
            let stored = self
                .store
                .store_levels(
                    &symbol,
                    NewPositionLevels {
                        stop_loss: signal.stop_loss,
                        take_profit: signal.take_profit,
                        entry_price: signal.price,
                        side: signal.side,
                        quantity: signal.quantity,
                        strategy: signal.strategy.clone(),
                        order_id: order.id.clone(),
                    },
                )
                .await;
            if !stored {
                reasons.push("exit levels write failed — position unprotected".to_string());
            }
            !stored
        } else {
            reasons.push("no exit levels supplied — position unprotected".to_string());
            true
        };

        info!(
            symbol = %symbol,
            side = %signal.side,
            qty = signal.quantity,
            order_id = %order.id,
            unprotected,
            "entry executed"
        );

        TradeReport {
            symbol,
            status: TradeStatus::Executed,
            reasons,
            order_id: Some(order.id),
            unprotected,
        }
    }

    // -------------------------------------------------------------------------
    // Emergency stop
    // -------------------------------------------------------------------------

    /// Operator-invoked: flatten everything and clear all stored levels.
    pub async fn emergency_stop(&self) -> anyhow::Result<EmergencyStopReport> {
        let cfg = self.config.read().clone();
        let monitor = ExitMonitor::new(
            self.broker.clone(),
            self.store.clone(),
            cfg.monitor_config(),
        );
        monitor.emergency_stop().await
    }
}

impl std::fmt::Debug for TradingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradingEngine").finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
