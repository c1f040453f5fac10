// =============================================================================
// Trade Validation Gate — every new order passes here first
// =============================================================================
//
// Sequential checks, short-circuiting on the first failure. Order matters:
// the cheapest and most authoritative checks run first.
//
//   1. Cooldown        — per-symbol debounce against the last trade time.
//   2. Weak signal     — with an open position, re-entry requires the new
//                        signal to beat the last recorded strength by a
//                        relative margin.
//   3. Notional limits — absolute ceiling, equity fraction, and (for buys)
//                        available cash.
//
// Rejections are values, never errors: the outcome carries a reasons list
// and a snapshot of how close each limit came to binding.
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::{AccountSnapshot, BrokerPosition};
use crate::clock::Clock;
use crate::state_store::PositionStateStore;
use crate::types::{PositionSide, TradeSignal};

// ---------------------------------------------------------------------------
// Configuration & result types
// ---------------------------------------------------------------------------

/// Gate limits supplied at construction time.
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// Minimum seconds between trades on the same symbol.
    pub min_secs_between_trades: i64,
    /// Relative margin a new signal must beat the last one by when a
    /// position is already open (e.g. 1.3 = 30 % stronger).
    pub signal_improvement_factor: f64,
    /// Absolute notional ceiling per trade.
    pub max_position_notional: f64,
    /// Maximum notional as a fraction of account equity.
    pub max_equity_fraction: f64,
}

/// How close each limit came to binding. Telemetry only — control flow
/// never reads this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitChecks {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cooldown_remaining_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_strength: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required_strength: Option<f64>,
    pub notional: f64,
    pub notional_ceiling: f64,
    pub equity_limit: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cash_available: Option<f64>,
    /// Name of the limit with the highest utilisation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binding: Option<String>,
}

/// Result of validating one trade candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub can_trade: bool,
    pub reasons: Vec<String>,
    pub checks: LimitChecks,
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

/// Pre-trade validation against externalized state and live broker data.
pub struct TradeGate {
    store: Arc<PositionStateStore>,
    clock: Arc<dyn Clock>,
    config: GateConfig,
}

impl TradeGate {
    pub fn new(store: Arc<PositionStateStore>, clock: Arc<dyn Clock>, config: GateConfig) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Validate a candidate trade.
    ///
    /// `account` and `open_positions` are the invocation's single broker
    /// reads, taken after the exit sweep so freed capital is visible.
    pub async fn validate(
        &self,
        signal: &TradeSignal,
        account: &AccountSnapshot,
        open_positions: &[BrokerPosition],
    ) -> ValidationOutcome {
        let notional = f64::from(signal.quantity) * signal.price;
        let equity_limit = account.equity * self.config.max_equity_fraction;
        let mut checks = LimitChecks {
            cooldown_remaining_secs: None,
            last_strength: None,
            required_strength: None,
            notional,
            notional_ceiling: self.config.max_position_notional,
            equity_limit,
            cash_available: None,
            binding: None,
        };

        // ── 1. Cooldown ─────────────────────────────────────────────
        if let Some(last) = self.store.last_trade(&signal.symbol).await {
            let elapsed = (self.clock.now() - last.timestamp).num_seconds();
            if elapsed < self.config.min_secs_between_trades {
                let remaining = self.config.min_secs_between_trades - elapsed;
                checks.cooldown_remaining_secs = Some(remaining);
                checks.binding = Some("cooldown".to_string());
                info!(
                    symbol = %signal.symbol,
                    elapsed_secs = elapsed,
                    remaining_secs = remaining,
                    "trade rejected — cooldown active"
                );
                return Self::reject(
                    format!(
                        "cooldown active: {remaining}s remaining (min {}s between trades)",
                        self.config.min_secs_between_trades
                    ),
                    checks,
                );
            }
        }

        // ── 2. Weak-signal suppression ──────────────────────────────
        // Only applies when the broker already holds this symbol: a first
        // entry is always a first signal.
        let has_open_position = open_positions
            .iter()
            .any(|p| p.symbol.eq_ignore_ascii_case(&signal.symbol));

        if has_open_position {
            if let Some(last) = self.store.last_signal(&signal.symbol, signal.side).await {
                let required = last.signal_strength * self.config.signal_improvement_factor;
                checks.last_strength = Some(last.signal_strength);
                checks.required_strength = Some(required);

                if signal.signal_strength <= required {
                    checks.binding = Some("signal_strength".to_string());
                    info!(
                        symbol = %signal.symbol,
                        side = %signal.side,
                        strength = signal.signal_strength,
                        last_strength = last.signal_strength,
                        required,
                        "trade rejected — signal not sufficiently stronger"
                    );
                    return Self::reject(
                        format!(
                            "signal strength {:.3} does not exceed required {:.3} \
                             ({:.3} × {:.2}) for open position",
                            signal.signal_strength,
                            required,
                            last.signal_strength,
                            self.config.signal_improvement_factor
                        ),
                        checks,
                    );
                }
            }
        }

        // ── 3. Notional / risk limits ───────────────────────────────
        if notional > self.config.max_position_notional {
            checks.binding = Some("notional_ceiling".to_string());
            return Self::reject(
                format!(
                    "notional {notional:.2} exceeds ceiling {:.2}",
                    self.config.max_position_notional
                ),
                checks,
            );
        }

        if notional > equity_limit {
            checks.binding = Some("equity_fraction".to_string());
            return Self::reject(
                format!(
                    "notional {notional:.2} exceeds {:.1}% of equity ({equity_limit:.2})",
                    self.config.max_equity_fraction * 100.0
                ),
                checks,
            );
        }

        let is_buy = signal.side == PositionSide::Long;
        if is_buy {
            checks.cash_available = Some(account.cash);
            if notional > account.cash {
                checks.binding = Some("cash".to_string());
                return Self::reject(
                    format!(
                        "notional {notional:.2} exceeds available cash {:.2}",
                        account.cash
                    ),
                    checks,
                );
            }
        }

        // All clear. Record which limit came closest to binding.
        checks.binding = Some(Self::closest_to_binding(
            notional,
            self.config.max_position_notional,
            equity_limit,
            is_buy.then_some(account.cash),
        ));

        debug!(
            symbol = %signal.symbol,
            side = %signal.side,
            notional,
            binding = ?checks.binding,
            "all gate checks passed"
        );

        ValidationOutcome {
            can_trade: true,
            reasons: Vec::new(),
            checks,
        }
    }

    fn reject(reason: String, checks: LimitChecks) -> ValidationOutcome {
        ValidationOutcome {
            can_trade: false,
            reasons: vec![reason],
            checks,
        }
    }

    /// Name of the numeric limit with the highest utilisation.
    fn closest_to_binding(
        notional: f64,
        ceiling: f64,
        equity_limit: f64,
        cash: Option<f64>,
    ) -> String {
        let mut best = ("notional_ceiling", utilisation(notional, ceiling));

        let equity_util = utilisation(notional, equity_limit);
        if equity_util > best.1 {
            best = ("equity_fraction", equity_util);
        }
        if let Some(cash) = cash {
            let cash_util = utilisation(notional, cash);
            if cash_util > best.1 {
                best = ("cash", cash_util);
            }
        }
        best.0.to_string()
    }
}

fn utilisation(used: f64, limit: f64) -> f64 {
    if limit > 0.0 {
        used / limit
    } else {
        f64::INFINITY
    }
}

impl std::fmt::Debug for TradeGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeGate")
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
    use crate::types::OrderSide;

    fn fixture() -> (TradeGate, Arc<PositionStateStore>, Arc<FixedClock>) {
        let ledger = Arc::new(MemoryLedger::new());
        let clock = Arc::new(FixedClock::default_start());
        let store = Arc::new(PositionStateStore::new(ledger, clock.clone(), 24));
        let gate = TradeGate::new(
            store.clone(),
            clock.clone(),
            GateConfig {
                min_secs_between_trades: 60,
                signal_improvement_factor: 1.3,
                max_position_notional: 10_000.0,
                max_equity_fraction: 0.10,
            },
        );
        (gate, store, clock)
    }

    fn signal(symbol: &str, strength: f64) -> TradeSignal {
        TradeSignal {
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            quantity: 10,
            price: 50.0,
            strategy: "ma-cross".to_string(),
            signal_strength: strength,
            stop_loss: Some(48.5),
            take_profit: Some(53.0),
        }
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            equity: 100_000.0,
            cash: 50_000.0,
            buying_power: 200_000.0,
        }
    }

    fn open_long(symbol: &str) -> BrokerPosition {
        BrokerPosition {
            symbol: symbol.to_string(),
            qty: 10.0,
            side: PositionSide::Long,
            avg_entry_price: 50.0,
            current_price: 51.0,
        }
    }

    #[tokio::test]
    async fn cooldown_rejects_before_window_and_allows_after() {
        let (gate, store, clock) = fixture();
        store
            .record_trade("AAPL", OrderSide::Buy, "ma-cross", 10, 50.0, "ord-1")
            .await;

        clock.advance(chrono::Duration::seconds(59));
        let outcome = gate.validate(&signal("AAPL", 0.8), &account(), &[]).await;
        assert!(!outcome.can_trade);
        assert_eq!(outcome.checks.cooldown_remaining_secs, Some(1));
        assert_eq!(outcome.checks.binding.as_deref(), Some("cooldown"));

        clock.advance(chrono::Duration::seconds(2));
        let outcome = gate.validate(&signal("AAPL", 0.8), &account(), &[]).await;
        assert!(outcome.can_trade, "{:?}", outcome.reasons);
    }

    #[tokio::test]
    async fn cooldown_is_per_symbol() {
        let (gate, store, _) = fixture();
        store
            .record_trade("AAPL", OrderSide::Buy, "ma-cross", 10, 50.0, "ord-1")
            .await;

        let outcome = gate.validate(&signal("MSFT", 0.8), &account(), &[]).await;
        assert!(outcome.can_trade);
    }

    #[tokio::test]
    async fn weak_signal_rejected_when_position_open() {
        let (gate, store, _) = fixture();
        store
            .record_signal("AAPL", PositionSide::Long, "ma-cross", 0.5, None)
            .await;
        let held = [open_long("AAPL")];

        // 0.64 <= 0.5 × 1.3 = 0.65 — not enough improvement.
        let outcome = gate.validate(&signal("AAPL", 0.64), &account(), &held).await;
        assert!(!outcome.can_trade);
        assert_eq!(outcome.checks.last_strength, Some(0.5));
        assert_eq!(outcome.checks.binding.as_deref(), Some("signal_strength"));

        // 0.66 > 0.65 — allowed.
        let outcome = gate.validate(&signal("AAPL", 0.66), &account(), &held).await;
        assert!(outcome.can_trade, "{:?}", outcome.reasons);
    }

    #[tokio::test]
    async fn signal_check_skipped_without_open_position() {
        let (gate, store, _) = fixture();
        store
            .record_signal("AAPL", PositionSide::Long, "ma-cross", 0.9, None)
            .await;

        // Weaker than the last record, but no open position: first-signal rules.
        let outcome = gate.validate(&signal("AAPL", 0.3), &account(), &[]).await;
        assert!(outcome.can_trade);
    }

    #[tokio::test]
    async fn first_signal_with_open_position_is_allowed() {
        let (gate, _, _) = fixture();
        let held = [open_long("AAPL")];
        let outcome = gate.validate(&signal("AAPL", 0.2), &account(), &held).await;
        assert!(outcome.can_trade);
    }

    #[tokio::test]
    async fn notional_ceiling_rejects() {
        let (gate, _, _) = fixture();
        let mut sig = signal("AAPL", 0.8);
        sig.quantity = 300; // 300 × 50 = 15 000 > 10 000
        let outcome = gate.validate(&sig, &account(), &[]).await;
        assert!(!outcome.can_trade);
        assert_eq!(outcome.checks.binding.as_deref(), Some("notional_ceiling"));
    }

    #[tokio::test]
    async fn equity_fraction_rejects() {
        let (gate, _, _) = fixture();
        let mut acct = account();
        acct.equity = 4_000.0; // limit = 400 < 500 notional
        let outcome = gate.validate(&signal("AAPL", 0.8), &acct, &[]).await;
        assert!(!outcome.can_trade);
        assert_eq!(outcome.checks.binding.as_deref(), Some("equity_fraction"));
    }

    #[tokio::test]
    async fn cash_check_applies_to_buys_only() {
        let (gate, _, _) = fixture();
        let mut acct = account();
        acct.cash = 100.0;

        let outcome = gate.validate(&signal("AAPL", 0.8), &acct, &[]).await;
        assert!(!outcome.can_trade);
        assert_eq!(outcome.checks.binding.as_deref(), Some("cash"));

        let mut short = signal("AAPL", 0.8);
        short.side = PositionSide::Short;
        let outcome = gate.validate(&short, &acct, &[]).await;
        assert!(outcome.can_trade, "{:?}", outcome.reasons);
    }

    #[tokio::test]
    async fn passing_outcome_reports_closest_limit() {
        let (gate, _, _) = fixture();
        let mut acct = account();
        acct.cash = 600.0; // 500/600 beats 500/10000 and 500/10000-equity-limit
        let outcome = gate.validate(&signal("AAPL", 0.8), &acct, &[]).await;
        assert!(outcome.can_trade);
        assert_eq!(outcome.checks.binding.as_deref(), Some("cash"));
    }
}
