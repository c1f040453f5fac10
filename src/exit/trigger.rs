// =============================================================================
// Exit Trigger Evaluation — stop-loss / take-profit against the live quote
// =============================================================================
//
// Longs are marked against the bid (what a sell would fetch), shorts
// against the ask (what a buy-to-cover would cost).
//
// The buffer keeps spread noise from whipsawing the trigger: the stop must
// be penetrated by the buffer fraction before it fires, while the
// take-profit fires that fraction early. With quotes straddling the
// nominal level, a position would otherwise oscillate just above and below
// the line without ever firing.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::broker::Quote;
use crate::state_store::PositionLevels;
use crate::types::PositionSide;

/// Which stored level a quote has crossed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StopLoss => write!(f, "SL"),
            Self::TakeProfit => write!(f, "TP"),
        }
    }
}

/// The quote side a position of the given direction is marked against.
pub fn reference_price(side: PositionSide, quote: &Quote) -> f64 {
    match side {
        PositionSide::Long => quote.bid,
        PositionSide::Short => quote.ask,
    }
}

/// Evaluate the stored levels against the live quote.
///
/// Returns `Some(trigger)` when the position should be closed, `None` when
/// it should be held. The stop-loss is checked first.
pub fn evaluate_trigger(
    levels: &PositionLevels,
    quote: &Quote,
    buffer: f64,
) -> Option<ExitTrigger> {
    let price = reference_price(levels.side, quote);

    match levels.side {
        PositionSide::Long => {
            if let Some(sl) = levels.stop_loss {
                if price <= sl * (1.0 - buffer) {
                    return Some(ExitTrigger::StopLoss);
                }
            }
            if let Some(tp) = levels.take_profit {
                if price >= tp * (1.0 - buffer) {
                    return Some(ExitTrigger::TakeProfit);
                }
            }
        }
        PositionSide::Short => {
            if let Some(sl) = levels.stop_loss {
                if price >= sl * (1.0 + buffer) {
                    return Some(ExitTrigger::StopLoss);
                }
            }
            if let Some(tp) = levels.take_profit {
                if price <= tp * (1.0 + buffer) {
                    return Some(ExitTrigger::TakeProfit);
                }
            }
        }
    }

    None
}

// =============================================================================
// Tests
// =============================================================================
