// =============================================================================
// Broker — account, position, quote, and order access
// =============================================================================
//
// The engine holds no position state of its own; the broker's view of held
// positions is the truth the exit monitor reconciles against. Every method
// is a single bounded network request.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{OrderSide, PositionSide};

pub mod alpaca;

pub use alpaca::AlpacaClient;

/// Account snapshot: read once per invocation, after exits have freed
/// capital, and used for all sizing checks in that invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity: f64,
    pub cash: f64,
    pub buying_power: f64,
}

/// A broker-held position. `qty` is signed as reported by the broker and
/// may drift from any locally recorded quantity through partial fills.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub symbol: String,
    pub qty: f64,
    pub side: PositionSide,
    pub avg_entry_price: f64,
    pub current_price: f64,
}

/// Top-of-book quote.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
}

/// An order submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub qty: f64,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: String,
    pub time_in_force: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_order_id: Option<String>,
}

impl OrderRequest {
    /// A day market order, the only order type the engine submits.
    pub fn market(symbol: impl Into<String>, qty: f64, side: OrderSide) -> Self {
        Self {
            symbol: symbol.into(),
            qty,
            side,
            order_type: "market".to_string(),
            time_in_force: "day".to_string(),
            client_order_id: None,
        }
    }

    pub fn with_client_order_id(mut self, id: impl Into<String>) -> Self {
        self.client_order_id = Some(id.into());
        self
    }
}

/// Broker's view of a submitted order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub filled_avg_price: Option<f64>,
}

impl Order {
    pub fn is_filled(&self) -> bool {
        self.status == "filled"
    }
}

/// Brokerage access consumed by the engine.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn get_account(&self) -> Result<AccountSnapshot>;
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>>;
    async fn get_quote(&self, symbol: &str) -> Result<Quote>;
    async fn submit_order(&self, req: &OrderRequest) -> Result<Order>;
    async fn get_order(&self, id: &str) -> Result<Order>;
    async fn is_market_open(&self) -> Result<bool>;
}
