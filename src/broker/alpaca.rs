// =============================================================================
// Alpaca REST API Client — key/secret header authentication
// =============================================================================
//
// SECURITY: credentials travel only as request headers and are never logged
// or serialized. Trading endpoints default to the paper host; set
// APCA_API_BASE_URL to point at the live host.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::broker::{AccountSnapshot, Broker, BrokerPosition, Order, OrderRequest, Quote};
use crate::types::PositionSide;

const DEFAULT_BASE_URL: &str = "https://paper-api.alpaca.markets";
const DEFAULT_DATA_URL: &str = "https://data.alpaca.markets";

/// Alpaca REST client.
#[derive(Clone)]
pub struct AlpacaClient {
    base_url: String,
    data_url: String,
    client: reqwest::Client,
}

impl AlpacaClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `AlpacaClient` against the paper trading host.
    ///
    /// # Arguments
    /// * `key_id` — Alpaca API key id.
    /// * `secret` — Alpaca API secret key.
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        let key_id = key_id.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&key_id) {
            default_headers.insert("APCA-API-KEY-ID", val);
        }
        if let Ok(val) = HeaderValue::from_str(&secret) {
            default_headers.insert("APCA-API-SECRET-KEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!(base_url = DEFAULT_BASE_URL, "AlpacaClient initialised");

        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            data_url: DEFAULT_DATA_URL.to_string(),
            client,
        }
    }

    /// Override the trading host (e.g. the live host, or a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the market data host.
    pub fn with_data_url(mut self, data_url: impl Into<String>) -> Self {
        self.data_url = data_url.into();
        self
    }

    // -------------------------------------------------------------------------
    // Request helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} request failed"))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;

        if !status.is_success() {
            anyhow::bail!("Alpaca GET {url} returned {status}: {body}");
        }
        Ok(body)
    }

    /// Alpaca encodes numeric fields as JSON strings; accept either shape.
    fn num_field(value: &Value, field: &str) -> Result<f64> {
        let v = &value[field];
        if let Some(n) = v.as_f64() {
            return Ok(n);
        }
        v.as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .with_context(|| format!("missing or non-numeric field '{field}' in {value}"))
    }

    fn opt_num_field(value: &Value, field: &str) -> Option<f64> {
        let v = &value[field];
        v.as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse::<f64>().ok()))
    }

    fn parse_order(body: &Value) -> Result<Order> {
        Ok(Order {
            id: body["id"]
                .as_str()
                .context("order response missing 'id'")?
                .to_string(),
            status: body["status"].as_str().unwrap_or("unknown").to_string(),
            filled_avg_price: Self::opt_num_field(body, "filled_avg_price"),
        })
    }
}

#[async_trait]
impl Broker for AlpacaClient {
    /// GET /v2/account.
    #[instrument(skip(self), name = "alpaca::get_account")]
    async fn get_account(&self) -> Result<AccountSnapshot> {
        let url = format!("{}/v2/account", self.base_url);
        let body = self.get_json(&url).await?;

        Ok(AccountSnapshot {
            equity: Self::num_field(&body, "equity")?,
            cash: Self::num_field(&body, "cash")?,
            buying_power: Self::num_field(&body, "buying_power")?,
        })
    }

    /// GET /v2/positions.
    #[instrument(skip(self), name = "alpaca::get_positions")]
    async fn get_positions(&self) -> Result<Vec<BrokerPosition>> {
        let url = format!("{}/v2/positions", self.base_url);
        let body = self.get_json(&url).await?;

        let raw = body
            .as_array()
            .context("positions response is not an array")?;

        let mut positions = Vec::with_capacity(raw.len());
        for p in raw {
            let side = match p["side"].as_str() {
                Some("long") => PositionSide::Long,
                Some("short") => PositionSide::Short,
                other => anyhow::bail!("unknown position side {other:?} in {p}"),
            };
            positions.push(BrokerPosition {
                symbol: p["symbol"]
                    .as_str()
                    .context("position missing 'symbol'")?
                    .to_uppercase(),
                qty: Self::num_field(p, "qty")?,
                side,
                avg_entry_price: Self::num_field(p, "avg_entry_price")?,
                current_price: Self::opt_num_field(p, "current_price").unwrap_or(0.0),
            });
        }

        debug!(count = positions.len(), "broker positions fetched");
        Ok(positions)
    }

    /// GET /v2/stocks/{symbol}/quotes/latest (data host).
    #[instrument(skip(self), name = "alpaca::get_quote")]
    async fn get_quote(&self, symbol: &str) -> Result<Quote> {
        let url = format!("{}/v2/stocks/{}/quotes/latest", self.data_url, symbol);
        let body = self.get_json(&url).await?;

        let quote = &body["quote"];
        Ok(Quote {
            bid: Self::num_field(quote, "bp")?,
            ask: Self::num_field(quote, "ap")?,
        })
    }

    /// POST /v2/orders.
    #[instrument(skip(self, req), name = "alpaca::submit_order", fields(symbol = %req.symbol, side = %req.side, qty = req.qty))]
    async fn submit_order(&self, req: &OrderRequest) -> Result<Order> {
        let url = format!("{}/v2/orders", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(req)
            .send()
            .await
            .context("POST /v2/orders request failed")?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .context("failed to parse order response")?;

        if !status.is_success() {
            anyhow::bail!("Alpaca POST /v2/orders returned {status}: {body}");
        }

        let order = Self::parse_order(&body)?;
        debug!(order_id = %order.id, status = %order.status, "order submitted");
        Ok(order)
    }

    /// GET /v2/orders/{id}.
    #[instrument(skip(self), name = "alpaca::get_order")]
    async fn get_order(&self, id: &str) -> Result<Order> {
        let url = format!("{}/v2/orders/{}", self.base_url, id);
        let body = self.get_json(&url).await?;
        Self::parse_order(&body)
    }

    /// GET /v2/clock.
    #[instrument(skip(self), name = "alpaca::is_market_open")]
    async fn is_market_open(&self) -> Result<bool> {
        let url = format!("{}/v2/clock", self.base_url);
        let body = self.get_json(&url).await?;
        body["is_open"]
            .as_bool()
            .context("clock response missing 'is_open'")
    }
}

impl std::fmt::Debug for AlpacaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlpacaClient")
            .field("base_url", &self.base_url)
            .field("data_url", &self.data_url)
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

    #[test]
    fn num_field_accepts_string_and_number() {
        let v = json!({"equity": "25000.50", "cash": 1234.5});
        assert_eq!(AlpacaClient::num_field(&v, "equity").unwrap(), 25000.50);
        assert_eq!(AlpacaClient::num_field(&v, "cash").unwrap(), 1234.5);
        assert!(AlpacaClient::num_field(&v, "missing").is_err());
    }

    #[test]
    fn parse_order_handles_unfilled() {
        let v = json!({"id": "abc", "status": "accepted", "filled_avg_price": null});
        let order = AlpacaClient::parse_order(&v).unwrap();
        assert_eq!(order.id, "abc");
        assert!(!order.is_filled());
        assert!(order.filled_avg_price.is_none());
    }

    #[test]
    fn parse_order_handles_filled_string_price() {
        let v = json!({"id": "abc", "status": "filled", "filled_avg_price": "53.10"});
        let order = AlpacaClient::parse_order(&v).unwrap();
        assert!(order.is_filled());
        assert_eq!(order.filled_avg_price, Some(53.10));
    }

    #[test]
    fn market_order_request_serialises_type_field() {
        let req = OrderRequest::market("AAPL", 10.0, crate::types::OrderSide::Buy);
        let v = serde_json::to_value(&req).unwrap();
        assert_eq!(v["type"], "market");
        assert_eq!(v["time_in_force"], "day");
        assert_eq!(v["side"], "buy");
        assert!(v.get("client_order_id").is_none());
    }
}
