// =============================================================================
// REST Ledger Client — HMAC-SHA256 signed requests to the tabular store
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Every request is
// signed over `{method}\n{path}\n{timestamp}` and carries the key id, the
// timestamp, and the signature as headers, so a captured request cannot be
// replayed outside the store's acceptance window.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::Value;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use crate::ledger::rate_limit::RequestBudget;
use crate::ledger::Ledger;

type HmacSha256 = Hmac<Sha256>;

/// REST client for the remote tabular ledger.
pub struct RestLedgerClient {
    base_url: String,
    secret: String,
    client: reqwest::Client,
    budget: RequestBudget,
}

impl RestLedgerClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Create a new `RestLedgerClient`.
    ///
    /// # Arguments
    /// * `base_url` — root URL of the ledger service, no trailing slash.
    /// * `key_id`   — ledger API key id (sent as a header).
    /// * `secret`   — secret used exclusively for HMAC signing.
    pub fn new(
        base_url: impl Into<String>,
        key_id: impl Into<String>,
        secret: impl Into<String>,
    ) -> Self {
        let key_id = key_id.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&key_id) {
            default_headers.insert("X-Ledger-Key", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        debug!(base_url = %base_url, "RestLedgerClient initialised");

        Self {
            base_url,
            secret: secret.into(),
            client,
            budget: RequestBudget::new(),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    /// Produce an HMAC-SHA256 hex signature of `payload`.
    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Current UNIX timestamp in milliseconds.
    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Build a signed request for `method` + `path`.
    fn signed_request(&self, method: reqwest::Method, path: &str) -> Result<reqwest::RequestBuilder> {
        if !self.budget.try_acquire() {
            anyhow::bail!("ledger request budget exhausted for this minute");
        }

        let ts = Self::timestamp_ms();
        let payload = format!("{}\n{}\n{}", method.as_str(), path, ts);
        let signature = self.sign(&payload);

        let url = format!("{}{}", self.base_url, path);
        Ok(self
            .client
            .request(method, &url)
            .header("X-Ledger-Timestamp", ts.to_string())
            .header("X-Ledger-Signature", signature))
    }

    fn row_path(table: &str, key: &str) -> String {
        format!("/api/tables/{table}/rows/{key}")
    }
}

#[async_trait]
impl Ledger for RestLedgerClient {
    #[instrument(skip(self), name = "ledger::get")]
    async fn get(&self, table: &str, key: &str) -> Result<Option<Value>> {
        let path = Self::row_path(table, key);
        let resp = self
            .signed_request(reqwest::Method::GET, &path)?
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger GET {path} returned {status}: {body}");
        }

        let row: Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse ledger row from {path}"))?;
        Ok(Some(row))
    }

    #[instrument(skip(self, row), name = "ledger::put")]
    async fn put(&self, table: &str, key: &str, row: Value) -> Result<()> {
        let path = Self::row_path(table, key);
        let resp = self
            .signed_request(reqwest::Method::PUT, &path)?
            .json(&row)
            .send()
            .await
            .with_context(|| format!("PUT {path} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger PUT {path} returned {status}: {body}");
        }
        Ok(())
    }

    #[instrument(skip(self), name = "ledger::delete")]
    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        let path = Self::row_path(table, key);
        let resp = self
            .signed_request(reqwest::Method::DELETE, &path)?
            .send()
            .await
            .with_context(|| format!("DELETE {path} request failed"))?;

        let status = resp.status();
        // Deleting an absent row is a success: the row is gone either way.
        if !status.is_success() && status != StatusCode::NOT_FOUND {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger DELETE {path} returned {status}: {body}");
        }
        Ok(())
    }

    #[instrument(skip(self), name = "ledger::scan_all")]
    async fn scan_all(&self, table: &str) -> Result<Vec<Value>> {
        let path = format!("/api/tables/{table}/rows");
        let resp = self
            .signed_request(reqwest::Method::GET, &path)?
            .send()
            .await
            .with_context(|| format!("GET {path} request failed"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("ledger scan of {table} returned {status}: {body}");
        }

        let rows: Vec<Value> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse ledger scan of {table}"))?;
        Ok(rows)
    }
}

impl std::fmt::Debug for RestLedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestLedgerClient")
            .field("base_url", &self.base_url)
            .field("budget", &self.budget)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_stable_for_same_payload() {
        let client = RestLedgerClient::new("http://ledger.local", "key", "secret");
        let a = client.sign("GET\n/api/tables/t/rows/K\n1700000000000");
        let b = client.sign("GET\n/api/tables/t/rows/K\n1700000000000");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn signature_differs_across_payloads() {
        let client = RestLedgerClient::new("http://ledger.local", "key", "secret");
        let a = client.sign("GET\n/a\n1");
        let b = client.sign("GET\n/b\n1");
        assert_ne!(a, b);
    }

    #[test]
    fn row_path_layout() {
        assert_eq!(
            RestLedgerClient::row_path("position_levels", "AAPL"),
            "/api/tables/position_levels/rows/AAPL"
        );
    }
}
