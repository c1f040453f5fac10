// =============================================================================
// Central Application State — Meridian Trading Engine
// =============================================================================
//
// Shared handle for the API layer. The engine itself is stateless across
// invocations; everything here is operational telemetry (recent reports,
// recent errors) plus the live configuration.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot::RwLock for the capped ring buffers.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;

use crate::engine::{InvocationReport, TradingEngine};
use crate::runtime_config::RuntimeConfig;
use crate::state_store::PositionStateStore;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 50;
/// Maximum number of recent invocation reports to retain.
const MAX_RECENT_REPORTS: usize = 100;

/// A recorded error event for the status API.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    /// ISO 8601 timestamp.
    pub at: String,
}

/// Central application state shared across async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub engine: Arc<TradingEngine>,
    pub store: Arc<PositionStateStore>,

    pub recent_reports: RwLock<Vec<InvocationReport>>,
    pub recent_errors: RwLock<Vec<ErrorRecord>>,

    /// Instant when the engine was started. Used for uptime calculations.
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(
        runtime_config: Arc<RwLock<RuntimeConfig>>,
        engine: Arc<TradingEngine>,
    ) -> Self {
        let store = engine.store();
        Self {
            state_version: AtomicU64::new(1),
            runtime_config,
            engine,
            store,
            recent_reports: RwLock::new(Vec::new()),
            recent_errors: RwLock::new(Vec::new()),
            start_time: std::time::Instant::now(),
        }
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Telemetry rings ─────────────────────────────────────────────────

    /// Record an invocation report, evicting the oldest past the cap.
    pub fn push_report(&self, report: InvocationReport) {
        let mut reports = self.recent_reports.write();
        reports.push(report);
        while reports.len() > MAX_RECENT_REPORTS {
            reports.remove(0);
        }
        self.increment_version();
    }

    /// Record an error message, evicting the oldest past the cap.
    pub fn push_error(&self, message: String) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message,
            at: Utc::now().to_rfc3339(),
        });
        while errors.len() > MAX_RECENT_ERRORS {
            errors.remove(0);
        }
        self.increment_version();
    }

    // ── Snapshot ────────────────────────────────────────────────────────

    /// Build the status payload for `GET /api/v1/state`.
    pub fn build_snapshot(&self) -> StateSnapshot {
        let config = self.runtime_config.read();
        StateSnapshot {
            state_version: self.current_state_version(),
            server_time: Utc::now().timestamp_millis(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            trading_mode: config.trading_mode.to_string(),
            account_mode: config.account_mode.to_string(),
            symbols: config.symbols.clone(),
            tick_interval_secs: config.tick_interval_secs,
            last_report: self.recent_reports.read().last().cloned(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

/// Engine status snapshot sent to operators.
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub server_time: i64,
    pub uptime_secs: u64,
    pub trading_mode: String,
    pub account_mode: String,
    pub symbols: Vec<String>,
    pub tick_interval_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<InvocationReport>,
    pub recent_errors: Vec<ErrorRecord>,
}

// =============================================================================
// Tests
// =============================================================================
