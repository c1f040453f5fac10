// =============================================================================
// Exit subsystem — trigger evaluation and the per-invocation sweep
// =============================================================================

pub mod monitor;
pub mod trigger;

pub use monitor::{EmergencyStopReport, ExitMonitor, ExitOutcome, ExitStatus, MonitorConfig, SweepReport};
pub use trigger::{evaluate_trigger, ExitTrigger};
