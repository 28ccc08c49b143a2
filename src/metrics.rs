// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Transaction assembly and filtering
//! - Scheduling (running set, file-boundary drains, queue depth)
//! - Destination pool and execution latency
//! - Progress log appends
//! - Replay lag
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replay_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed here; the host binary installs an exporter.

use crate::transaction::TrxKind;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Builder
// =============================================================================

/// Record a sealed transaction.
pub fn record_transaction_built(kind: TrxKind) {
    counter!("replay_transactions_built_total", "kind" => kind.as_str()).increment(1);
}

/// Record row images dropped by the schema skip list or the allow-list.
pub fn record_rows_filtered(reason: &'static str, rows: usize) {
    if rows > 0 {
        counter!("replay_rows_filtered_total", "reason" => reason).increment(rows as u64);
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Record a transaction not executed: recovered as already applied, or
/// abandoned during shutdown.
pub fn record_transaction_skipped(reason: &'static str) {
    counter!("replay_transactions_skipped_total", "reason" => reason).increment(1);
}

/// Record a completed transaction.
pub fn record_transaction_executed(kind: TrxKind, statements: usize, duration: Duration) {
    counter!("replay_transactions_executed_total", "kind" => kind.as_str()).increment(1);
    counter!("replay_statements_executed_total").increment(statements as u64);
    histogram!("replay_transaction_duration_seconds", "kind" => kind.as_str())
        .record(duration.as_secs_f64());
}

/// Record a statement failure.
pub fn record_execution_failure() {
    counter!("replay_execution_failures_total").increment(1);
}

/// Record a full drain of the running set at a binlog file change.
pub fn record_file_boundary_drain(drained: usize) {
    counter!("replay_file_boundary_drains_total").increment(1);
    histogram!("replay_file_boundary_drained").record(drained as f64);
}

/// Record how long the dispatcher waited before a transaction could start.
pub fn record_schedule_wait(duration: Duration) {
    histogram!("replay_schedule_wait_seconds").record(duration.as_secs_f64());
}

/// Gauge for transactions currently running.
pub fn set_running(count: usize) {
    gauge!("replay_running_transactions").set(count as f64);
}

// =============================================================================
// Connection pool
// =============================================================================

/// Record a destination connect attempt.
pub fn record_connection_opened(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replay_connections_opened_total", "status" => status).increment(1);
}

/// Gauges for pool occupancy by status.
pub fn set_pool_status(idle: usize, busy: usize, xa_prepared: usize) {
    gauge!("replay_pool_connections", "status" => "idle").set(idle as f64);
    gauge!("replay_pool_connections", "status" => "busy").set(busy as f64);
    gauge!("replay_pool_connections", "status" => "xa_prepared").set(xa_prepared as f64);
}

// =============================================================================
// Progress log and lag
// =============================================================================

/// Record one progress log append.
pub fn record_progress_append(duration: Duration) {
    counter!("replay_progress_appends_total").increment(1);
    histogram!("replay_progress_append_duration_seconds").record(duration.as_secs_f64());
}

/// Set replay lag from a completed transaction's source commit timestamp.
pub fn record_replay_lag(source_timestamp: u64) {
    let now = chrono::Utc::now().timestamp();
    let lag = (now - source_timestamp as i64).max(0);
    gauge!("replay_lag_seconds").set(lag as f64);
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Recovering" => 1.0,
        "Running" => 2.0,
        "ShuttingDown" => 3.0,
        "Stopped" => 4.0,
        "Failed" => 5.0,
        _ => -1.0,
    };
    gauge!("replay_engine_state").set(value);
}
