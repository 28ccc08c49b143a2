// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replay engine.
//!
//! Errors are categorized by how the run must react to them.
//!
//! # Error Categories
//!
//! | Error Type | Fatal | Description |
//! |------------|-------|-------------|
//! | `Connect` | Yes | Destination session could not be opened |
//! | `Execute` | Yes | A statement failed on the destination |
//! | `Malformed` | Yes | Sealed transaction violates its invariant |
//! | `EventSource` | Yes | Upstream decoder failed |
//! | `ProgressLog` | Yes | Progress log could not be read or written |
//! | `ProgressParse` | No | One progress log line is unreadable |
//! | `Config` | Yes | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | Yes | Unexpected internal error |
//!
//! Nothing here is retried automatically. An `Execute` failure leaves the
//! destination in a state that must be inspected before restarting.

use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T> = std::result::Result<T, ReplayError>;

/// A transaction was sealed without the metadata needed to schedule it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantError {
    #[error("transaction has no gtid")]
    MissingGtid,

    #[error("transaction {gtid} has no dependency numbers")]
    MissingDependency { gtid: String },

    #[error("transaction {gtid} has no binlog file")]
    MissingFile { gtid: String },

    #[error("transaction {gtid}: last_committed {last_committed} >= sequence_number {sequence_number}")]
    DependencyOrder {
        gtid: String,
        last_committed: i64,
        sequence_number: i64,
    },

    #[error("transaction {gtid} of kind {kind} has no xid")]
    MissingXid { gtid: String, kind: String },
}

/// Errors that can occur while replaying.
#[derive(Error, Debug)]
pub enum ReplayError {
    /// Opening a destination session failed.
    ///
    /// Never retried: a degraded pool cannot honour the parallelism the
    /// scheduler assumes.
    #[error("Destination connect error: {0}")]
    Connect(String),

    /// A statement failed against the destination.
    #[error("Execution failed on conn {conn_id} for {gtid}: {message} (sql: {sql})")]
    Execute {
        gtid: String,
        conn_id: u64,
        sql: String,
        message: String,
    },

    /// A sealed transaction failed its well-formedness check.
    #[error("Malformed transaction: {0}")]
    Malformed(#[from] InvariantError),

    /// The external event source failed.
    #[error("Event source error: {0}")]
    EventSource(String),

    /// I/O on the progress log failed.
    #[error("Progress log error: {0}")]
    ProgressLog(#[from] std::io::Error),

    /// A progress log line could not be parsed.
    #[error("Progress log parse error at {line:?}: {message}")]
    ProgressParse { line: String, message: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplayError {
    /// Create an execution error for one failed statement.
    pub fn execute(
        gtid: impl Into<String>,
        conn_id: u64,
        sql: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Execute {
            gtid: gtid.into(),
            conn_id,
            sql: sql.into(),
            message: message.into(),
        }
    }

    /// Check if this error must end the run.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Connect(_) => true,
            Self::Execute { .. } => true,
            Self::Malformed(_) => true,
            Self::EventSource(_) => true,
            Self::ProgressLog(_) => true,
            Self::ProgressParse { .. } => false, // the line is skipped
            Self::Config(_) => true,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => true,
        }
    }
}
