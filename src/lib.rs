// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Binlog Replay
//!
//! Parallel, resumable replay of a MySQL binlog transaction stream onto a
//! destination database.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                             binlog-replay                                │
//! │                                                                          │
//! │  ┌─────────────┐   ┌────────────────────┐   ┌─────────────────────────┐  │
//! │  │ EventSource │──►│ TransactionBuilder │──►│ bounded queue (500)     │  │
//! │  │ (decoder)   │   │ (seal, trim, SQL)  │   └───────────┬─────────────┘  │
//! │  └─────────────┘   └────────────────────┘               ▼                │
//! │                                              ┌─────────────────────────┐ │
//! │  ┌──────────────────┐                        │ Dispatcher coordinator  │ │
//! │  │ PreviousExecution│──── skip replayed ────►│ (overlap, XA affinity)  │ │
//! │  └──────────────────┘                        └──────┬───────────▲──────┘ │
//! │           ▲                                    jobs │           │ done   │
//! │           │                                         ▼           │        │
//! │  ┌──────────────────┐                        ┌─────────────────────────┐ │
//! │  │ ProgressLog      │◄──── completed ────────│ Workers × N → sessions  │ │
//! │  └──────────────────┘                        └─────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Parallelism
//!
//! MySQL stamps each transaction with `last_committed` / `sequence_number`.
//! Transactions of one binlog file whose ranges overlap were committed
//! without conflict on the source and may run concurrently on separate
//! destination sessions. XA prepare/commit pairs are pinned to one session.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use binlog_replay::{ReplayConfig, ReplayEngine};
//! use binlog_replay::event::ChannelEventSource;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplayConfig::for_testing("mysql://root@127.0.0.1:3306");
//!     let mut engine = ReplayEngine::new(config).expect("Invalid config");
//!     let _start = engine.recover().await.expect("Recovery failed");
//!
//!     let (_tx, source) = ChannelEventSource::channel(1024);
//!     engine.run(source).await.expect("Replay failed");
//! }
//! ```

pub mod builder;
pub mod config;
pub mod destination;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod metrics;
pub mod orchestrator;
pub mod recovery;
pub mod sql;
pub mod transaction;

// Re-exports for convenience
pub use builder::TransactionBuilder;
pub use config::{DestinationConfig, FilterConfig, ReplayConfig, StartPosition};
pub use destination::{Destination, DryRunDestination, MySqlDestination, Session};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherSettings, ShutdownSignal};
pub use error::{InvariantError, ReplayError, Result};
pub use event::{BinlogEvent, ChannelEventSource, EventSource};
pub use orchestrator::{EngineState, ReplayEngine};
pub use recovery::{PreviousExecution, ProgressLog};
pub use transaction::{DependencyRange, Gtid, ProgressRecord, Transaction, TrxKind};
