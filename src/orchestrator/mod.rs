// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replay engine orchestrator.
//!
//! Ties together:
//! - Resume state via [`crate::recovery::PreviousExecution`]
//! - Transaction assembly via [`crate::builder::TransactionBuilder`]
//! - Scheduling via [`crate::dispatcher::Dispatcher`]
//! - The progress log via [`crate::recovery::ProgressLog`]
//!
//! # Lifecycle
//!
//! 1. [`ReplayEngine::recover()`] reads the progress log tail and returns the
//!    position the event source must start from.
//! 2. The host opens its decoder at that position.
//! 3. [`ReplayEngine::run()`] builds and dispatches until the source ends,
//!    shutdown is raised, or something fails.
//!
//! ```rust,no_run
//! use binlog_replay::{ReplayConfig, ReplayEngine};
//! use binlog_replay::event::ChannelEventSource;
//!
//! #[tokio::main]
//! async fn main() -> binlog_replay::Result<()> {
//!     let config = ReplayConfig::from_json_file("replay.json")?;
//!     let mut engine = ReplayEngine::new(config)?;
//!     let start = engine.recover().await?;
//!
//!     // a decoder task streams events from `start` into `tx`
//!     let (_tx, source) = ChannelEventSource::channel(1024);
//!     let _ = start;
//!
//!     let stats = engine.run(source).await?;
//!     println!("executed {}", stats.executed);
//!     Ok(())
//! }
//! ```

mod types;

pub use types::EngineState;

use crate::builder::TransactionBuilder;
use crate::config::{ReplayConfig, StartPosition};
use crate::destination::{AnyDestination, Destination};
use crate::dispatcher::{DispatchStats, Dispatcher, DispatcherSettings, ShutdownSignal};
use crate::error::{ReplayError, Result};
use crate::event::EventSource;
use crate::metrics;
use crate::recovery::{PreviousExecution, ProgressLog};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// The main replay engine.
///
/// Generic over the destination so tests can substitute a recording one.
pub struct ReplayEngine<D: Destination = AnyDestination> {
    config: ReplayConfig,

    destination: D,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,

    state_rx: watch::Receiver<EngineState>,

    /// Shared with the dispatcher, its workers and any host signal handler.
    shutdown: ShutdownSignal,

    /// `Some(None)` once recovery ran and found nothing.
    previous: Option<Option<PreviousExecution>>,
}

impl ReplayEngine<AnyDestination> {
    /// Create an engine for the configured destination (MySQL or dry run).
    pub fn new(config: ReplayConfig) -> Result<Self> {
        config.validate()?;
        let destination = AnyDestination::from_config(&config.destination)?;
        Ok(Self::with_destination(config, destination))
    }
}

impl<D: Destination> ReplayEngine<D> {
    /// Create an engine with an explicit destination.
    pub fn with_destination(config: ReplayConfig, destination: D) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        Self {
            config,
            destination,
            state_tx,
            state_rx,
            shutdown: ShutdownSignal::new(),
            previous: None,
        }
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Handle for raising shutdown from another task (e.g. a signal handler).
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    /// Request a graceful stop: no new jobs, running jobs finish.
    pub fn shutdown(&self) {
        if self.shutdown.trigger() {
            info!("Shutdown requested");
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        metrics::set_engine_state(&state.to_string());
    }

    /// Read the previous execution and return where the event source must
    /// start: the recovered anchor when there is one, else the configured
    /// start position.
    pub async fn recover(&mut self) -> Result<StartPosition> {
        let state = self.state();
        if state != EngineState::Created {
            return Err(ReplayError::InvalidState {
                expected: "Created".to_string(),
                actual: state.to_string(),
            });
        }
        self.set_state(EngineState::Recovering);

        let progress = &self.config.progress;
        let previous = match PreviousExecution::read(&progress.path, progress.lookback).await {
            Ok(previous) => previous,
            Err(e) => {
                error!(error = %e, "Cannot read progress log");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };
        let start = match &previous {
            Some(p) => {
                info!(
                    log_file = %p.start_log_file(),
                    log_pos = p.start_log_pos(),
                    tracked = p.len(),
                    "Resuming from previous execution"
                );
                StartPosition::File {
                    log_file: p.start_log_file().to_string(),
                    log_pos: p.start_log_pos(),
                }
            }
            None => {
                info!(start = ?self.config.start, "No previous execution, using configured start");
                self.config.start.clone()
            }
        };
        self.previous = Some(previous);
        Ok(start)
    }

    /// Build and dispatch transactions from `source` until it ends, shutdown
    /// is raised, or a fatal error occurs.
    ///
    /// Recovers first if [`recover()`](Self::recover) was not called.
    pub async fn run<E: EventSource>(mut self, source: E) -> Result<DispatchStats> {
        if self.previous.is_none() {
            self.recover().await?;
        }
        let state = self.state();
        if state != EngineState::Recovering {
            return Err(ReplayError::InvalidState {
                expected: "Recovering".to_string(),
                actual: state.to_string(),
            });
        }
        let previous = self.previous.take().flatten();

        let truncate = previous.is_none() && self.config.progress.truncate_on_fresh_start;
        let progress = match ProgressLog::open(&self.config.progress, truncate).await {
            Ok(log) => log,
            Err(e) => {
                error!(error = %e, path = %self.config.progress.path, "Cannot open progress log");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        };

        let mut builder = TransactionBuilder::from_config(source, &self.config);
        let settings = DispatcherSettings::from_config(&self.config);
        let ReplayEngine {
            config: _,
            destination,
            state_tx,
            state_rx: _,
            shutdown,
            previous: _,
        } = self;
        let set_state = |state: EngineState| {
            let _ = state_tx.send(state);
            metrics::set_engine_state(&state.to_string());
        };

        let dispatcher =
            Dispatcher::start_with_signal(destination, settings, progress, previous, shutdown.clone());
        set_state(EngineState::Running);
        info!("Replay engine running");

        let mut source_error = None;
        loop {
            let next = tokio::select! {
                next = builder.next_transaction() => next,
                _ = shutdown.wait() => break,
            };
            match next {
                Ok(Some(trx)) => {
                    if dispatcher.submit(trx).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Event stream ended");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Transaction stream failed");
                    source_error = Some(e);
                    dispatcher.quit();
                    break;
                }
            }
        }
        builder.close();
        set_state(EngineState::ShuttingDown);

        let result = match (dispatcher.join().await, source_error) {
            // the dispatcher's failure is the root cause when both failed
            (Err(e), _) => Err(e),
            (Ok(_), Some(e)) => Err(e),
            (Ok(stats), None) => Ok(stats),
        };
        match &result {
            Ok(stats) => {
                set_state(EngineState::Stopped);
                info!(
                    executed = stats.executed,
                    skipped = stats.skipped,
                    abandoned = stats.abandoned,
                    "Replay engine stopped"
                );
            }
            Err(e) => {
                set_state(EngineState::Failed);
                warn!(error = %e, "Replay engine failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::DryRunDestination;
    use crate::event::{BinlogEvent, ChannelEventSource};
    use tempfile::tempdir;

    fn config_in(dir: &std::path::Path) -> ReplayConfig {
        let mut config = ReplayConfig::for_testing("");
        config.destination.dry_run = true;
        config.progress.path = dir.join("progress.log").display().to_string();
        config.progress.sync = false;
        config
    }

    fn commit(n: u64, lc: i64, seq: i64) -> Vec<BinlogEvent> {
        vec![
            BinlogEvent::Gtid {
                gtid: format!("uuid:{}", n),
                last_committed: lc,
                sequence_number: seq,
                timestamp: 1_700_000_000,
            },
            BinlogEvent::Query {
                schema: Some("d".into()),
                sql: "BEGIN".into(),
                log_pos: n * 100,
            },
            BinlogEvent::Query {
                schema: Some("d".into()),
                sql: format!("insert into d.t values({})", n),
                log_pos: n * 100 + 10,
            },
            BinlogEvent::Xid { log_pos: n * 100 + 50 },
        ]
    }

    fn stream(count: u64) -> ChannelEventSource {
        let mut events = vec![BinlogEvent::Rotate {
            next_file: "mysql-bin.000001".into(),
        }];
        for n in 1..=count {
            events.extend(commit(n, n as i64 - 1, n as i64));
        }
        ChannelEventSource::from_events(events)
    }

    #[test]
    fn test_engine_initial_state() {
        let dir = tempdir().unwrap();
        let engine = ReplayEngine::new(config_in(dir.path())).unwrap();
        assert_eq!(engine.state(), EngineState::Created);
        assert_eq!(*engine.state_receiver().borrow(), EngineState::Created);
    }

    #[test]
    fn test_engine_rejects_invalid_config() {
        let mut config = ReplayConfig::for_testing("mysql://localhost");
        config.destination.max_connections = 0;
        assert!(matches!(ReplayEngine::new(config), Err(ReplayError::Config(_))));
    }

    #[tokio::test]
    async fn test_fresh_start_uses_configured_position() {
        let dir = tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.start = StartPosition::File {
            log_file: "mysql-bin.000009".into(),
            log_pos: 4,
        };
        let mut engine = ReplayEngine::new(config.clone()).unwrap();
        assert_eq!(engine.recover().await.unwrap(), config.start);
        assert_eq!(engine.state(), EngineState::Recovering);
    }

    #[tokio::test]
    async fn test_recover_twice_is_invalid() {
        let dir = tempdir().unwrap();
        let mut engine = ReplayEngine::new(config_in(dir.path())).unwrap();
        engine.recover().await.unwrap();
        let err = engine.recover().await.unwrap_err();
        assert!(matches!(err, ReplayError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_dry_run_end_to_end_then_resume() {
        let dir = tempdir().unwrap();
        let config = config_in(dir.path());

        let engine = ReplayEngine::new(config.clone()).unwrap();
        let state_rx = engine.state_receiver();
        let stats = engine.run(stream(3)).await.unwrap();
        assert_eq!(stats.executed, 3);
        assert_eq!(*state_rx.borrow(), EngineState::Stopped);

        let log = std::fs::read_to_string(&config.progress.path).unwrap();
        assert_eq!(log.lines().count(), 3);

        // second run resumes at uuid:1 and skips the three replayed ones
        let mut engine = ReplayEngine::new(config.clone()).unwrap();
        let start = engine.recover().await.unwrap();
        assert_eq!(
            start,
            StartPosition::File {
                log_file: "mysql-bin.000001".into(),
                log_pos: 150,
            }
        );
        let stats = engine.run(stream(4)).await.unwrap();
        assert_eq!(stats.skipped, 3);
        assert_eq!(stats.executed, 1);
    }

    #[tokio::test]
    async fn test_source_error_fails_run() {
        let dir = tempdir().unwrap();
        let engine = ReplayEngine::new(config_in(dir.path())).unwrap();
        let state_rx = engine.state_receiver();

        let (tx, source) = ChannelEventSource::channel(8);
        tx.send(Err(ReplayError::EventSource("binlog purged".into())))
            .await
            .unwrap();
        drop(tx);

        let err = engine.run(source).await.unwrap_err();
        assert!(matches!(err, ReplayError::EventSource(_)));
        assert_eq!(*state_rx.borrow(), EngineState::Failed);
    }

    #[tokio::test]
    async fn test_shutdown_before_run_stops_cleanly() {
        let dir = tempdir().unwrap();
        let engine = ReplayEngine::new(config_in(dir.path())).unwrap();
        engine.shutdown();
        let (_tx, source) = ChannelEventSource::channel(8);
        let stats = engine.run(source).await.unwrap();
        assert_eq!(stats.executed, 0);
    }
}
