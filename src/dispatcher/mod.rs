// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Concurrent transaction scheduling.
//!
//! # Architecture
//!
//! ```text
//!  submit() ──► bounded queue ──► Coordinator ──► job queue ──► Worker × N
//!                                   │   ▲                          │
//!                                   │   └──── completion channel ◄─┘
//!                                   ├── ConnectionPool (status, xid)
//!                                   ├── running set
//!                                   └── ProgressLog
//! ```
//!
//! The coordinator is the single writer of connection status, XID bindings,
//! running-set membership and the progress log. Workers only execute and
//! report.
//!
//! # Eligibility
//!
//! Dependency ranges are comparable only within one binlog file. A
//! transaction starts when the running set is empty or when it overlaps
//! every running transaction; a change of file drains the running set
//! first.
//!
//! # Shutdown
//!
//! A [`ShutdownSignal`] is raised at most once, by [`Dispatcher::quit()`],
//! by a failed statement, or by a failed connect. Once raised no new job is
//! issued; running jobs finish and the workers stop. [`Dispatcher::join()`]
//! without `quit()` first replays everything already submitted.

mod pool;
mod worker;

pub use pool::ConnStatus;

use crate::config::ReplayConfig;
use crate::destination::Destination;
use crate::error::{ReplayError, Result};
use crate::metrics;
use crate::recovery::{PreviousExecution, ProgressLog};
use crate::transaction::{DependencyRange, Gtid, Transaction, TrxKind};
use pool::{Acquire, ConnectionPool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};
use worker::{Completion, Job, JobOutcome, WorkItem};

// ═══════════════════════════════════════════════════════════════════════════════
// ShutdownSignal
// ═══════════════════════════════════════════════════════════════════════════════

/// Set-once shutdown flag shared by the coordinator, workers and submitters.
#[derive(Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Raise the signal. Returns `true` only for the call that raised it.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|raised| {
            if *raised {
                false
            } else {
                *raised = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolve once the signal is raised.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in self, so this cannot fail
        let _ = rx.wait_for(|raised| *raised).await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Settings and stats
// ═══════════════════════════════════════════════════════════════════════════════

/// Dispatcher sizing.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    pub max_connections: usize,
    pub workers: usize,
    pub queue_capacity: usize,
}

impl DispatcherSettings {
    pub fn from_config(config: &ReplayConfig) -> Self {
        Self {
            max_connections: config.destination.max_connections,
            workers: config.worker_count(),
            queue_capacity: config.dispatch.queue_capacity,
        }
    }
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            max_connections: 20,
            workers: 20,
            queue_capacity: 500,
        }
    }
}

/// Counters reported by [`Dispatcher::join()`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Transactions received from the queue.
    pub received: u64,
    /// Completed and logged.
    pub executed: u64,
    /// Recognised as completed by a previous run.
    pub skipped: u64,
    /// Not executed because shutdown was raised first.
    pub abandoned: u64,
    pub failed: u64,
    /// Destination sessions opened.
    pub connections: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Dispatcher
// ═══════════════════════════════════════════════════════════════════════════════

/// Handle to a running coordinator and its workers.
pub struct Dispatcher {
    submit_tx: Option<mpsc::Sender<Transaction>>,
    shutdown: ShutdownSignal,
    coordinator: Option<JoinHandle<Result<DispatchStats>>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the coordinator and `settings.workers` workers.
    ///
    /// Must be called within a Tokio runtime.
    pub fn start<D: Destination>(
        destination: D,
        settings: DispatcherSettings,
        progress: ProgressLog,
        previous: Option<PreviousExecution>,
    ) -> Self {
        Self::start_with_signal(destination, settings, progress, previous, ShutdownSignal::new())
    }

    /// Like [`start()`](Self::start) but sharing an existing signal.
    pub fn start_with_signal<D: Destination>(
        destination: D,
        settings: DispatcherSettings,
        progress: ProgressLog,
        previous: Option<PreviousExecution>,
        shutdown: ShutdownSignal,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::channel(settings.queue_capacity.max(1));
        // bounded in practice by the pool size: one job per checked-out session
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let work_rx = Arc::new(Mutex::new(work_rx));

        let worker_count = settings.workers.max(1);
        let workers = (0..worker_count)
            .map(|index| {
                tokio::spawn(worker::run_worker(
                    index,
                    Arc::clone(&work_rx),
                    work_tx.clone(),
                    done_tx.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();
        drop(done_tx);

        info!(
            workers = worker_count,
            max_connections = settings.max_connections,
            queue_capacity = settings.queue_capacity,
            resuming = previous.is_some(),
            "Dispatcher started"
        );

        let coordinator = Coordinator {
            destination,
            pool: ConnectionPool::new(settings.max_connections.max(1)),
            running: HashMap::new(),
            current_file: None,
            previous,
            progress,
            work_tx,
            done_rx,
            shutdown: shutdown.clone(),
            next_job_id: 1,
            first_error: None,
            stats: DispatchStats::default(),
        };
        let span = info_span!("coordinator");
        let handle = tokio::spawn(coordinator.run(submit_rx).instrument(span));

        Self {
            submit_tx: Some(submit_tx),
            shutdown,
            coordinator: Some(handle),
            workers,
        }
    }

    /// Queue one transaction, waiting while the queue is full.
    ///
    /// Fails with [`ReplayError::Shutdown`] once shutdown is raised.
    pub async fn submit(&self, trx: Transaction) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(ReplayError::Shutdown);
        }
        let tx = self.submit_tx.as_ref().ok_or(ReplayError::Shutdown)?;
        tx.send(trx).await.map_err(|_| ReplayError::Shutdown)
    }

    /// Stop issuing jobs. Running jobs finish; queued transactions are dropped.
    pub fn quit(&self) {
        if self.shutdown.trigger() {
            info!("Dispatcher quit requested");
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_triggered()
    }

    /// Close the queue and wait for the coordinator and every worker.
    ///
    /// Returns the first fatal error (connect, execute, progress log) if any.
    pub async fn join(mut self) -> Result<DispatchStats> {
        self.submit_tx = None;
        let result = match self.coordinator.take() {
            Some(handle) => handle
                .await
                .unwrap_or_else(|e| Err(ReplayError::Internal(format!("coordinator panicked: {}", e)))),
            None => Err(ReplayError::Internal("dispatcher already joined".to_string())),
        };
        for (index, handle) in std::mem::take(&mut self.workers).into_iter().enumerate() {
            if let Err(e) = handle.await {
                warn!(worker = index, error = %e, "Worker panicked");
            }
        }
        info!("Dispatcher joined");
        result
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Coordinator
// ═══════════════════════════════════════════════════════════════════════════════

struct RunningEntry {
    gtid: Gtid,
    range: DependencyRange,
    /// Set while an XA_PREPARE is executing.
    prepare_xid: Option<String>,
}

struct Coordinator<D: Destination> {
    destination: D,
    pool: ConnectionPool<D::Session>,
    /// Job id → dependency range of every issued, not yet completed job.
    running: HashMap<u64, RunningEntry>,
    current_file: Option<String>,
    previous: Option<PreviousExecution>,
    progress: ProgressLog,
    work_tx: mpsc::UnboundedSender<WorkItem<D::Session>>,
    done_rx: mpsc::UnboundedReceiver<Completion<D::Session>>,
    shutdown: ShutdownSignal,
    next_job_id: u64,
    first_error: Option<ReplayError>,
    stats: DispatchStats,
}

impl<D: Destination> Coordinator<D> {
    async fn run(mut self, mut submit_rx: mpsc::Receiver<Transaction>) -> Result<DispatchStats> {
        loop {
            if self.shutdown.is_triggered() {
                break;
            }
            let next = tokio::select! {
                Some(completion) = self.done_rx.recv() => {
                    self.handle_completion(completion).await;
                    continue;
                }
                trx = submit_rx.recv() => trx,
                _ = self.shutdown.wait() => break,
            };
            match next {
                Some(trx) => self.dispatch(trx).await,
                None => {
                    debug!("Submit queue closed");
                    break;
                }
            }
        }
        // wake any blocked submitter
        drop(submit_rx);

        self.drain_running().await;
        let _ = self.work_tx.send(WorkItem::Stop);
        self.pool.close_all().await;
        metrics::set_running(0);

        info!(
            executed = self.stats.executed,
            skipped = self.stats.skipped,
            abandoned = self.stats.abandoned,
            failed = self.stats.failed,
            "Coordinator stopped"
        );
        match self.first_error.take() {
            Some(e) => Err(e),
            None => Ok(self.stats),
        }
    }

    /// Schedule one transaction, stalling until it can start.
    async fn dispatch(&mut self, mut trx: Transaction) {
        self.stats.received += 1;

        if let Some(previous) = self.previous.as_mut() {
            if previous.executed(&trx.gtid) {
                debug!(gtid = %trx.gtid, "Already executed by previous run, skipping");
                metrics::record_transaction_skipped("already_executed");
                self.stats.skipped += 1;
                return;
            }
            if previous.window_closed() {
                info!("Resume window closed");
                self.previous = None;
            }
        }

        if self.current_file.as_deref() != Some(trx.binlog_file.as_str()) {
            if let Some(previous_file) = self.current_file.as_deref() {
                info!(from = %previous_file, to = %trx.binlog_file, running = self.running.len(), "Binlog file changed, draining");
            }
            let drained = self.drain_running().await;
            metrics::record_file_boundary_drain(drained);
            self.current_file = Some(trx.binlog_file.clone());
        }

        let wait_start = Instant::now();
        let mut stall_logged = false;
        let slot = loop {
            if self.shutdown.is_triggered() {
                self.stats.abandoned += 1;
                metrics::record_transaction_skipped("shutdown");
                return;
            }
            if self.eligible(&trx) {
                let acquire = if self.prepare_in_flight(&trx) {
                    Acquire::Wait
                } else {
                    self.pool.select(&trx)
                };
                match acquire {
                    Acquire::Ready(slot) => break slot,
                    Acquire::Open => {
                        if let Err(e) = self.open_connection().await {
                            self.fail(e);
                            return;
                        }
                        continue;
                    }
                    Acquire::Wait => {
                        if !stall_logged {
                            if trx.kind == TrxKind::XaCommit {
                                warn!(gtid = %trx.gtid, xid = trx.xid.as_deref().unwrap_or("None"), "XA commit cannot pair yet, waiting");
                            } else if trx.xid.is_some() && self.prepare_in_flight(&trx) {
                                debug!(gtid = %trx.gtid, xid = trx.xid.as_deref().unwrap_or("None"), "XA rollback waiting for its prepare");
                            } else {
                                debug!(gtid = %trx.gtid, "No idle connection, waiting");
                            }
                            stall_logged = true;
                        }
                    }
                }
            }
            // shutdown is rechecked at the top
            self.wait_completion().await;
        };
        metrics::record_schedule_wait(wait_start.elapsed());

        if self.pool.is_degenerate_prepare(slot) && !trx.statements.is_empty() {
            warn!(gtid = %trx.gtid, xid = trx.xid.as_deref().unwrap_or("None"), "Paired prepare executed nothing, clearing statements");
            trx.statements.clear();
        }

        let Some((conn_id, session)) = self.pool.checkout(slot) else {
            self.fail(ReplayError::Internal(format!("slot {} not available", slot)));
            return;
        };
        let id = self.next_job_id;
        self.next_job_id += 1;
        self.running.insert(
            id,
            RunningEntry {
                gtid: trx.gtid.clone(),
                range: trx.range,
                prepare_xid: match trx.kind {
                    TrxKind::XaPrepare => trx.xid.clone(),
                    _ => None,
                },
            },
        );
        debug!(gtid = %trx.gtid, conn_id, running = self.running.len(), "Issuing job");
        self.publish_gauges();

        let job = Job {
            id,
            slot,
            conn_id,
            trx,
            session,
        };
        if self.work_tx.send(WorkItem::Run(job)).is_err() {
            self.running.remove(&id);
            self.fail(ReplayError::Internal("all workers exited".to_string()));
        }
    }

    /// Empty running set, or overlap with every running transaction.
    fn eligible(&self, trx: &Transaction) -> bool {
        self.running.values().all(|r| trx.range.overlaps(&r.range))
    }

    /// A rollback whose prepare is still executing must wait for it to land
    /// on its session.
    fn prepare_in_flight(&self, trx: &Transaction) -> bool {
        let Some(xid) = trx.xid.as_deref() else {
            return false;
        };
        trx.kind == TrxKind::Normal
            && self
                .running
                .values()
                .any(|r| r.prepare_xid.as_deref() == Some(xid))
    }

    async fn open_connection(&mut self) -> Result<()> {
        match self.destination.connect().await {
            Ok(session) => {
                let slot = self.pool.add(session);
                self.stats.connections += 1;
                metrics::record_connection_opened(true);
                info!(slot, pool = self.pool.len(), "Destination connection opened");
                Ok(())
            }
            Err(e) => {
                metrics::record_connection_opened(false);
                error!(error = %e, "Cannot open destination connection");
                Err(ReplayError::Connect(e.to_string()))
            }
        }
    }

    /// Wait for one completion, or for shutdown.
    async fn wait_completion(&mut self) {
        tokio::select! {
            Some(completion) = self.done_rx.recv() => {
                self.handle_completion(completion).await;
            }
            _ = self.shutdown.wait() => {}
        }
    }

    /// Wait until no job is running. Returns how many completions were handled.
    async fn drain_running(&mut self) -> usize {
        let mut drained = 0;
        while !self.running.is_empty() {
            match self.done_rx.recv().await {
                Some(completion) => {
                    self.handle_completion(completion).await;
                    drained += 1;
                }
                None => {
                    self.fail(ReplayError::Internal("workers exited with jobs running".to_string()));
                    self.running.clear();
                }
            }
        }
        drained
    }

    async fn handle_completion(&mut self, completion: Completion<D::Session>) {
        let Completion {
            job,
            outcome,
            elapsed,
        } = completion;
        let Job {
            id,
            slot,
            conn_id,
            trx,
            session,
        } = job;
        if let Some(entry) = self.running.remove(&id) {
            debug!(gtid = %entry.gtid, conn_id, "Job returned");
        }

        let success = match outcome {
            JobOutcome::Completed => {
                // logged before the session is released
                if let Err(e) = self.progress.append(&trx.progress_record()).await {
                    error!(gtid = %trx.gtid, error = %e, "Progress log append failed");
                    self.fail(e);
                }
                self.stats.executed += 1;
                metrics::record_transaction_executed(trx.kind, trx.statements.len(), elapsed);
                metrics::record_replay_lag(trx.timestamp);
                true
            }
            JobOutcome::Failed(e) => {
                self.stats.failed += 1;
                self.fail(e);
                false
            }
            JobOutcome::Abandoned => {
                self.stats.abandoned += 1;
                metrics::record_transaction_skipped("shutdown");
                false
            }
        };
        self.pool.checkin(slot, session, &trx, success);
        self.publish_gauges();
    }

    /// Keep the first fatal error and raise shutdown.
    fn fail(&mut self, e: ReplayError) {
        if self.first_error.is_none() {
            self.first_error = Some(e);
        }
        if self.shutdown.trigger() {
            warn!("Shutdown raised by coordinator");
        }
    }

    fn publish_gauges(&self) {
        let (idle, busy, prepared) = self.pool.counts();
        metrics::set_pool_status(idle, busy, prepared);
        metrics::set_running(self.running.len());
    }
}
