// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Worker tasks.
//!
//! Workers share one job queue. Each takes a job, runs its statements in
//! order on the job's session and reports back on the completion channel.
//! Workers never touch pool or scheduling state.

use super::ShutdownSignal;
use crate::destination::Session;
use crate::error::ReplayError;
use crate::metrics;
use crate::transaction::Transaction;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info_span, trace, warn, Instrument};

/// One transaction bound to one checked-out session.
pub(crate) struct Job<S> {
    pub id: u64,
    pub slot: usize,
    pub conn_id: u64,
    pub trx: Transaction,
    pub session: S,
}

pub(crate) enum WorkItem<S> {
    Run(Job<S>),
    /// Sentinel; re-posted by whichever worker receives it.
    Stop,
}

#[derive(Debug)]
pub(crate) enum JobOutcome {
    Completed,
    Failed(ReplayError),
    /// Taken after shutdown; nothing was executed.
    Abandoned,
}

pub(crate) struct Completion<S> {
    pub job: Job<S>,
    pub outcome: JobOutcome,
    pub elapsed: Duration,
}

pub(crate) type JobReceiver<S> = Arc<Mutex<mpsc::UnboundedReceiver<WorkItem<S>>>>;

/// Run one worker until it receives the stop sentinel.
pub(crate) async fn run_worker<S: Session>(
    index: usize,
    jobs: JobReceiver<S>,
    repost: mpsc::UnboundedSender<WorkItem<S>>,
    done: mpsc::UnboundedSender<Completion<S>>,
    shutdown: ShutdownSignal,
) {
    let span = info_span!("worker", index);
    async move {
        debug!("Worker started");
        loop {
            let item = {
                let mut rx = jobs.lock().await;
                rx.recv().await
            };
            let mut job = match item {
                Some(WorkItem::Run(job)) => job,
                Some(WorkItem::Stop) => {
                    let _ = repost.send(WorkItem::Stop);
                    break;
                }
                None => break,
            };

            let start = Instant::now();
            let outcome = if shutdown.is_triggered() {
                trace!(gtid = %job.trx.gtid, "Shutdown raised, abandoning job");
                JobOutcome::Abandoned
            } else {
                execute(&mut job, &shutdown).await
            };
            let completion = Completion {
                job,
                outcome,
                elapsed: start.elapsed(),
            };
            if done.send(completion).is_err() {
                warn!("Coordinator gone, worker exiting");
                break;
            }
        }
        debug!("Worker stopped");
    }
    .instrument(span)
    .await
}

/// Execute every statement of the job in order. Stops at the first failure.
async fn execute<S: Session>(job: &mut Job<S>, shutdown: &ShutdownSignal) -> JobOutcome {
    trace!(
        gtid = %job.trx.gtid,
        conn_id = job.conn_id,
        kind = %job.trx.kind,
        brief = %job.trx.brief(),
        "Executing"
    );
    for sql in &job.trx.statements {
        if let Err(e) = job.session.execute(sql).await {
            error!(
                gtid = %job.trx.gtid,
                conn_id = job.conn_id,
                sql = %sql,
                error = %e,
                "Statement failed"
            );
            metrics::record_execution_failure();
            if shutdown.trigger() {
                warn!("Shutdown raised by failed statement");
            }
            return JobOutcome::Failed(ReplayError::execute(
                job.trx.gtid.as_str(),
                job.conn_id,
                sql.as_str(),
                e.to_string(),
            ));
        }
    }
    JobOutcome::Completed
}
