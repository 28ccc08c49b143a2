// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration, property and chaos tests.
//!
//! This module provides:
//! - A recording mock Destination
//! - Transaction constructors
//! - Progress log setup in a temp dir

#![allow(dead_code)]

pub mod mock_destination;

pub use mock_destination::*;

use binlog_replay::config::ProgressConfig;
use binlog_replay::{DependencyRange, DispatcherSettings, Gtid, ProgressLog, Transaction, TrxKind};
use std::path::{Path, PathBuf};

pub const FILE_1: &str = "mysql-bin.000001";
pub const FILE_2: &str = "mysql-bin.000002";

/// A NORMAL transaction with one insert identifying it by `n`.
pub fn trx(n: u64, lc: i64, seq: i64) -> Transaction {
    trx_in(FILE_1, n, lc, seq)
}

pub fn trx_in(file: &str, n: u64, lc: i64, seq: i64) -> Transaction {
    Transaction {
        gtid: Gtid::new(format!("uuid:{}", n)),
        range: DependencyRange::new(lc, seq),
        binlog_file: file.to_string(),
        last_log_pos: n * 100,
        statements: vec![insert(n)],
        kind: TrxKind::Normal,
        xid: None,
        timestamp: 1_700_000_000 + n,
        schema_skipped: false,
    }
}

/// The statement carried by `trx(n, ..)`.
pub fn insert(n: u64) -> String {
    format!("insert into d.t(a) values({})", n)
}

pub fn xa_prepare(n: u64, lc: i64, seq: i64, xid: &str, statements: &[&str]) -> Transaction {
    let mut t = trx(n, lc, seq);
    t.kind = TrxKind::XaPrepare;
    t.xid = Some(xid.to_string());
    t.statements = statements.iter().map(|s| s.to_string()).collect();
    t
}

pub fn xa_commit(n: u64, lc: i64, seq: i64, xid: &str) -> Transaction {
    let mut t = trx(n, lc, seq);
    t.kind = TrxKind::XaCommit;
    t.xid = Some(xid.to_string());
    t.statements = vec!["COMMIT".to_string()];
    t
}

pub fn xa_rollback(n: u64, lc: i64, seq: i64, xid: &str) -> Transaction {
    let mut t = trx(n, lc, seq);
    t.xid = Some(xid.to_string());
    t.statements = vec!["ROLLBACK".to_string()];
    t
}

pub fn settings(max_connections: usize) -> DispatcherSettings {
    DispatcherSettings {
        max_connections,
        workers: max_connections,
        queue_capacity: 16,
    }
}

pub fn progress_config(dir: &Path) -> ProgressConfig {
    ProgressConfig {
        path: dir.join("progress.log").display().to_string(),
        sync: false,
        ..Default::default()
    }
}

pub async fn progress_log(dir: &Path) -> ProgressLog {
    ProgressLog::open(&progress_config(dir), false)
        .await
        .expect("open progress log")
}

pub fn progress_path(dir: &Path) -> PathBuf {
    dir.join("progress.log")
}

/// Lines currently in the progress log.
pub fn progress_lines(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(progress_path(dir))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}
