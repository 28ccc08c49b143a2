// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Progress log persistence and resume state.
//!
//! Every transaction that completes on the destination is appended to a
//! plain-text progress log, one line each:
//!
//! ```text
//! 3E11FA47-71CA-11E1-9E33-C80AA9429562:23 NORMAL None mysql-bin.000042 4711 1700000000
//! ```
//!
//! Lines are appended in completion order, which differs from source order
//! when transactions run concurrently. On restart the tail of the log
//! (at most `lookback` entries) is read back:
//!
//! ```text
//! tail entries ──sort by gtid──► g1 < g2 < g3
//!                                │
//!                                └─ g1 is the anchor: restart at g1's file/pos
//! ```
//!
//! Restarting at the anchor re-reads transactions that already completed;
//! [`PreviousExecution::executed`] filters those out until every recovered
//! entry after the anchor has been seen once, after which it answers `false`
//! for everything but the anchor itself.
//!
//! ## XA pairing
//!
//! A recovered `XA_PREPARE` counts as executed only when the matching
//! `XA_COMMIT` is among the recovered entries. A prepare whose session died
//! with the crash left nothing behind on the destination and must be redone.

use crate::config::ProgressConfig;
use crate::error::{ReplayError, Result};
use crate::metrics;
use crate::transaction::{Gtid, ProgressRecord, TrxKind};
use std::collections::{BTreeMap, HashSet};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

const TAIL_CHUNK: u64 = 4096;

// ═══════════════════════════════════════════════════════════════════════════════
// ProgressLog
// ═══════════════════════════════════════════════════════════════════════════════

/// Append-only writer for the progress log. Owned by the dispatcher's
/// coordinator, which is its only writer.
pub struct ProgressLog {
    file: File,
    path: PathBuf,
    sync: bool,
}

impl ProgressLog {
    /// Open for appending, optionally truncating first.
    pub async fn open(config: &ProgressConfig, truncate: bool) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        if truncate {
            File::create(&path).await?;
            info!(path = %path.display(), "Progress log truncated");
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            file,
            path,
            sync: config.sync,
        })
    }

    /// Append one completed transaction.
    pub async fn append(&mut self, record: &ProgressRecord) -> Result<()> {
        let start = Instant::now();
        let line = format!("{}\n", record);
        self.file.write_all(line.as_bytes()).await?;
        self.file.flush().await?;
        if self.sync {
            self.file.sync_data().await?;
        }
        metrics::record_progress_append(start.elapsed());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PreviousExecution
// ═══════════════════════════════════════════════════════════════════════════════

/// What a previous run left behind, used to skip already-applied work.
#[derive(Debug, Clone)]
pub struct PreviousExecution {
    anchor: ProgressRecord,
    records: BTreeMap<Gtid, ProgressRecord>,
    unseen: HashSet<Gtid>,
    committed_xids: HashSet<String>,
}

impl PreviousExecution {
    /// Read the tail of the progress log. `None` when there is nothing to
    /// resume from (missing file, or no parseable entries).
    pub async fn read(path: impl AsRef<Path>, lookback: usize) -> Result<Option<Self>> {
        let path = path.as_ref();
        let lines = tail_lines(path, lookback).await?;
        let mut records = Vec::with_capacity(lines.len());
        for line in lines {
            match line.parse::<ProgressRecord>() {
                Ok(record) => records.push(record),
                Err(message) => {
                    let err = ReplayError::ProgressParse { line, message };
                    if err.is_fatal() {
                        return Err(err);
                    }
                    // a torn final line is expected after a crash mid-write
                    warn!(error = %err, "Skipping unreadable progress entry");
                }
            }
        }
        let previous = Self::from_records(records);
        match &previous {
            Some(p) => info!(
                path = %path.display(),
                entries = p.records.len(),
                anchor = %p.anchor.gtid,
                log_file = %p.start_log_file(),
                log_pos = p.start_log_pos(),
                "Previous execution found"
            ),
            None => debug!(path = %path.display(), "No previous execution"),
        }
        Ok(previous)
    }

    /// Build from already-parsed entries (any order).
    pub fn from_records(records: Vec<ProgressRecord>) -> Option<Self> {
        let records: BTreeMap<Gtid, ProgressRecord> = records
            .into_iter()
            .map(|r| (r.gtid.clone(), r))
            .collect();
        let anchor = records.values().next()?.clone();
        let committed_xids = records
            .values()
            .filter(|r| r.kind == TrxKind::XaCommit)
            .filter_map(|r| r.xid.clone())
            .collect();
        // the source restarts after the anchor, so it is never streamed again
        let unseen = records
            .keys()
            .filter(|gtid| **gtid != anchor.gtid)
            .cloned()
            .collect();
        Some(Self {
            anchor,
            records,
            unseen,
            committed_xids,
        })
    }

    /// File to restart reading from.
    pub fn start_log_file(&self) -> &str {
        &self.anchor.binlog_file
    }

    /// Offset to restart reading from.
    pub fn start_log_pos(&self) -> u64 {
        self.anchor.log_pos
    }

    pub fn anchor(&self) -> &ProgressRecord {
        &self.anchor
    }

    /// Number of recovered entries.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Every recovered entry other than the anchor has been encountered again.
    pub fn window_closed(&self) -> bool {
        self.unseen.is_empty()
    }

    /// Whether the transaction `gtid` already completed in the previous run.
    ///
    /// Marks the entry seen as a side effect.
    pub fn executed(&mut self, gtid: &Gtid) -> bool {
        let Some(record) = self.records.get(gtid) else {
            return false;
        };
        if *gtid != self.anchor.gtid {
            if self.window_closed() {
                return false;
            }
            self.unseen.remove(gtid);
        }

        if record.kind != TrxKind::XaPrepare {
            return true;
        }
        let paired = record
            .xid
            .as_ref()
            .is_some_and(|xid| self.committed_xids.contains(xid));
        if !paired {
            warn!(
                gtid = %gtid,
                xid = record.xid.as_deref().unwrap_or("None"),
                "XA prepare has no recovered commit, replaying"
            );
        }
        paired
    }
}

/// Read up to `max` non-empty lines from the end of `path`, last line first.
async fn tail_lines(path: &Path, max: usize) -> std::io::Result<Vec<String>> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut pos = file.metadata().await?.len();
    // bytes after `pos` not yet split into complete lines
    let mut pending: Vec<u8> = Vec::new();
    let mut lines = Vec::new();

    while pos > 0 && lines.len() < max {
        let step = TAIL_CHUNK.min(pos);
        pos -= step;
        file.seek(SeekFrom::Start(pos)).await?;
        let mut chunk = vec![0u8; step as usize];
        file.read_exact(&mut chunk).await?;
        chunk.extend_from_slice(&pending);
        pending = chunk;

        while lines.len() < max {
            let Some(nl) = pending.iter().rposition(|&b| b == b'\n') else {
                break;
            };
            let line = pending.split_off(nl + 1);
            pending.truncate(nl);
            push_line(&mut lines, &line);
        }
    }
    if pos == 0 && lines.len() < max {
        push_line(&mut lines, &pending);
    }
    Ok(lines)
}

fn push_line(lines: &mut Vec<String>, raw: &[u8]) {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
}
