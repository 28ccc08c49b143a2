// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconstructed transactions and the concurrency-safety predicate.
//!
//! A [`Transaction`] is only ever constructed sealed: the builder accumulates
//! into an [`OpenTransaction`] and calls [`OpenTransaction::seal()`], which
//! checks the well-formedness invariant and returns a typed error instead of
//! handing a half-filled transaction to the scheduler.
//!
//! # Dependency ranges
//!
//! MySQL's logical clock stamps every transaction with `last_committed` and
//! `sequence_number`. Two transactions from the same binlog file whose
//! `[last_committed, sequence_number]` ranges overlap were committed without
//! a write conflict and may be replayed concurrently:
//!
//! ```text
//! A: 5 ─────────── 10
//! B:       8 ─────────── 12      overlap → parallel
//! C:               10 ────────── 15   no overlap with A → wait for A
//! ```

use crate::error::InvariantError;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Kind of a sealed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrxKind {
    Normal,
    XaPrepare,
    XaCommit,
}

impl TrxKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrxKind::Normal => "NORMAL",
            TrxKind::XaPrepare => "XA_PREPARE",
            TrxKind::XaCommit => "XA_COMMIT",
        }
    }
}

impl fmt::Display for TrxKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TrxKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NORMAL" => Ok(TrxKind::Normal),
            "XA_PREPARE" => Ok(TrxKind::XaPrepare),
            "XA_COMMIT" => Ok(TrxKind::XaCommit),
            other => Err(format!("unknown transaction kind {:?}", other)),
        }
    }
}

/// Global transaction identifier, e.g. `3E11FA47-71CA-11E1-9E33-C80AA9429562:23`.
///
/// Ordered by source id, then numerically by transaction number, so that
/// `uuid:9 < uuid:10`. Identifiers without a numeric suffix fall back to
/// plain string order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Gtid(String);

impl Gtid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn sort_key(&self) -> (&str, Option<u64>, &str) {
        match self.0.rsplit_once(':') {
            Some((sid, n)) => match n.parse::<u64>() {
                Ok(n) => (sid, Some(n), &self.0),
                Err(_) => (&self.0, None, &self.0),
            },
            None => (&self.0, None, &self.0),
        }
    }
}

impl Ord for Gtid {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for Gtid {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Gtid {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The `[last_committed, sequence_number]` window of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyRange {
    pub last_committed: i64,
    pub sequence_number: i64,
}

impl DependencyRange {
    pub fn new(last_committed: i64, sequence_number: i64) -> Self {
        Self {
            last_committed,
            sequence_number,
        }
    }

    /// Whether two ranges from the same binlog file may run concurrently.
    pub fn overlaps(&self, other: &DependencyRange) -> bool {
        (self.last_committed < other.last_committed
            && self.sequence_number > other.last_committed)
            || (other.last_committed < self.sequence_number
                && other.sequence_number > self.last_committed)
    }
}

/// One sealed, well-formed transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub gtid: Gtid,
    pub range: DependencyRange,
    pub binlog_file: String,
    /// Position of the terminating event.
    pub last_log_pos: u64,
    pub statements: Vec<String>,
    pub kind: TrxKind,
    /// Set for XA prepare/commit, and for a rollback of a prepared XA.
    pub xid: Option<String>,
    pub timestamp: u64,
    /// Some row events were dropped by the schema skip list.
    pub schema_skipped: bool,
}

impl Transaction {
    pub fn last_committed(&self) -> i64 {
        self.range.last_committed
    }

    pub fn sequence_number(&self) -> i64 {
        self.range.sequence_number
    }

    /// Dependency-range overlap. Only meaningful within one binlog file.
    pub fn overlaps(&self, other: &Transaction) -> bool {
        self.range.overlaps(&other.range)
    }

    /// Statement verbs joined by `..`, e.g. `BEGIN..insert..commit`.
    pub fn brief(&self) -> String {
        self.statements
            .iter()
            .map(|sql| sql.split(' ').next().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("..")
    }

    /// The line written to the progress log once this transaction completes.
    pub fn progress_record(&self) -> ProgressRecord {
        ProgressRecord {
            gtid: self.gtid.clone(),
            kind: self.kind,
            xid: self.xid.clone(),
            binlog_file: self.binlog_file.clone(),
            log_pos: self.last_log_pos,
            timestamp: self.timestamp,
        }
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.progress_record().fmt(f)
    }
}

/// Minimal transaction identity persisted per completed transaction.
///
/// Serialized as `gtid kind xid binlog_file log_pos timestamp`, with `None`
/// standing in for an absent XID. An XID that would not survive the
/// whitespace split (empty, containing whitespace, spelled `None`, or
/// already starting with `hex:`) is written as `hex:<hex bytes>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressRecord {
    pub gtid: Gtid,
    pub kind: TrxKind,
    pub xid: Option<String>,
    pub binlog_file: String,
    pub log_pos: u64,
    pub timestamp: u64,
}

impl fmt::Display for ProgressRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.gtid,
            self.kind,
            XidField(self.xid.as_deref()),
            self.binlog_file,
            self.log_pos,
            self.timestamp
        )
    }
}

impl FromStr for ProgressRecord {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(format!("expected 6 fields, got {}", fields.len()));
        }
        let kind = fields[1].parse::<TrxKind>()?;
        let xid = decode_xid(fields[2])?;
        let log_pos = fields[4]
            .parse::<u64>()
            .map_err(|e| format!("bad log_pos {:?}: {}", fields[4], e))?;
        let timestamp = fields[5]
            .parse::<u64>()
            .map_err(|e| format!("bad timestamp {:?}: {}", fields[5], e))?;
        Ok(Self {
            gtid: Gtid::new(fields[0]),
            kind,
            xid,
            binlog_file: fields[3].to_string(),
            log_pos,
            timestamp,
        })
    }
}

const XID_HEX_PREFIX: &str = "hex:";

/// Progress-log rendering of an optional XID.
struct XidField<'a>(Option<&'a str>);

impl fmt::Display for XidField<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            None => f.write_str("None"),
            Some(xid)
                if xid.is_empty()
                    || xid == "None"
                    || xid.starts_with(XID_HEX_PREFIX)
                    || xid.chars().any(char::is_whitespace) =>
            {
                write!(f, "{}{}", XID_HEX_PREFIX, hex::encode(xid))
            }
            Some(xid) => f.write_str(xid),
        }
    }
}

fn decode_xid(field: &str) -> Result<Option<String>, String> {
    if field == "None" {
        return Ok(None);
    }
    let Some(encoded) = field.strip_prefix(XID_HEX_PREFIX) else {
        return Ok(Some(field.to_string()));
    };
    let bytes = hex::decode(encoded).map_err(|e| format!("bad xid {:?}: {}", field, e))?;
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|e| format!("bad xid {:?}: {}", field, e))
}

/// A transaction under construction.
#[derive(Debug, Clone, Default)]
pub struct OpenTransaction {
    pub gtid: Option<Gtid>,
    pub last_committed: Option<i64>,
    pub sequence_number: Option<i64>,
    pub binlog_file: Option<String>,
    pub statements: Vec<String>,
    pub xid: Option<String>,
    pub timestamp: u64,
    pub schema_skipped: bool,
}

impl OpenTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sql: impl Into<String>) {
        self.statements.push(sql.into());
    }

    /// Check the well-formedness invariant without consuming.
    pub fn well_formed(&self) -> Result<(), InvariantError> {
        let gtid = self.gtid.as_ref().ok_or(InvariantError::MissingGtid)?;
        let (lc, seq) = match (self.last_committed, self.sequence_number) {
            (Some(lc), Some(seq)) => (lc, seq),
            _ => {
                return Err(InvariantError::MissingDependency {
                    gtid: gtid.to_string(),
                })
            }
        };
        if lc >= seq {
            return Err(InvariantError::DependencyOrder {
                gtid: gtid.to_string(),
                last_committed: lc,
                sequence_number: seq,
            });
        }
        match self.binlog_file.as_deref() {
            Some(f) if !f.is_empty() => Ok(()),
            _ => Err(InvariantError::MissingFile {
                gtid: gtid.to_string(),
            }),
        }
    }

    /// Close the transaction at the terminating event's position.
    pub fn seal(self, kind: TrxKind, last_log_pos: u64) -> Result<Transaction, InvariantError> {
        self.well_formed()?;
        if kind != TrxKind::Normal && self.xid.is_none() {
            return Err(InvariantError::MissingXid {
                gtid: self.gtid.map(|g| g.to_string()).unwrap_or_default(),
                kind: kind.to_string(),
            });
        }
        // well_formed() guarantees these
        let (Some(gtid), Some(lc), Some(seq), Some(binlog_file)) = (
            self.gtid,
            self.last_committed,
            self.sequence_number,
            self.binlog_file,
        ) else {
            return Err(InvariantError::MissingGtid);
        };
        Ok(Transaction {
            gtid,
            range: DependencyRange::new(lc, seq),
            binlog_file,
            last_log_pos,
            statements: self.statements,
            kind,
            xid: self.xid,
            timestamp: self.timestamp,
            schema_skipped: self.schema_skipped,
        })
    }
}

#[cfg(test)]
pub(crate) fn test_trx(gtid: &str, lc: i64, seq: i64) -> Transaction {
    Transaction {
        gtid: Gtid::new(gtid),
        range: DependencyRange::new(lc, seq),
        binlog_file: "mysql-bin.000001".to_string(),
        last_log_pos: 100,
        statements: vec!["insert into d.t(a) values(1)".to_string()],
        kind: TrxKind::Normal,
        xid: None,
        timestamp: 1_700_000_000,
        schema_skipped: false,
    }
}
