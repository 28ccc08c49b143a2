// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Assembles decoded events into sealed transactions.
//!
//! ```text
//! Rotate ─► current file
//! Gtid ───► open new transaction (gtid, last_committed, sequence_number, file)
//! Rows ───► insert/update/delete statements (after skip list / allow-list)
//! Query ──► XA START/END/ROLLBACK/COMMIT, DDL, or plain statement
//! Xid ────► append `commit`, seal NORMAL
//! XaPrepare ─► seal XA_PREPARE (or NORMAL + `commit` when one-phase)
//! ```
//!
//! The sequence is lazy and cannot be restarted: once the source ends or
//! fails, [`TransactionBuilder::next_transaction`] keeps returning `Ok(None)`.

use crate::config::{FilterConfig, ReplayConfig};
use crate::error::{ReplayError, Result};
use crate::event::{BinlogEvent, EventSource, RowsChange};
use crate::metrics;
use crate::sql::{self, is_ddl, is_ddl_database, parse_xa_xid, starts_with_ci};
use crate::transaction::{Gtid, OpenTransaction, Transaction, TrxKind};
use futures::stream::{self, Stream};
use tracing::{debug, trace, warn};

/// Turns an [`EventSource`] into an ordered sequence of transactions.
pub struct TransactionBuilder<E: EventSource> {
    source: E,
    filter: FilterConfig,
    ignore_ddl: bool,
    /// File of the most recent rotate event.
    current_file: String,
    finished: bool,
}

impl<E: EventSource> TransactionBuilder<E> {
    pub fn new(source: E, filter: FilterConfig, ignore_ddl: bool) -> Self {
        Self {
            source,
            filter,
            ignore_ddl,
            current_file: String::new(),
            finished: false,
        }
    }

    pub fn from_config(source: E, config: &ReplayConfig) -> Self {
        Self::new(source, config.filter.clone(), config.ignore_ddl)
    }

    /// Binlog file the builder is currently reading.
    pub fn current_file(&self) -> &str {
        &self.current_file
    }

    /// Read events until one transaction is sealed.
    ///
    /// Returns `Ok(None)` at end of stream. Events trailing the last sealed
    /// transaction are discarded.
    pub async fn next_transaction(&mut self) -> Result<Option<Transaction>> {
        if self.finished {
            return Ok(None);
        }
        match self.read_one().await {
            Ok(Some(trx)) => Ok(Some(trx)),
            Ok(None) => {
                self.finished = true;
                Ok(None)
            }
            Err(e) => {
                self.finished = true;
                Err(e)
            }
        }
    }

    async fn read_one(&mut self) -> Result<Option<Transaction>> {
        let mut trx = OpenTransaction::new();
        loop {
            let Some(event) = self.source.next_event().await? else {
                if !trx.statements.is_empty() {
                    debug!(
                        statements = trx.statements.len(),
                        "Event stream ended inside an open transaction"
                    );
                }
                return Ok(None);
            };

            match event {
                BinlogEvent::Rotate { next_file } => {
                    debug!(file = %next_file, "Rotate");
                    self.current_file = next_file;
                }
                BinlogEvent::Gtid {
                    gtid,
                    last_committed,
                    sequence_number,
                    timestamp,
                } => {
                    if !trx.statements.is_empty() {
                        warn!(
                            gtid = %gtid,
                            dropped = trx.statements.len(),
                            "Statements before transaction start discarded"
                        );
                    }
                    trx = OpenTransaction {
                        gtid: Some(Gtid::new(gtid)),
                        last_committed: Some(last_committed),
                        sequence_number: Some(sequence_number),
                        binlog_file: Some(self.current_file.clone()),
                        timestamp,
                        ..Default::default()
                    };
                }
                other => {
                    if let Some((kind, log_pos)) = self.feed(&mut trx, other)? {
                        let mut sealed = std::mem::take(&mut trx).seal(kind, log_pos)?;
                        trim(&mut sealed);
                        trace!(gtid = %sealed.gtid, kind = %sealed.kind, brief = %sealed.brief(), "Sealed transaction");
                        metrics::record_transaction_built(sealed.kind);
                        return Ok(Some(sealed));
                    }
                }
            }
        }
    }

    /// Apply one event; returns the seal kind and position when it terminates.
    fn feed(&self, trx: &mut OpenTransaction, event: BinlogEvent) -> Result<Option<(TrxKind, u64)>> {
        match event {
            BinlogEvent::Rows {
                schema,
                table,
                change,
            } => {
                self.process_rows(trx, &schema, &table, change);
                Ok(None)
            }
            BinlogEvent::Xid { log_pos } => {
                trx.push("commit");
                Ok(Some((TrxKind::Normal, log_pos)))
            }
            BinlogEvent::XaPrepare {
                xid,
                one_phase,
                log_pos,
            } => {
                if one_phase {
                    trx.push("commit");
                    Ok(Some((TrxKind::Normal, log_pos)))
                } else {
                    trx.xid = Some(xid);
                    Ok(Some((TrxKind::XaPrepare, log_pos)))
                }
            }
            BinlogEvent::Query {
                schema,
                sql,
                log_pos,
            } => self.process_query(trx, schema, sql, log_pos),
            BinlogEvent::Rotate { .. } | BinlogEvent::Gtid { .. } => Ok(None),
        }
    }

    fn process_rows(&self, trx: &mut OpenTransaction, schema: &str, table: &str, change: RowsChange) {
        if self.filter.is_skipped_schema(schema) {
            trx.schema_skipped = true;
            metrics::record_rows_filtered("skip_schema", change.len());
            return;
        }
        if !self.filter.is_allowed(schema, table) {
            metrics::record_rows_filtered("not_allowed", change.len());
            return;
        }

        let table = format!("{}.{}", schema, table);
        match change {
            RowsChange::Insert(rows) => {
                trx.statements
                    .extend(rows.iter().map(|row| sql::sql_insert(&table, row)));
            }
            RowsChange::Update(rows) => {
                trx.statements.extend(
                    rows.iter()
                        .map(|(before, after)| sql::sql_update(&table, before, after)),
                );
            }
            RowsChange::Delete(rows) => {
                trx.statements
                    .extend(rows.iter().map(|row| sql::sql_delete(&table, row)));
            }
        }
    }

    fn process_query(
        &self,
        trx: &mut OpenTransaction,
        schema: Option<String>,
        sql: String,
        log_pos: u64,
    ) -> Result<Option<(TrxKind, u64)>> {
        if starts_with_ci(&sql, "XA START") {
            trx.push("START TRANSACTION");
            return Ok(None);
        }
        if starts_with_ci(&sql, "XA END") {
            return Ok(None);
        }
        if starts_with_ci(&sql, "XA ROLLBACK") {
            trx.push("ROLLBACK");
            trx.xid = parse_xa_xid(&sql);
            if trx.xid.is_none() {
                warn!(sql = %sql, "Cannot decode xid of XA ROLLBACK, replaying unpaired");
            }
            return Ok(Some((TrxKind::Normal, log_pos)));
        }
        if starts_with_ci(&sql, "XA COMMIT") {
            let xid = parse_xa_xid(&sql).ok_or_else(|| {
                ReplayError::EventSource(format!("cannot decode xid from {:?}", sql))
            })?;
            trx.push("COMMIT");
            trx.xid = Some(xid);
            return Ok(Some((TrxKind::XaCommit, log_pos)));
        }
        if is_ddl(&sql) {
            if self.ignore_ddl {
                debug!(sql = %sql, "Ignoring DDL");
                trx.statements.clear();
                return Ok(Some((TrxKind::Normal, log_pos)));
            }
            if let Some(schema) = schema.filter(|s| !s.is_empty()) {
                if !is_ddl_database(&sql) {
                    trx.push(format!("use {}", schema));
                }
            }
            trx.push(sql);
            return Ok(Some((TrxKind::Normal, log_pos)));
        }
        trx.push(sql);
        Ok(None)
    }

    /// Consume the builder as a `Stream`.
    pub fn into_stream(self) -> impl Stream<Item = Result<Transaction>> {
        stream::unfold(self, |mut builder| async move {
            match builder.next_transaction().await {
                Ok(Some(trx)) => Some((Ok(trx), builder)),
                Ok(None) => None,
                Err(e) => Some((Err(e), builder)),
            }
        })
    }

    /// Close the underlying event source.
    pub fn close(&mut self) {
        self.source.close();
    }
}

/// Strip boilerplate from a sealed transaction.
///
/// - NORMAL `[BEGIN, x, COMMIT]` → `[x]`
/// - NORMAL `[BEGIN, COMMIT]` → `[]`
/// - XA_PREPARE `[START TRANSACTION]` → `[]`
pub fn trim(trx: &mut Transaction) {
    let is = |i: usize, word: &str| trx.statements[i].eq_ignore_ascii_case(word);
    let n = trx.statements.len();
    let keep = match trx.kind {
        TrxKind::Normal if n == 3 && is(0, "begin") && is(2, "commit") => Some(1),
        TrxKind::Normal if n == 2 && is(0, "begin") && is(1, "commit") => None,
        TrxKind::XaPrepare if n == 1 && is(0, "start transaction") => None,
        _ => return,
    };
    match keep {
        Some(i) => {
            let single = trx.statements.swap_remove(i);
            trx.statements = vec![single];
        }
        None => trx.statements.clear(),
    }
}
