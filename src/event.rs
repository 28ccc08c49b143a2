// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decoded binlog events and the source trait the decoder implements.
//!
//! Decoding the replication wire protocol is not this crate's job. A decoder
//! implements [`EventSource`] and hands over one typed [`BinlogEvent`] per
//! call, in source order.
//!
//! # Example
//!
//! ```rust
//! use binlog_replay::event::{BinlogEvent, ChannelEventSource};
//!
//! let source = ChannelEventSource::from_events(vec![
//!     BinlogEvent::Rotate { next_file: "mysql-bin.000001".into() },
//! ]);
//! ```

use crate::error::Result;
use crate::sql::ColumnMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Row images carried by one rows event.
#[derive(Debug, Clone, PartialEq)]
pub enum RowsChange {
    Insert(Vec<ColumnMap>),
    /// `(before, after)` pairs.
    Update(Vec<(ColumnMap, ColumnMap)>),
    Delete(Vec<ColumnMap>),
}

impl RowsChange {
    pub fn len(&self) -> usize {
        match self {
            RowsChange::Insert(rows) | RowsChange::Delete(rows) => rows.len(),
            RowsChange::Update(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One decoded event.
#[derive(Debug, Clone, PartialEq)]
pub enum BinlogEvent {
    /// Switch to the next binlog file.
    Rotate { next_file: String },

    /// Commit metadata opening a transaction.
    Gtid {
        gtid: String,
        last_committed: i64,
        sequence_number: i64,
        timestamp: u64,
    },

    /// Row changes against one table.
    Rows {
        schema: String,
        table: String,
        change: RowsChange,
    },

    /// Raw statement text (BEGIN, DDL, XA control statements, ...).
    Query {
        schema: Option<String>,
        sql: String,
        log_pos: u64,
    },

    /// Commit marker.
    Xid { log_pos: u64 },

    /// XA PREPARE, or a one-phase XA COMMIT when `one_phase` is set.
    XaPrepare {
        xid: String,
        one_phase: bool,
        log_pos: u64,
    },
}

/// The external decoder.
///
/// Returns `Ok(None)` once the stream is exhausted. Errors are propagated
/// unchanged to whoever drives the builder.
pub trait EventSource: Send + 'static {
    fn next_event(&mut self) -> BoxFuture<'_, Option<BinlogEvent>>;

    /// Release the upstream connection. Called once when the run ends.
    fn close(&mut self) {}
}

/// Sending half paired with a [`ChannelEventSource`].
pub type EventSender = mpsc::Sender<Result<BinlogEvent>>;

/// An [`EventSource`] fed through a channel by a decoder on another task.
pub struct ChannelEventSource {
    rx: mpsc::Receiver<Result<BinlogEvent>>,
}

impl ChannelEventSource {
    /// Create a bounded source and its sender.
    pub fn channel(capacity: usize) -> (EventSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx })
    }

    /// A finite source yielding `events` and then end-of-stream.
    pub fn from_events(events: Vec<BinlogEvent>) -> Self {
        let (tx, source) = Self::channel(events.len());
        for event in events {
            // capacity equals len, cannot fail
            let _ = tx.try_send(Ok(event));
        }
        source
    }
}

impl EventSource for ChannelEventSource {
    fn next_event(&mut self) -> BoxFuture<'_, Option<BinlogEvent>> {
        Box::pin(async move {
            match self.rx.recv().await {
                Some(Ok(event)) => Ok(Some(event)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        })
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplayError;

    #[tokio::test]
    async fn test_from_events_yields_in_order_then_ends() {
        let mut source = ChannelEventSource::from_events(vec![
            BinlogEvent::Rotate { next_file: "f1".into() },
            BinlogEvent::Xid { log_pos: 10 },
        ]);
        assert_eq!(
            source.next_event().await.unwrap(),
            Some(BinlogEvent::Rotate { next_file: "f1".into() })
        );
        assert_eq!(source.next_event().await.unwrap(), Some(BinlogEvent::Xid { log_pos: 10 }));
        assert_eq!(source.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_propagates_errors() {
        let (tx, mut source) = ChannelEventSource::channel(4);
        tx.send(Err(ReplayError::EventSource("socket closed".into())))
            .await
            .unwrap();
        drop(tx);
        let err = source.next_event().await.unwrap_err();
        assert!(err.to_string().contains("socket closed"));
        assert_eq!(source.next_event().await.unwrap(), None);
    }

    #[test]
    fn test_rows_change_len() {
        let change = RowsChange::Update(vec![(vec![], vec![]), (vec![], vec![])]);
        assert_eq!(change.len(), 2);
        assert!(RowsChange::Insert(vec![]).is_empty());
    }
}
