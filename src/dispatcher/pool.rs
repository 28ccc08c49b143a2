// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Destination session pool with XA affinity.
//!
//! ```text
//!            checkout             checkin (XA_PREPARE ok)
//!   IDLE ─────────────► BUSY ─────────────────────────► XA_PREPARED(xid)
//!    ▲                   │                                   │
//!    │   checkin (other) │            checkout by XA_COMMIT  │
//!    └───────────────────┘◄──── BUSY ◄───────── or XA ROLLBACK with same xid
//! ```
//!
//! Only the coordinator touches the pool. A session is moved out of its slot
//! while BUSY and handed back with the completed job.

use crate::destination::Session;
use crate::transaction::{Transaction, TrxKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Idle,
    Busy,
    XaPrepared,
}

pub(crate) struct PooledConnection<S> {
    pub id: u64,
    pub status: ConnStatus,
    /// Set only while XA_PREPARED.
    pub xid: Option<String>,
    /// The prepare held on this session executed no statements.
    pub degenerate_prepare: bool,
    session: Option<S>,
}

/// Result of looking for a session for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// Slot index to check out.
    Ready(usize),
    /// No idle session but the pool may grow.
    Open,
    /// Stall until a completion frees something.
    Wait,
}

pub(crate) struct ConnectionPool<S> {
    conns: Vec<PooledConnection<S>>,
    capacity: usize,
    next_id: u64,
}

impl<S: Session> ConnectionPool<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            conns: Vec::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    fn find_prepared(&self, xid: &str) -> Option<usize> {
        self.conns
            .iter()
            .position(|c| c.status == ConnStatus::XaPrepared && c.xid.as_deref() == Some(xid))
    }

    /// Pick a session for `trx` without mutating anything.
    pub fn select(&self, trx: &Transaction) -> Acquire {
        if trx.kind == TrxKind::XaCommit {
            return match trx.xid.as_deref().and_then(|xid| self.find_prepared(xid)) {
                Some(i) => Acquire::Ready(i),
                None => Acquire::Wait,
            };
        }
        // rollback of a prepared XA goes back to the session holding it
        if let Some(i) = trx.xid.as_deref().and_then(|xid| self.find_prepared(xid)) {
            return Acquire::Ready(i);
        }
        if let Some(i) = self.conns.iter().position(|c| c.status == ConnStatus::Idle) {
            return Acquire::Ready(i);
        }
        if self.conns.len() < self.capacity {
            Acquire::Open
        } else {
            Acquire::Wait
        }
    }

    /// Add a freshly opened session as IDLE; returns its slot.
    pub fn add(&mut self, session: S) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.conns.push(PooledConnection {
            id,
            status: ConnStatus::Idle,
            xid: None,
            degenerate_prepare: false,
            session: Some(session),
        });
        self.conns.len() - 1
    }

    /// Whether the slot holds a prepare that executed nothing.
    pub fn is_degenerate_prepare(&self, slot: usize) -> bool {
        self.conns
            .get(slot)
            .is_some_and(|c| c.status == ConnStatus::XaPrepared && c.degenerate_prepare)
    }

    /// Mark BUSY and move the session out. Returns `(conn_id, session)`.
    pub fn checkout(&mut self, slot: usize) -> Option<(u64, S)> {
        let conn = self.conns.get_mut(slot)?;
        if conn.status == ConnStatus::Busy {
            return None;
        }
        let session = conn.session.take()?;
        conn.status = ConnStatus::Busy;
        Some((conn.id, session))
    }

    /// Return a session after its job finished.
    ///
    /// A successful XA_PREPARE leaves the session XA_PREPARED holding the
    /// xid; everything else makes it IDLE.
    pub fn checkin(&mut self, slot: usize, session: S, trx: &Transaction, success: bool) {
        let Some(conn) = self.conns.get_mut(slot) else {
            return;
        };
        conn.session = Some(session);
        if success && trx.kind == TrxKind::XaPrepare {
            conn.status = ConnStatus::XaPrepared;
            conn.xid = trx.xid.clone();
            conn.degenerate_prepare = trx.statements.is_empty();
        } else {
            conn.status = ConnStatus::Idle;
            conn.xid = None;
            conn.degenerate_prepare = false;
        }
    }

    /// `(idle, busy, xa_prepared)`
    pub fn counts(&self) -> (usize, usize, usize) {
        self.conns.iter().fold((0, 0, 0), |(i, b, p), c| match c.status {
            ConnStatus::Idle => (i + 1, b, p),
            ConnStatus::Busy => (i, b + 1, p),
            ConnStatus::XaPrepared => (i, b, p + 1),
        })
    }

    /// Close every session still held by the pool.
    pub async fn close_all(&mut self) {
        for conn in &mut self.conns {
            if conn.status == ConnStatus::XaPrepared {
                tracing::warn!(
                    conn_id = conn.id,
                    xid = conn.xid.as_deref().unwrap_or("None"),
                    "Closing session with an uncommitted XA prepare"
                );
            }
            if let Some(session) = conn.session.as_mut() {
                if let Err(e) = session.close().await {
                    tracing::debug!(conn_id = conn.id, error = %e, "Session close failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{BoxFuture, Session};
    use crate::transaction::test_trx;

    struct Nop;

    impl Session for Nop {
        fn execute<'a>(&'a mut self, _sql: &'a str) -> BoxFuture<'a, ()> {
            Box::pin(async { Ok(()) })
        }
    }

    fn xa(kind: TrxKind, xid: &str, statements: usize) -> Transaction {
        let mut trx = test_trx("s:1", 0, 1);
        trx.kind = kind;
        trx.xid = Some(xid.to_string());
        trx.statements = vec!["insert into d.t(a) values(1)".to_string(); statements];
        trx
    }

    #[test]
    fn test_empty_pool_opens() {
        let pool: ConnectionPool<Nop> = ConnectionPool::new(2);
        assert_eq!(pool.select(&test_trx("s:1", 0, 1)), Acquire::Open);
    }

    #[test]
    fn test_idle_reused_before_opening() {
        let mut pool = ConnectionPool::new(2);
        let slot = pool.add(Nop);
        assert_eq!(pool.select(&test_trx("s:1", 0, 1)), Acquire::Ready(slot));
    }

    #[test]
    fn test_full_pool_waits() {
        let mut pool = ConnectionPool::new(1);
        let slot = pool.add(Nop);
        let (id, _session) = pool.checkout(slot).unwrap();
        assert_eq!(id, 1);
        assert_eq!(pool.select(&test_trx("s:2", 0, 1)), Acquire::Wait);
        assert_eq!(pool.counts(), (0, 1, 0));
    }

    #[test]
    fn test_xa_commit_pairs_with_prepared_xid() {
        let mut pool = ConnectionPool::new(3);
        let a = pool.add(Nop);
        let b = pool.add(Nop);
        let prepare = xa(TrxKind::XaPrepare, "x1", 2);
        let (_, session) = pool.checkout(b).unwrap();
        pool.checkin(b, session, &prepare, true);

        assert_eq!(pool.counts(), (1, 0, 1));
        assert_eq!(pool.select(&xa(TrxKind::XaCommit, "x1", 1)), Acquire::Ready(b));
        // never the mismatched session, even though `a` is idle
        assert_eq!(pool.select(&xa(TrxKind::XaCommit, "x2", 1)), Acquire::Wait);
        // ordinary work never lands on the prepared session
        assert_eq!(pool.select(&test_trx("s:3", 0, 1)), Acquire::Ready(a));
    }

    #[test]
    fn test_degenerate_prepare_flag() {
        let mut pool = ConnectionPool::new(1);
        let slot = pool.add(Nop);
        let (_, session) = pool.checkout(slot).unwrap();
        pool.checkin(slot, session, &xa(TrxKind::XaPrepare, "x1", 0), true);
        assert!(pool.is_degenerate_prepare(slot));

        let (_, session) = pool.checkout(slot).unwrap();
        pool.checkin(slot, session, &xa(TrxKind::XaCommit, "x1", 0), true);
        assert!(!pool.is_degenerate_prepare(slot));
        assert_eq!(pool.counts(), (1, 0, 0));
    }

    #[test]
    fn test_failed_prepare_returns_idle() {
        let mut pool = ConnectionPool::new(1);
        let slot = pool.add(Nop);
        let (_, session) = pool.checkout(slot).unwrap();
        pool.checkin(slot, session, &xa(TrxKind::XaPrepare, "x1", 1), false);
        assert_eq!(pool.counts(), (1, 0, 0));
    }

    #[test]
    fn test_rollback_routes_to_prepared() {
        let mut pool = ConnectionPool::new(2);
        let _idle = pool.add(Nop);
        let held = pool.add(Nop);
        let (_, session) = pool.checkout(held).unwrap();
        pool.checkin(held, session, &xa(TrxKind::XaPrepare, "x9", 1), true);

        let rollback = xa(TrxKind::Normal, "x9", 1);
        assert_eq!(pool.select(&rollback), Acquire::Ready(held));
        let unpaired = xa(TrxKind::Normal, "other", 1);
        assert_eq!(pool.select(&unpaired), Acquire::Ready(0));
    }

    #[test]
    fn test_checkout_busy_slot_refused() {
        let mut pool = ConnectionPool::new(1);
        let slot = pool.add(Nop);
        assert!(pool.checkout(slot).is_some());
        assert!(pool.checkout(slot).is_none());
        assert!(pool.checkout(7).is_none());
    }
}
