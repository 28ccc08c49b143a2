// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mock Destination for testing.
//!
//! Records every executed statement with the session it ran on and a
//! logical start/end tick, so tests can check which statements overlapped
//! in time. Configurable connect failures, statement failures and delay.

use binlog_replay::destination::{BoxFuture, Destination, DestinationError, Session};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// A recorded execute() call.
#[derive(Debug, Clone)]
pub struct Executed {
    pub session: u64,
    pub sql: String,
    /// Logical clock tick when execution began.
    pub start: u64,
    /// Logical clock tick when execution finished.
    pub end: u64,
}

impl Executed {
    /// Whether two executions were in flight at the same time.
    pub fn concurrent_with(&self, other: &Executed) -> bool {
        self.start < other.end && other.start < self.end
    }
}

#[derive(Default)]
struct Inner {
    executed: RwLock<Vec<Executed>>,
    clock: AtomicU64,
    sessions: AtomicU64,
    /// Connects allowed before connect() starts failing.
    connect_limit: AtomicU64,
    /// Statements containing this text fail.
    fail_on: RwLock<Option<String>>,
    delay_ms: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// Mock implementation of Destination that records all calls.
///
/// # Example
/// ```rust,ignore
/// let mock = MockDestination::new().with_delay(Duration::from_millis(20));
/// let dispatcher = Dispatcher::start(mock.clone(), settings, log, None);
/// // ...
/// assert_eq!(mock.statements().await, vec!["insert into d.t values(1)"]);
/// ```
#[derive(Clone)]
pub struct MockDestination {
    inner: Arc<Inner>,
}

impl Default for MockDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDestination {
    pub fn new() -> Self {
        let inner = Inner {
            connect_limit: AtomicU64::new(u64::MAX),
            ..Default::default()
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Every statement sleeps this long before completing.
    pub fn with_delay(self, delay: Duration) -> Self {
        self.inner
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    /// Allow `n` successful connects, then fail.
    pub fn with_connect_limit(self, n: u64) -> Self {
        self.inner.connect_limit.store(n, Ordering::SeqCst);
        self
    }

    /// Fail any statement containing `needle`.
    pub async fn fail_on(&self, needle: &str) {
        *self.inner.fail_on.write().await = Some(needle.to_string());
    }

    pub async fn executed(&self) -> Vec<Executed> {
        self.inner.executed.read().await.clone()
    }

    pub async fn statements(&self) -> Vec<String> {
        self.executed().await.into_iter().map(|e| e.sql).collect()
    }

    /// The recorded execution of the first statement equal to `sql`.
    pub async fn find(&self, sql: &str) -> Option<Executed> {
        self.executed().await.into_iter().find(|e| e.sql == sql)
    }

    pub fn sessions_opened(&self) -> u64 {
        self.inner.sessions.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.inner.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Destination for MockDestination {
    type Session = MockSession;

    fn connect(&self) -> BoxFuture<'_, MockSession> {
        Box::pin(async move {
            let opened = self.inner.sessions.load(Ordering::SeqCst);
            if opened >= self.inner.connect_limit.load(Ordering::SeqCst) {
                return Err(DestinationError("Can't connect to MySQL server (mock)".to_string()));
            }
            let id = self.inner.sessions.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(MockSession {
                id,
                inner: Arc::clone(&self.inner),
            })
        })
    }
}

pub struct MockSession {
    pub id: u64,
    inner: Arc<Inner>,
}

impl Session for MockSession {
    fn execute<'a>(&'a mut self, sql: &'a str) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let inner = &self.inner;
            let start = inner.clock.fetch_add(1, Ordering::SeqCst);
            let now = inner.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            inner.max_in_flight.fetch_max(now, Ordering::SeqCst);

            let delay = inner.delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            } else {
                tokio::task::yield_now().await;
            }

            inner.in_flight.fetch_sub(1, Ordering::SeqCst);
            let end = inner.clock.fetch_add(1, Ordering::SeqCst);

            let failing = inner
                .fail_on
                .read()
                .await
                .as_deref()
                .is_some_and(|needle| sql.contains(needle));
            if failing {
                return Err(DestinationError(format!("Duplicate entry for {}", sql)));
            }

            inner.executed.write().await.push(Executed {
                session: self.id,
                sql: sql.to_string(),
                start,
                end,
            });
            Ok(())
        })
    }
}
