use {
    crate::{client::Connector, client::CoordError, session::Connection},
    futures::future::join_all,
    std::{
        collections::VecDeque,
        ops::Deref,
        sync::{Arc, Mutex},
    },
    thiserror::Error,
    tokio::sync::Notify,
    tracing::{info, trace, warn},
};

///
/// Pool lifecycle. One-way: `Open -> Closing -> Closed`; a pool instance is
/// never re-opened.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolPhase {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum PoolError {
    /// Immediate-mode checkout found no free connection and no room to grow.
    #[error("no connection available")]
    Unavailable,
    #[error("pool shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Coord(#[from] CoordError),
}

struct PoolState {
    phase: PoolPhase,
    free: VecDeque<Connection>,
    /// Every established connection, leased or free.
    all: Vec<Connection>,
    /// Connections currently being established, counted against `max`.
    connecting: usize,
}

impl PoolState {
    fn leased(&self) -> usize {
        self.all.len() - self.free.len()
    }
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    max: usize,
    state: Mutex<PoolState>,
    /// Signalled when a connection is checked in or growth becomes possible.
    available: Notify,
    /// Signalled during Closing when the last lease returns.
    idle: Notify,
}

///
/// A bounded set of coordination-service sessions multiplexed across
/// application tasks.
///
/// `min` connections are established eagerly at [`open`](ConnectionPool::
/// open); the pool grows on demand up to `max`. A connection is either
/// checked out (leased) or in the free list, never both, and at every
/// instant `available + leased == live`.
///
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    min: usize,
}

///
/// A leased connection. Dropping the guard returns the connection to the
/// pool and wakes one waiting checkout, on every exit path including panic
/// and task cancellation.
///
pub struct PooledConn {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConn {
    pub fn connection(&self) -> &Connection {
        self.conn.as_ref().expect("lease already returned")
    }

    /// Returns the connection to the pool. Equivalent to dropping the guard.
    pub fn checkin(self) {
        drop(self);
    }
}

impl Deref for PooledConn {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.connection()
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            checkin(&self.pool, conn);
        }
    }
}

fn checkin(pool: &Arc<PoolInner>, conn: Connection) {
    let mut state = pool.state.lock().expect("pool mutex poisoned");
    match state.phase {
        PoolPhase::Open => {
            state.free.push_back(conn);
            drop(state);
            pool.available.notify_one();
        }
        PoolPhase::Closing => {
            state.free.push_back(conn);
            let drained = state.leased() == 0 && state.connecting == 0;
            drop(state);
            if drained {
                pool.idle.notify_waiters();
            }
        }
        // Teardown already closed this connection; nothing left to track.
        PoolPhase::Closed => drop(conn),
    }
}

impl ConnectionPool {
    ///
    /// Opens a pool with `min` eagerly established connections and room to
    /// grow to `max`. Panics if the bounds are inconsistent; fails if any of
    /// the initial connections cannot be established (tearing down the ones
    /// that were).
    ///
    pub async fn open(
        connector: Arc<dyn Connector>,
        min: usize,
        max: usize,
    ) -> Result<Self, PoolError> {
        assert!(max >= 1, "pool must allow at least one connection");
        assert!(min <= max, "min_clients must not exceed max_clients");
        let pool = Self {
            inner: Arc::new(PoolInner {
                connector,
                max,
                state: Mutex::new(PoolState {
                    phase: PoolPhase::Open,
                    free: VecDeque::new(),
                    all: Vec::new(),
                    connecting: 0,
                }),
                available: Notify::new(),
                idle: Notify::new(),
            }),
            min,
        };
        for established in 0..min {
            match Connection::connect(&*pool.inner.connector).await {
                Ok(conn) => {
                    let mut state = pool.inner.state.lock().expect("pool mutex poisoned");
                    state.all.push(conn.clone());
                    state.free.push_back(conn);
                }
                Err(e) => {
                    warn!("pool warmup failed after {established} connections: {e}");
                    pool.close_all(false).await;
                    return Err(e.into());
                }
            }
        }
        Ok(pool)
    }

    /// The degenerate fixed-size variant: `min == max == n`, no growth.
    pub async fn fixed(connector: Arc<dyn Connector>, n: usize) -> Result<Self, PoolError> {
        Self::open(connector, n, n).await
    }

    pub fn min_clients(&self) -> usize {
        self.min
    }

    pub fn max_clients(&self) -> usize {
        self.inner.max
    }

    /// Established connections, leased or free.
    pub fn live(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").all.len()
    }

    pub fn available(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").free.len()
    }

    pub fn leased(&self) -> usize {
        self.inner.state.lock().expect("pool mutex poisoned").leased()
    }

    pub fn phase(&self) -> PoolPhase {
        self.inner.state.lock().expect("pool mutex poisoned").phase
    }

    ///
    /// Leases a connection, suspending until one is checked in or growth
    /// becomes possible. The whole decision is re-run after every wake, so a
    /// stale decision is never returned. Fails immediately with
    /// [`PoolError::ShuttingDown`] once the pool is closing.
    ///
    pub async fn checkout(&self) -> Result<PooledConn, PoolError> {
        self.checkout_inner(true).await
    }

    ///
    /// Like [`checkout`](ConnectionPool::checkout) but never waits: if no
    /// connection is free and the pool cannot grow, returns
    /// [`PoolError::Unavailable`].
    ///
    pub async fn try_checkout(&self) -> Result<PooledConn, PoolError> {
        self.checkout_inner(false).await
    }

    ///
    /// Scoped lease: checks out, runs `f` with the connection, and checks
    /// the connection back in on every exit path.
    ///
    pub async fn with_conn<T, F, Fut>(&self, f: F) -> Result<T, PoolError>
    where
        F: FnOnce(Connection) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let lease = self.checkout().await?;
        let conn = lease.connection().clone();
        let out = f(conn).await;
        drop(lease);
        Ok(out)
    }

    async fn checkout_inner(&self, blocking: bool) -> Result<PooledConn, PoolError> {
        enum Decision {
            Lease(Connection),
            Grow,
            Wait,
        }
        loop {
            let decision = {
                let mut state = self.inner.state.lock().expect("pool mutex poisoned");
                if state.phase != PoolPhase::Open {
                    return Err(PoolError::ShuttingDown);
                }
                if let Some(conn) = state.free.pop_front() {
                    Decision::Lease(conn)
                } else if state.all.len() + state.connecting < self.inner.max {
                    state.connecting += 1;
                    Decision::Grow
                } else {
                    Decision::Wait
                }
            };
            match decision {
                Decision::Lease(conn) => {
                    return Ok(PooledConn {
                        conn: Some(conn),
                        pool: Arc::clone(&self.inner),
                    });
                }
                Decision::Grow => return self.grow().await,
                Decision::Wait => {
                    if !blocking {
                        return Err(PoolError::Unavailable);
                    }
                    let notified = self.inner.available.notified();
                    tokio::pin!(notified);
                    // Arm the wakeup, then peek once more so a checkin that
                    // landed since the decision is not missed.
                    notified.as_mut().enable();
                    {
                        let state = self.inner.state.lock().expect("pool mutex poisoned");
                        if state.phase != PoolPhase::Open {
                            return Err(PoolError::ShuttingDown);
                        }
                        if !state.free.is_empty()
                            || state.all.len() + state.connecting < self.inner.max
                        {
                            continue;
                        }
                    }
                    notified.await;
                }
            }
        }
    }

    async fn grow(&self) -> Result<PooledConn, PoolError> {
        let result = Connection::connect(&*self.inner.connector).await;

        // Work out what to do while holding the pool lock, but defer any
        // `.await` until the guard has been released: the guard's scope must
        // not span a suspend point or the resulting future would be `!Send`.
        enum Deferred {
            CloseShutdown(Connection),
            Fail(PoolError),
        }

        let deferred = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.connecting -= 1;
            match result {
                Ok(conn) => {
                    if state.phase != PoolPhase::Open {
                        let drained = state.leased() == 0 && state.connecting == 0;
                        drop(state);
                        if drained {
                            self.inner.idle.notify_waiters();
                        }
                        Deferred::CloseShutdown(conn)
                    } else {
                        state.all.push(conn.clone());
                        trace!("pool grew to {} connections", state.all.len());
                        return Ok(PooledConn {
                            conn: Some(conn),
                            pool: Arc::clone(&self.inner),
                        });
                    }
                }
                Err(e) => {
                    let closing = state.phase != PoolPhase::Open;
                    let drained = state.leased() == 0 && state.connecting == 0;
                    drop(state);
                    if closing && drained {
                        self.inner.idle.notify_waiters();
                    }
                    // A slot opened back up; some other waiter may be able to
                    // use it.
                    self.inner.available.notify_one();
                    Deferred::Fail(e.into())
                }
            }
        };

        match deferred {
            Deferred::CloseShutdown(conn) => {
                conn.close().await;
                Err(PoolError::ShuttingDown)
            }
            Deferred::Fail(err) => Err(err),
        }
    }

    ///
    /// Closes the pool: `Open -> Closing -> Closed`. Graceful mode first
    /// waits for every leased connection to be returned, so no in-flight
    /// operation is aborted; immediate mode closes connections out from
    /// under their holders, which surfaces as a connection-closed failure to
    /// any blocked caller. Checkouts attempted during or after closing fail
    /// immediately. A second call returns immediately, leaving teardown to
    /// the first.
    ///
    pub async fn close_all(&self, graceful: bool) {
        {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            if state.phase != PoolPhase::Open {
                return;
            }
            state.phase = PoolPhase::Closing;
        }
        // Every blocked checkout must observe Closing and fail.
        self.inner.available.notify_waiters();

        if graceful {
            loop {
                let notified = self.inner.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let state = self.inner.state.lock().expect("pool mutex poisoned");
                    if state.leased() == 0 && state.connecting == 0 {
                        break;
                    }
                }
                notified.await;
            }
        }

        let conns = {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.free.clear();
            std::mem::take(&mut state.all)
        };
        join_all(conns.iter().map(|conn| conn.close())).await;
        {
            let mut state = self.inner.state.lock().expect("pool mutex poisoned");
            state.free.clear();
            state.phase = PoolPhase::Closed;
        }
        info!("connection pool closed ({} connections)", conns.len());
    }
}
