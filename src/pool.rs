//! Bounded, thread-safe per-host connection pool.
//!
//! This is a direct generalization of the teacher pool's `SharedPool<M>` /
//! `PoolInternals<C>` / `add_connection` / `get_conn` / `put_back` shape,
//! retargeted from a generic `ManageConnection` to the concrete `Host` /
//! `RpcChannel` pair this crate serves, with a `num_blocked` counter added
//! for the `numBlockedThreads` observer and an explicit `invalidate`/
//! `invalidate_all` pair for host-health-driven teardown.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{oneshot, Mutex};

use crate::connection::Connection;
use crate::error::PoolError;
use crate::host::{Host, HostConfig};
use crate::transport::TransportFactory;

/// A snapshot of a pool's counters. Observers read without holding the
/// pool's own mutex across the caller's use of the snapshot, so the values
/// may be slightly stale under concurrent activity; this is acceptable per
/// the crate's concurrency design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Connections currently on loan to a caller.
    pub num_active: u32,
    /// Connections idle in the pool, ready to be borrowed.
    pub num_idle: u32,
    /// Callers currently blocked in `borrow` waiting for a connection.
    pub num_blocked: u32,
}

impl PoolStats {
    /// `true` iff the pool has no idle connections and is at its active
    /// cap — a subsequent `borrow` will block or fail.
    pub fn is_exhausted(&self, max_active: u32) -> bool {
        self.num_active >= max_active && self.num_idle == 0
    }
}

struct Internals {
    idle: VecDeque<Connection>,
    waiters: VecDeque<oneshot::Sender<Connection>>,
    num_active: u32,
    num_pending: u32,
    num_blocked: u32,
    /// Set by `invalidate_all` once the pool has been torn down (host
    /// removed, or cluster shut down). `num_active` is deliberately *not*
    /// zeroed alongside it — a detached pool has no way to know whether a
    /// caller is still holding one of its `Connection`s (see the crate's
    /// no-back-pointer design), so the count must stay accurate for
    /// in-flight borrows to `release`/`invalidate` into without underflow.
    /// A detached pool never re-idles a healthy connection; every
    /// release/invalidate closes it, so the pool eventually reaches
    /// `num_active == 0, num_idle == 0` and is garbage-collected.
    detached: bool,
}

impl Internals {
    /// Hands `conn` to the next waiter if one exists (retrying past any
    /// whose receiver has already been dropped), otherwise queues it idle.
    /// Mirrors the teacher pool's `PoolInternals::put_idle_conn`.
    fn hand_off_or_park(&mut self, mut conn: Connection) {
        conn.mark_released();
        loop {
            if let Some(waiter) = self.waiters.pop_front() {
                conn.mark_borrowed();
                match waiter.send(conn) {
                    Ok(()) => {
                        self.num_active += 1;
                        return;
                    }
                    Err(returned) => {
                        conn = returned;
                        continue;
                    }
                }
            }
            self.idle.push_back(conn);
            return;
        }
    }
}

struct PerHostPoolInner {
    host: Host,
    config: HostConfig,
    transport: Arc<dyn TransportFactory>,
    internals: Mutex<Internals>,
}

/// The exclusive owner of a bounded set of [`Connection`]s for one [`Host`].
#[derive(Clone)]
pub struct PerHostPool {
    inner: Arc<PerHostPoolInner>,
}

impl fmt::Debug for PerHostPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PerHostPool")
            .field("host", &self.inner.host)
            .finish()
    }
}

impl PerHostPool {
    /// Creates an empty pool for `host`. No connections are opened eagerly.
    pub fn new(host: Host, config: HostConfig, transport: Arc<dyn TransportFactory>) -> Self {
        PerHostPool {
            inner: Arc::new(PerHostPoolInner {
                host,
                config,
                transport,
                internals: Mutex::new(Internals {
                    idle: VecDeque::new(),
                    waiters: VecDeque::new(),
                    num_active: 0,
                    num_pending: 0,
                    num_blocked: 0,
                    detached: false,
                }),
            }),
        }
    }

    /// The host this pool serves.
    pub fn host(&self) -> &Host {
        &self.inner.host
    }

    /// Current counters. See [`PoolStats`] for staleness caveats.
    pub async fn stats(&self) -> PoolStats {
        let internals = self.inner.internals.lock().await;
        PoolStats {
            num_active: internals.num_active,
            num_idle: internals.idle.len() as u32,
            num_blocked: internals.num_blocked,
        }
    }

    /// Returns an idle connection if one exists; otherwise opens a new one
    /// if the pool has spare capacity; otherwise blocks up to
    /// `config.borrow_timeout` for one to be released, failing with
    /// [`PoolError::Exhausted`] if the deadline elapses.
    pub async fn borrow(&self) -> Result<Connection, PoolError> {
        let mut internals = self.inner.internals.lock().await;

        if let Some(mut conn) = internals.idle.pop_front() {
            conn.mark_borrowed();
            internals.num_active += 1;
            return Ok(conn);
        }

        let in_flight = internals.num_active + internals.idle.len() as u32 + internals.num_pending;
        if in_flight < self.inner.config.max_active {
            internals.num_pending += 1;
            drop(internals);

            let opened = Connection::open(
                &self.inner.host,
                self.inner.transport.as_ref(),
                self.inner.config.socket_timeout,
            )
            .await;

            let mut internals = self.inner.internals.lock().await;
            internals.num_pending -= 1;
            return match opened {
                Ok(mut conn) => {
                    conn.mark_borrowed();
                    internals.num_active += 1;
                    Ok(conn)
                }
                Err(e) => {
                    tracing::warn!(host = %self.inner.host, error = %e, "failed to open new connection");
                    Err(PoolError::from(e))
                }
            };
        }

        internals.num_blocked += 1;
        let (tx, rx) = oneshot::channel();
        internals.waiters.push_back(tx);
        drop(internals);

        let result = tokio::time::timeout(self.inner.config.borrow_timeout, rx).await;

        let mut internals = self.inner.internals.lock().await;
        internals.num_blocked -= 1;
        match result {
            Ok(Ok(conn)) => Ok(conn),
            _ => Err(PoolError::Exhausted(self.inner.host.clone())),
        }
    }

    /// Returns `conn` to the pool, or destroys it if it is stale, the pool
    /// is already at `max_idle`, or the pool has been detached (see
    /// [`PerHostPool::invalidate_all`]). Waking a blocked waiter, if any, is
    /// handled inline for a healthy connection and by a best-effort
    /// replenish task when the connection is destroyed instead.
    ///
    /// Fails with [`PoolError::Fatal`] — per spec §4.4, "releasing a
    /// Connection from a different Host is a programming error" — if `conn`
    /// does not belong to this pool's host. The connection is still closed
    /// in that case so its channel is not leaked; its true owning pool's
    /// bookkeeping is left untouched, since this pool has no way to reach
    /// it.
    pub async fn release(&self, mut conn: Connection) -> Result<(), PoolError> {
        if conn.host() != &self.inner.host {
            tracing::error!(
                expected = %self.inner.host,
                actual = %conn.host(),
                "connection released to the wrong per-host pool"
            );
            let mismatch = format!(
                "connection for host {} released to the pool for host {}",
                conn.host(),
                self.inner.host,
            );
            conn.close().await;
            return Err(PoolError::Fatal(mismatch));
        }

        let mut internals = self.inner.internals.lock().await;
        internals.num_active = internals.num_active.saturating_sub(1);

        if internals.detached {
            drop(internals);
            conn.close().await;
            return Ok(());
        }

        if conn.is_stale() || internals.idle.len() as u32 >= self.inner.config.max_idle {
            let had_waiters = !internals.waiters.is_empty();
            drop(internals);
            conn.close().await;
            if had_waiters {
                self.spawn_replenish_for_waiter();
            }
        } else {
            internals.hand_off_or_park(conn);
        }
        Ok(())
    }

    /// Unconditionally destroys `conn`, decrementing the active count and
    /// attempting to satisfy one blocked waiter with a freshly opened
    /// connection (skipped if the pool is detached — opening a fresh
    /// connection to a removed host serves no one).
    ///
    /// Fails with [`PoolError::Fatal`] on a host mismatch, as in
    /// [`PerHostPool::release`].
    pub async fn invalidate(&self, mut conn: Connection) -> Result<(), PoolError> {
        if conn.host() != &self.inner.host {
            tracing::error!(
                expected = %self.inner.host,
                actual = %conn.host(),
                "connection invalidated against the wrong per-host pool"
            );
            let mismatch = format!(
                "connection for host {} invalidated against the pool for host {}",
                conn.host(),
                self.inner.host,
            );
            conn.close().await;
            return Err(PoolError::Fatal(mismatch));
        }

        let mut internals = self.inner.internals.lock().await;
        internals.num_active = internals.num_active.saturating_sub(1);
        let had_waiters = !internals.waiters.is_empty() && !internals.detached;
        drop(internals);

        conn.close().await;
        if had_waiters {
            self.spawn_replenish_for_waiter();
        }
        Ok(())
    }

    /// Destroys every idle connection and marks the pool detached: any
    /// connection still on loan to a caller at this point is not torn down
    /// in place (this crate's `Connection` has no back-pointer to force
    /// that), but every subsequent `release`/`invalidate` against it closes
    /// the connection instead of reusing it, so the pool's counters
    /// eventually reach zero and it can be garbage-collected. Called when a
    /// host is removed or the cluster shuts down.
    pub async fn invalidate_all(&self) {
        let mut internals = self.inner.internals.lock().await;
        let idle = std::mem::take(&mut internals.idle);
        internals.detached = true;
        drop(internals);

        for mut conn in idle {
            conn.mark_closed();
            conn.close().await;
        }
    }

    fn spawn_replenish_for_waiter(&self) {
        let host = self.inner.host.clone();
        let transport = self.inner.transport.clone();
        let timeout = self.inner.config.socket_timeout;
        let internals_handle = self.inner.clone();
        tokio::spawn(async move {
            match Connection::open(&host, transport.as_ref(), timeout).await {
                Ok(conn) => {
                    let mut internals = internals_handle.internals.lock().await;
                    internals.hand_off_or_park(conn);
                }
                Err(e) => {
                    tracing::debug!(%host, error = %e, "replenish-for-waiter connect failed");
                }
            }
        });
    }
}
