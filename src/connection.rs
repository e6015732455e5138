//! A single live RPC channel to one host, plus pool bookkeeping flags.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::host::Host;
use crate::transport::{RpcChannel, TransportError, TransportFactory};

fn next_serial() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// One open RPC channel to exactly one [`Host`], owned at any instant by
/// either the idle queue of its [`crate::PerHostPool`] or the caller that
/// currently borrowed it — never both.
///
/// There is no back-pointer from `Connection` to its pool (see the cyclic
/// reference note in the crate's design notes): `release`/`invalidate`
/// always route through `Host` lookup on the owning `ClusterPool`.
#[derive(Debug)]
pub struct Connection {
    host: Host,
    serial: u64,
    channel: Box<dyn RpcChannel>,
    closed: bool,
    has_errors: bool,
    borrowed: bool,
}

impl Connection {
    /// Opens a fresh channel to `host` via `factory`, failing with
    /// [`TransportError`] if it cannot be established within `timeout`.
    pub(crate) async fn open(
        host: &Host,
        factory: &dyn TransportFactory,
        timeout: Duration,
    ) -> Result<Connection, TransportError> {
        let channel = factory.open(host, timeout).await?;
        Ok(Connection {
            host: host.clone(),
            serial: next_serial(),
            channel,
            closed: false,
            has_errors: false,
            borrowed: false,
        })
    }

    /// The host this connection talks to.
    pub fn host(&self) -> &Host {
        &self.host
    }

    /// A process-unique serial number assigned at creation, for
    /// diagnostics only — unrelated to the timestamp source's counter.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Direct access to the underlying channel for issuing RPCs.
    pub fn channel_mut(&mut self) -> &mut dyn RpcChannel {
        self.channel.as_mut()
    }

    /// Tears down the channel. Idempotent.
    pub(crate) async fn close(&mut self) {
        if !self.closed {
            self.channel.close().await;
            self.closed = true;
        }
    }

    /// Marks the channel as failed. A borrower that observes an error on
    /// the underlying channel must call this before releasing.
    pub fn mark_error(&mut self) {
        self.has_errors = true;
    }

    /// Marks the connection as torn down without running the async teardown
    /// (used once `close` has already completed, or by tests).
    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    /// Marks the connection as currently on loan to a caller.
    pub(crate) fn mark_borrowed(&mut self) {
        self.borrowed = true;
    }

    /// Marks the connection as returned to its pool.
    pub(crate) fn mark_released(&mut self) {
        self.borrowed = false;
    }

    /// `true` once the connection has been closed or has observed an error;
    /// a stale connection must not be reused and should be invalidated
    /// rather than returned to the idle set.
    pub fn is_stale(&self) -> bool {
        self.closed || self.has_errors
    }

    /// `true` if the connection is currently on loan.
    pub fn is_borrowed(&self) -> bool {
        self.borrowed
    }
}
