//! Error kinds shared across the pool and the failover executor.

use crate::host::Host;
use crate::transport::TransportError;

/// Errors raised by [`crate::PerHostPool`] and [`crate::ClusterPool`] borrow
/// operations that do not go through the failover executor.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The borrow deadline elapsed before a connection became available.
    #[error("pool exhausted waiting for a connection to {0}")]
    Exhausted(Host),
    /// No live host is available to borrow from.
    #[error("no live hosts available")]
    NoLiveHosts,
    /// A lazily-created connection failed to open.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Programmer misuse: a null/foreign connection released, a host
    /// mismatch on release, or a borrow against a pool that has been shut
    /// down. Not retried by any caller; surfaced immediately.
    #[error("fatal pool misuse: {0}")]
    Fatal(String),
}

/// The classification the [`crate::ErrorClassifier`] collaborator assigns to
/// a raw operation error, driving the failover executor's retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifiedKind {
    /// The server accepted the request but did not answer in time.
    Timeout,
    /// The server reported an insufficient number of replicas.
    Unavailable,
    /// The RPC channel itself failed (connect or I/O failure).
    Transport,
    /// A logical error returned by the server (not-found, schema mismatch,
    /// etc). Never retried.
    Application,
}

/// The outcome of a [`crate::Executor::execute`] call once its retry budget
/// is spent, or immediately for non-retried error kinds.
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + 'static> {
    /// Borrowing a connection for the first (or a subsequent) attempt timed
    /// out. Not retried further by the executor.
    #[error("pool exhausted while selecting a host")]
    PoolExhausted,
    /// The operation returned an application-level error; surfaced
    /// immediately without consuming retry budget.
    #[error("application error: {0}")]
    Application(#[source] E),
    /// The retry budget was exhausted; this is the last recoverable error
    /// observed.
    #[error("retries exhausted, last error: {0}")]
    RetriesExhausted(#[source] E),
    /// Programmer misuse surfaced through the executor (e.g. the cluster
    /// pool it was given has no live hosts).
    #[error("fatal: {0}")]
    Fatal(String),
}

impl<E: std::error::Error + 'static> From<PoolError> for ExecuteError<E> {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted(_) | PoolError::NoLiveHosts | PoolError::Transport(_) => {
                ExecuteError::PoolExhausted
            }
            PoolError::Fatal(msg) => ExecuteError::Fatal(msg),
        }
    }
}
