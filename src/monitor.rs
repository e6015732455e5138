//! The diagnostic counter sink consumed by the failover executor.
//!
//! Modeled after the teacher pool's `ErrorSink` / `NopErrorSink` pair: a
//! trait the application supplies, plus a no-op default so a `Cluster` can
//! be built without one.

use std::fmt;

/// Names of the diagnostic counters the executor increments. The crate only
/// consumes a counter-increment interface; exporting these to a metrics
/// backend is an external collaborator's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// A connect/borrow failure recovered by failing over to another host.
    RecoverableLbConnectErrors,
    /// A recoverable `Timeout` classified error.
    RecoverableTimedOutExceptions,
    /// A recoverable `Unavailable` classified error.
    RecoverableUnavailableExceptions,
    /// A recoverable `Transport` classified error.
    RecoverableTransportExceptions,
}

/// A sink for diagnostic counters. Implementations must be cheap to call
/// from the hot path of every executed operation.
pub trait Monitor: fmt::Debug + Send + Sync {
    /// Increments the named counter by one.
    fn increment(&self, counter: Counter);
}

/// A [`Monitor`] that discards every increment.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopMonitor;

impl Monitor for NopMonitor {
    fn increment(&self, _counter: Counter) {}
}
