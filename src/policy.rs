//! Declarative retry strategies, including a consistency-degrading variant.

use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A server-side consistency setting dictating how many replicas must
/// acknowledge an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    /// Every replica must acknowledge.
    All,
    /// A quorum of replicas must acknowledge.
    Quorum,
    /// A single replica's acknowledgement suffices.
    One,
    /// A local quorum within the caller's datacenter.
    LocalQuorum,
    /// Any replica, including a hinted handoff, suffices.
    Any,
}

impl Consistency {
    /// The level [`FailoverPolicy::DegradeConsistency`] steps down to:
    /// `All` drops to `Quorum`; anything else drops to `One`.
    fn stepped_down(self) -> Consistency {
        match self {
            Consistency::All => Consistency::Quorum,
            _ => Consistency::One,
        }
    }
}

const DEGRADE_WINDOW: Duration = Duration::from_millis(10_000);

#[derive(Debug, Default)]
struct DegradeState {
    /// Set while a degraded level is in effect, alongside when it expires.
    active: Option<(Consistency, Instant)>,
}

/// An immutable retry strategy, with one variant ([`FailoverPolicy::DegradeConsistency`])
/// carrying transient, mutex-protected state.
///
/// An enum rather than a trait object: the four variants in the crate's
/// design are closed, and only the degrading variant has any mutable state
/// (its `(degraded_level, expiry)` pair), matching the "tagged variant with
/// per-variant state" shape called for by this crate's design notes.
#[derive(Debug)]
pub enum FailoverPolicy {
    /// No retry; surface the first error.
    FailFast,
    /// Try at most one additional host.
    TryOneNext,
    /// Try each live host at most once.
    TryAll,
    /// On `Unavailable` or transport error, step the consistency level down
    /// for a 10 second window, then revert. Retries up to 5 times.
    DegradeConsistency(Mutex<DegradeState>),
}

impl FailoverPolicy {
    /// Builds the `DegradeConsistency` variant with an empty (non-degraded)
    /// window.
    pub fn degrade_consistency() -> Self {
        FailoverPolicy::DegradeConsistency(Mutex::new(DegradeState::default()))
    }

    /// The maximum number of retries after the first attempt.
    pub fn num_retries(&self) -> u32 {
        match self {
            FailoverPolicy::FailFast => 0,
            FailoverPolicy::TryOneNext => 1,
            FailoverPolicy::TryAll => u32::MAX,
            FailoverPolicy::DegradeConsistency(_) => 5,
        }
    }

    /// Milliseconds to sleep between failover attempts.
    pub fn sleep_between_hosts_millis(&self) -> u64 {
        0
    }

    /// Pure hook: returns the consistency level the next attempt should run
    /// at, given the operation's currently configured level. Only the
    /// degrading variant ever returns something other than `current`.
    pub fn check_consistency(&self, current: Consistency) -> Consistency {
        match self {
            FailoverPolicy::DegradeConsistency(state) => {
                let guard = state.lock().expect("policy mutex poisoned");
                match guard.active {
                    Some((level, expiry)) if Instant::now() < expiry => level,
                    _ => current,
                }
            }
            _ => current,
        }
    }

    /// Hook invoked when an attempt fails with `Timeout`. Only
    /// `DegradeConsistency` has any state to mutate, and it does not react
    /// to timeouts.
    pub fn handle_timeout(&self, _attempt: u32) {}

    /// Hook invoked when an attempt fails with `Unavailable`. Starts (or
    /// refreshes) the degrade window for `DegradeConsistency`.
    pub fn handle_unavailable(&self, attempt: u32, current: Consistency) {
        self.begin_degrade_window(current);
        let _ = attempt;
    }

    /// Hook invoked when an attempt fails with a transport error. Starts
    /// (or refreshes) the degrade window for `DegradeConsistency`.
    pub fn handle_transport_error(&self, attempt: u32, current: Consistency) {
        self.begin_degrade_window(current);
        let _ = attempt;
    }

    fn begin_degrade_window(&self, current: Consistency) {
        if let FailoverPolicy::DegradeConsistency(state) = self {
            let mut guard = state.lock().expect("policy mutex poisoned");
            guard.active = Some((current.stepped_down(), Instant::now() + DEGRADE_WINDOW));
        }
    }
}
