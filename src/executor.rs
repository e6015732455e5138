//! Wraps a user-supplied operation in a retry loop that advances a host
//! cursor and invokes the failover policy's hooks.

use std::collections::HashSet;
use std::time::Duration;

use futures::future::BoxFuture;

use crate::cluster::ClusterPool;
use crate::connection::Connection;
use crate::error::{ClassifiedKind, ExecuteError, PoolError};
use crate::host::Host;
use crate::monitor::{Counter, Monitor};
use crate::policy::{Consistency, FailoverPolicy};
use crate::transport::ErrorClassifier;

/// An application-supplied unit of work run against a borrowed
/// [`Connection`], parameterized over its success type `T` and its raw
/// (unclassified) error type `E`.
///
/// Named after, and filling the same role as, the `Operation<T>` interface
/// this crate's failover executor was modeled on: a single `call` entry
/// point plus the consistency level the executor may degrade before
/// invoking it.
pub trait Operation<T, E>: Send {
    /// The consistency level this operation is currently configured to run
    /// at.
    fn consistency(&self) -> Consistency;

    /// Called by the executor before each attempt if the policy's
    /// `check_consistency` hook returns a different level.
    fn set_consistency(&mut self, level: Consistency);

    /// Runs the operation against `conn`.
    fn call<'c>(&'c mut self, conn: &'c mut Connection) -> BoxFuture<'c, Result<T, E>>;
}

/// Stateless driver for the retry/failover loop described in this crate's
/// executor design: borrow, run, classify, retry on a different host.
#[derive(Debug, Default)]
pub struct Executor;

impl Executor {
    /// Creates a new executor. `Executor` holds no state of its own — all
    /// state lives in the `ClusterPool` and `FailoverPolicy` passed in.
    pub fn new() -> Self {
        Executor
    }

    /// Executes `op` against `cluster`, retrying per `policy` on
    /// `Timeout`/`Unavailable`/`Transport` classified errors (as determined
    /// by `classifier`) up to `policy.num_retries()` additional attempts.
    /// `Application` errors are surfaced immediately without consuming
    /// retry budget.
    pub async fn execute<T, E>(
        &self,
        cluster: &ClusterPool,
        policy: &FailoverPolicy,
        monitor: &dyn Monitor,
        classifier: &dyn ErrorClassifier<E>,
        op: &mut dyn Operation<T, E>,
    ) -> Result<T, ExecuteError<E>>
    where
        E: std::error::Error + 'static,
    {
        let mut tried: HashSet<Host> = HashSet::new();
        let mut attempt: u32 = 0;
        let mut last_err: Option<E> = None;

        loop {
            let (host, mut conn) = match self.borrow_for_attempt(cluster, attempt, &tried).await {
                Ok(pair) => pair,
                Err(PoolError::NoLiveHosts) if last_err.is_some() => {
                    return Err(ExecuteError::RetriesExhausted(last_err.unwrap()));
                }
                Err(e) => {
                    monitor.increment(Counter::RecoverableLbConnectErrors);
                    tracing::debug!(error = %e, attempt, "failed to borrow a connection for this attempt");
                    attempt += 1;
                    if attempt > policy.num_retries() {
                        return Err(e.into());
                    }
                    self.backoff(policy).await;
                    continue;
                }
            };
            tried.insert(host);

            let desired = policy.check_consistency(op.consistency());
            if desired != op.consistency() {
                op.set_consistency(desired);
            }

            match op.call(&mut conn).await {
                Ok(value) => {
                    cluster.release(conn).await?;
                    return Ok(value);
                }
                Err(err) => {
                    let kind = classifier.classify(&err);
                    if kind == ClassifiedKind::Application {
                        cluster.release(conn).await?;
                        return Err(ExecuteError::Application(err));
                    }

                    conn.mark_error();
                    cluster.invalidate(conn).await?;

                    let level = op.consistency();
                    match kind {
                        ClassifiedKind::Timeout => {
                            policy.handle_timeout(attempt);
                            monitor.increment(Counter::RecoverableTimedOutExceptions);
                        }
                        ClassifiedKind::Unavailable => {
                            policy.handle_unavailable(attempt, level);
                            monitor.increment(Counter::RecoverableUnavailableExceptions);
                        }
                        ClassifiedKind::Transport => {
                            policy.handle_transport_error(attempt, level);
                            monitor.increment(Counter::RecoverableTransportExceptions);
                        }
                        ClassifiedKind::Application => unreachable!("handled above"),
                    }

                    last_err = Some(err);
                    attempt += 1;
                    if attempt > policy.num_retries() {
                        return Err(ExecuteError::RetriesExhausted(last_err.unwrap()));
                    }
                    self.backoff(policy).await;
                }
            }
        }
    }

    async fn backoff(&self, policy: &FailoverPolicy) {
        let millis = policy.sleep_between_hosts_millis();
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }

    /// First attempt: least-active among all live hosts (`tried` is empty).
    /// Subsequent attempts: least-active among live hosts not yet tried in
    /// this invocation, if any remain.
    async fn borrow_for_attempt(
        &self,
        cluster: &ClusterPool,
        _attempt: u32,
        tried: &HashSet<Host>,
    ) -> Result<(Host, Connection), PoolError> {
        cluster.borrow_least_active(tried).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterPool;
    use crate::error::ClassifiedKind;
    use crate::host::HostConfig;
    use crate::monitor::test_support::CountingMonitor;
    use crate::transport::test_support::FlakyFactory;
    use futures::FutureExt;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom: {0}")]
    struct BoomError(&'static str);

    struct Classifier;
    impl ErrorClassifier<BoomError> for Classifier {
        fn classify(&self, err: &BoomError) -> ClassifiedKind {
            match err.0 {
                "timeout" => ClassifiedKind::Timeout,
                "unavailable" => ClassifiedKind::Unavailable,
                "application" => ClassifiedKind::Application,
                _ => ClassifiedKind::Transport,
            }
        }
    }

    struct CountingFailOp {
        failures_left: usize,
        kind: &'static str,
    }

    impl Operation<u32, BoomError> for CountingFailOp {
        fn consistency(&self) -> Consistency {
            Consistency::Quorum
        }
        fn set_consistency(&mut self, _level: Consistency) {}
        fn call<'c>(&'c mut self, _conn: &'c mut Connection) -> BoxFuture<'c, Result<u32, BoomError>> {
            async move {
                if self.failures_left > 0 {
                    self.failures_left -= 1;
                    Err(BoomError(self.kind))
                } else {
                    Ok(42)
                }
            }
            .boxed()
        }
    }

    async fn four_host_cluster() -> ClusterPool {
        let cluster = ClusterPool::new(Arc::new(FlakyFactory::always_ok()), HostConfig::default());
        for i in 0..4 {
            cluster.add_host(Host::new(format!("h{i}"), 9160)).await;
        }
        cluster
    }

    #[tokio::test]
    async fn try_all_succeeds_after_three_transport_failures() {
        let cluster = four_host_cluster().await;
        let policy = FailoverPolicy::TryAll;
        let monitor = CountingMonitor::default();
        let classifier = Classifier;
        let executor = Executor::new();
        let mut op = CountingFailOp {
            failures_left: 3,
            kind: "transport",
        };

        let result = executor
            .execute(&cluster, &policy, &monitor, &classifier, &mut op)
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(monitor.transport_count(), 3);
    }

    #[tokio::test]
    async fn application_errors_are_not_retried() {
        let cluster = four_host_cluster().await;
        let policy = FailoverPolicy::TryAll;
        let monitor = CountingMonitor::default();
        let classifier = Classifier;
        let executor = Executor::new();
        let mut op = CountingFailOp {
            failures_left: 1,
            kind: "application",
        };

        let result = executor
            .execute(&cluster, &policy, &monitor, &classifier, &mut op)
            .await;

        assert!(matches!(result, Err(ExecuteError::Application(_))));
        assert_eq!(monitor.total(), 0);
    }

    #[tokio::test]
    async fn fail_fast_surfaces_first_recoverable_error() {
        let cluster = four_host_cluster().await;
        let policy = FailoverPolicy::FailFast;
        let monitor = CountingMonitor::default();
        let classifier = Classifier;
        let executor = Executor::new();
        let mut op = CountingFailOp {
            failures_left: 100,
            kind: "timeout",
        };

        let result = executor
            .execute(&cluster, &policy, &monitor, &classifier, &mut op)
            .await;

        assert!(matches!(result, Err(ExecuteError::RetriesExhausted(_))));
    }

    #[tokio::test]
    async fn degrade_consistency_runs_next_attempt_degraded() {
        let cluster = four_host_cluster().await;
        let policy = FailoverPolicy::degrade_consistency();
        let monitor = CountingMonitor::default();
        let classifier = Classifier;
        let executor = Executor::new();

        struct RecordingOp {
            levels_seen: Arc<std::sync::Mutex<Vec<Consistency>>>,
            level: Consistency,
            failures_left: usize,
        }
        impl Operation<u32, BoomError> for RecordingOp {
            fn consistency(&self) -> Consistency {
                self.level
            }
            fn set_consistency(&mut self, level: Consistency) {
                self.level = level;
            }
            fn call<'c>(&'c mut self, _conn: &'c mut Connection) -> BoxFuture<'c, Result<u32, BoomError>> {
                self.levels_seen.lock().unwrap().push(self.level);
                async move {
                    if self.failures_left > 0 {
                        self.failures_left -= 1;
                        Err(BoomError("unavailable"))
                    } else {
                        Ok(7)
                    }
                }
                .boxed()
            }
        }

        let levels_seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut op = RecordingOp {
            levels_seen: levels_seen.clone(),
            level: Consistency::All,
            failures_left: 1,
        };

        let result = executor
            .execute(&cluster, &policy, &monitor, &classifier, &mut op)
            .await;

        assert_eq!(result.unwrap(), 7);
        let levels = levels_seen.lock().unwrap();
        assert_eq!(levels[0], Consistency::All);
        assert_eq!(levels[1], Consistency::Quorum);
    }

    #[tokio::test]
    async fn attempt_count_never_exceeds_retry_budget_plus_one() {
        let cluster = four_host_cluster().await;
        let policy = FailoverPolicy::TryOneNext;
        let monitor = CountingMonitor::default();
        let classifier = Classifier;
        let executor = Executor::new();

        let calls = Arc::new(AtomicUsize::new(0));
        struct CountingOp {
            calls: Arc<AtomicUsize>,
        }
        impl Operation<u32, BoomError> for CountingOp {
            fn consistency(&self) -> Consistency {
                Consistency::One
            }
            fn set_consistency(&mut self, _level: Consistency) {}
            fn call<'c>(&'c mut self, _conn: &'c mut Connection) -> BoxFuture<'c, Result<u32, BoomError>> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                async move { Err(BoomError("timeout")) }.boxed()
            }
        }
        let mut op = CountingOp { calls: calls.clone() };

        let _ = executor
            .execute(&cluster, &policy, &monitor, &classifier, &mut op)
            .await;

        assert!(calls.load(Ordering::SeqCst) <= policy.num_retries() as usize + 1);
    }
}
