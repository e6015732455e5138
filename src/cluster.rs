//! Registry of per-host pools, host selection, and the background health
//! probe loop.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::{ExecuteError, PoolError};
use crate::executor::{Executor, Operation};
use crate::host::{Host, HostConfig};
use crate::monitor::{Monitor, NopMonitor};
use crate::policy::FailoverPolicy;
use crate::pool::{PerHostPool, PoolStats};
use crate::transport::{ErrorClassifier, TransportError, TransportFactory};

const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_PROBE_COALESCE_WINDOW: Duration = Duration::from_millis(10_000);

struct ClusterState {
    live: HashMap<Host, PerHostPool>,
    down: HashMap<Host, PerHostPool>,
    /// Every pool ever created for a still-or-formerly-tracked host. A host
    /// removed via `remove_host` is dropped from `live`/`down` but its pool
    /// stays reachable here until its last outstanding connection is
    /// returned — see the crate's design note on detached pools.
    all: HashMap<Host, PerHostPool>,
    last_probe_finished: Option<Instant>,
}

impl ClusterState {
    fn new() -> Self {
        ClusterState {
            live: HashMap::new(),
            down: HashMap::new(),
            all: HashMap::new(),
            last_probe_finished: None,
        }
    }
}

struct ClusterPoolInner {
    transport: Arc<dyn TransportFactory>,
    default_config: HostConfig,
    state: Mutex<ClusterState>,
    probe_interval: Duration,
    probe_coalesce_window: Duration,
    probe_handle: Mutex<Option<JoinHandle<()>>>,
}

/// A registry of per-host pools, a least-active host selector, and a
/// periodic health probe that moves hosts between `live` and `down`.
#[derive(Clone)]
pub struct ClusterPool {
    inner: Arc<ClusterPoolInner>,
}

impl fmt::Debug for ClusterPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterPool").finish_non_exhaustive()
    }
}

impl ClusterPool {
    /// Builds an empty cluster pool with no probe loop started. Prefer
    /// [`ClusterBuilder`] to assemble a fully wired [`Cluster`] facade;
    /// construct a bare `ClusterPool` directly only when driving the pool
    /// and probe loop without the executor/policy layer.
    pub fn new(transport: Arc<dyn TransportFactory>, default_config: HostConfig) -> Self {
        ClusterPool {
            inner: Arc::new(ClusterPoolInner {
                transport,
                default_config,
                state: Mutex::new(ClusterState::new()),
                probe_interval: DEFAULT_PROBE_INTERVAL,
                probe_coalesce_window: DEFAULT_PROBE_COALESCE_WINDOW,
                probe_handle: Mutex::new(None),
            }),
        }
    }

    fn with_probe_timing(mut self, interval: Duration, coalesce_window: Duration) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_probe_timing must run before the pool is shared");
        inner.probe_interval = interval;
        inner.probe_coalesce_window = coalesce_window;
        self
    }

    /// Starts the background probe loop. Idempotent: a second call is a
    /// no-op while a probe task is already running.
    pub async fn start_probe(&self) {
        let mut handle = self.inner.probe_handle.lock().await;
        if handle.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        let interval = self.inner.probe_interval;
        *handle = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let pool = ClusterPool { inner };
                pool.probe_pass().await;
            }
        }));
    }

    /// Registers `host` with an empty pool if it is not already tracked
    /// (in either `live` or `down`). Idempotent.
    pub async fn add_host(&self, host: Host) {
        let mut state = self.inner.state.lock().await;
        if state.all.contains_key(&host) {
            return;
        }
        let pool = PerHostPool::new(
            host.clone(),
            self.inner.default_config.clone(),
            self.inner.transport.clone(),
        );
        state.all.insert(host.clone(), pool.clone());
        state.live.insert(host, pool);
    }

    /// Removes `host` from whichever of `live`/`down` holds it, destroying
    /// its idle connections immediately. Borrowed connections are marked
    /// stale on their owning pool's next release (see the crate's detached
    /// pool design note) rather than torn down in place.
    pub async fn remove_host(&self, host: &Host) {
        let mut state = self.inner.state.lock().await;
        let pool = state.live.remove(host).or_else(|| state.down.remove(host));
        let Some(pool) = pool else { return };
        drop(state);

        pool.invalidate_all().await;
        self.maybe_gc_detached(host).await;
    }

    async fn maybe_gc_detached(&self, host: &Host) {
        let mut state = self.inner.state.lock().await;
        if state.live.contains_key(host) || state.down.contains_key(host) {
            return;
        }
        let Some(pool) = state.all.get(host).cloned() else {
            return;
        };
        drop(state);
        let stats = pool.stats().await;
        if stats.num_active == 0 && stats.num_idle == 0 {
            let mut state = self.inner.state.lock().await;
            if !state.live.contains_key(host) && !state.down.contains_key(host) {
                state.all.remove(host);
            }
        }
    }

    /// All hosts tracked by the cluster, live or down.
    pub async fn known_hosts(&self) -> Vec<Host> {
        let state = self.inner.state.lock().await;
        state.all.keys().cloned().collect()
    }

    /// Hosts currently classified as down by the health probe.
    pub async fn down_hosts(&self) -> Vec<Host> {
        let state = self.inner.state.lock().await;
        state.down.keys().cloned().collect()
    }

    /// Hosts currently classified as live.
    pub async fn live_hosts(&self) -> Vec<Host> {
        let state = self.inner.state.lock().await;
        state.live.keys().cloned().collect()
    }

    /// Borrows a connection from the live host with the fewest active
    /// connections, ties broken by scan order.
    pub async fn borrow(&self) -> Result<Connection, PoolError> {
        self.borrow_least_active(&Default::default()).await.map(|(_, c)| c)
    }

    pub(crate) async fn borrow_least_active(
        &self,
        exclude: &std::collections::HashSet<Host>,
    ) -> Result<(Host, Connection), PoolError> {
        let candidates = {
            let state = self.inner.state.lock().await;
            state
                .live
                .iter()
                .filter(|(h, _)| !exclude.contains(h))
                .map(|(h, p)| (h.clone(), p.clone()))
                .collect::<Vec<_>>()
        };

        let mut best: Option<(Host, PerHostPool, u32)> = None;
        for (host, pool) in candidates {
            let stats = pool.stats().await;
            let better = match &best {
                None => true,
                Some((_, _, active)) => stats.num_active < *active,
            };
            if better {
                best = Some((host, pool, stats.num_active));
            }
        }

        let (host, pool, _) = best.ok_or(PoolError::NoLiveHosts)?;
        let conn = pool.borrow().await?;
        Ok((host, conn))
    }

    /// Borrows directly from `host`'s pool, registering it first (via
    /// [`ClusterPool::add_host`]) if it is not yet known.
    pub async fn borrow_host(&self, host: &Host) -> Result<Connection, PoolError> {
        if !self.known_hosts().await.contains(host) {
            self.add_host(host.clone()).await;
        }
        let pool = {
            let state = self.inner.state.lock().await;
            state.all.get(host).cloned()
        };
        match pool {
            Some(pool) => pool.borrow().await,
            None => Err(PoolError::Fatal(format!("host {host} vanished after add_host"))),
        }
    }

    /// Picks a random host from `hosts` and borrows from it; on failure,
    /// removes that host from the candidate list and retries with another.
    /// Fails only once the candidate list is exhausted.
    pub async fn borrow_from_list(&self, hosts: &[Host]) -> Result<Connection, PoolError> {
        let mut candidates: Vec<Host> = hosts.to_vec();
        let mut rng = rand::thread_rng();
        while !candidates.is_empty() {
            let idx = rng.gen_range(0..candidates.len());
            let host = candidates.remove(idx);
            match self.borrow_host(&host).await {
                Ok(conn) => return Ok(conn),
                Err(_) => continue,
            }
        }
        Err(PoolError::NoLiveHosts)
    }

    /// Routes `conn` to its owning per-host pool's `release`.
    pub async fn release(&self, conn: Connection) -> Result<(), PoolError> {
        let host = conn.host().clone();
        let pool = {
            let state = self.inner.state.lock().await;
            state.all.get(&host).cloned()
        };
        let result = match pool {
            Some(pool) => pool.release(conn).await,
            None => {
                tracing::error!(%host, "released a connection for an unknown host");
                Err(PoolError::Fatal(format!("released a connection for unknown host {host}")))
            }
        };
        self.maybe_gc_detached(&host).await;
        result
    }

    /// Routes `conn` to its owning per-host pool's `invalidate`.
    pub async fn invalidate(&self, conn: Connection) -> Result<(), PoolError> {
        let host = conn.host().clone();
        let pool = {
            let state = self.inner.state.lock().await;
            state.all.get(&host).cloned()
        };
        let result = match pool {
            Some(pool) => pool.invalidate(conn).await,
            None => {
                tracing::error!(%host, "invalidated a connection for an unknown host");
                Err(PoolError::Fatal(format!("invalidated a connection for unknown host {host}")))
            }
        };
        self.maybe_gc_detached(&host).await;
        result
    }

    /// Aggregated counters across every live per-host pool.
    pub async fn stats(&self) -> PoolStats {
        let pools = {
            let state = self.inner.state.lock().await;
            state.live.values().cloned().collect::<Vec<_>>()
        };
        let mut total = PoolStats::default();
        for pool in pools {
            let s = pool.stats().await;
            total.num_active += s.num_active;
            total.num_idle += s.num_idle;
            total.num_blocked += s.num_blocked;
        }
        total
    }

    /// Runs one probe pass: promotes `down` hosts that answer a trivial RPC
    /// back to `live`, and demotes `live` hosts that fail the same probe to
    /// `down`. Skipped if fewer than `probe_coalesce_window` has elapsed
    /// since the previous pass finished, to coalesce overlapping ticks.
    /// Never panics: a failure to probe a single host is logged and the
    /// pass continues.
    pub async fn probe_pass(&self) {
        {
            let state = self.inner.state.lock().await;
            if let Some(last) = state.last_probe_finished {
                if last.elapsed() < self.inner.probe_coalesce_window {
                    tracing::debug!("skipping probe pass; previous pass finished too recently");
                    return;
                }
            }
        }

        let down_snapshot = {
            let state = self.inner.state.lock().await;
            state.down.keys().cloned().collect::<Vec<_>>()
        };
        for host in down_snapshot {
            if self.probe_host(&host).await.is_ok() {
                let mut state = self.inner.state.lock().await;
                if let Some(pool) = state.down.remove(&host) {
                    tracing::info!(%host, "health probe succeeded; promoting host to live");
                    state.live.insert(host, pool);
                }
            }
        }

        let live_snapshot = {
            let state = self.inner.state.lock().await;
            state.live.keys().cloned().collect::<Vec<_>>()
        };
        for host in live_snapshot {
            if self.probe_host(&host).await.is_err() {
                let mut state = self.inner.state.lock().await;
                if let Some(pool) = state.live.remove(&host) {
                    tracing::warn!(%host, "health probe failed; demoting host to down");
                    state.down.insert(host, pool);
                }
            }
        }

        let mut state = self.inner.state.lock().await;
        state.last_probe_finished = Some(Instant::now());
    }

    /// A one-shot probe: open a fresh connection outside any pool and issue
    /// a single trivial RPC. Never borrows from the pool being judged.
    async fn probe_host(&self, host: &Host) -> Result<(), TransportError> {
        let mut channel = self
            .inner
            .transport
            .open(host, self.inner.default_config.socket_timeout)
            .await?;
        let result = channel.ping().await;
        channel.close().await;
        result
    }

    /// Stops the probe loop and destroys every tracked pool's connections.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.probe_handle.lock().await.take() {
            handle.abort();
        }
        let pools = {
            let mut state = self.inner.state.lock().await;
            let pools: Vec<_> = state.all.values().cloned().collect();
            state.live.clear();
            state.down.clear();
            state.all.clear();
            pools
        };
        for pool in pools {
            pool.invalidate_all().await;
        }
    }
}

/// Assembles a [`ClusterPool`], [`Executor`], [`FailoverPolicy`],
/// [`Monitor`] and [`ErrorClassifier`] into the single entry point
/// application code calls — the "Cluster facade" from this crate's
/// external interface design.
pub struct Cluster<E> {
    pool: ClusterPool,
    executor: Executor,
    policy: FailoverPolicy,
    monitor: Arc<dyn Monitor>,
    classifier: Arc<dyn ErrorClassifier<E>>,
}

impl<E> fmt::Debug for Cluster<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster").finish_non_exhaustive()
    }
}

impl<E: std::error::Error + 'static> Cluster<E> {
    /// Registers `host` with the underlying cluster pool.
    pub async fn add_host(&self, host: Host) {
        self.pool.add_host(host).await;
    }

    /// Removes `host` from the underlying cluster pool.
    pub async fn remove_host(&self, host: &Host) {
        self.pool.remove_host(host).await;
    }

    /// All hosts tracked by the cluster, live or down.
    pub async fn known_hosts(&self) -> Vec<Host> {
        self.pool.known_hosts().await
    }

    /// Hosts currently classified as down.
    pub async fn down_hosts(&self) -> Vec<Host> {
        self.pool.down_hosts().await
    }

    /// Produces an ordering token. See [`crate::timestamp::create_timestamp`].
    pub fn create_timestamp(&self, resolution: crate::timestamp::Resolution) -> i64 {
        crate::timestamp::create_timestamp(resolution)
    }

    /// Executes `op` under this cluster's configured [`FailoverPolicy`].
    pub async fn execute<T>(&self, op: &mut dyn Operation<T, E>) -> Result<T, ExecuteError<E>> {
        self.executor
            .execute(
                &self.pool,
                &self.policy,
                self.monitor.as_ref(),
                self.classifier.as_ref(),
                op,
            )
            .await
    }

    /// Stops the health probe and tears down every pool.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Direct access to the underlying pool registry, for callers that want
    /// `borrow`/`release`/`invalidate`/`stats` without going through the
    /// failover executor.
    pub fn pool(&self) -> &ClusterPool {
        &self.pool
    }
}

/// Builder for [`Cluster`], analogous in role to the teacher pool's
/// `Builder<M>`: collects tunables and collaborators, then assembles a
/// ready-to-use facade.
pub struct ClusterBuilder<E> {
    default_config: HostConfig,
    policy: FailoverPolicy,
    monitor: Arc<dyn Monitor>,
    classifier: Option<Arc<dyn ErrorClassifier<E>>>,
    probe_interval: Duration,
    probe_coalesce_window: Duration,
    start_probe: bool,
}

impl<E> fmt::Debug for ClusterBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterBuilder")
            .field("default_config", &self.default_config)
            .field("policy", &self.policy)
            .field("probe_interval", &self.probe_interval)
            .field("probe_coalesce_window", &self.probe_coalesce_window)
            .field("start_probe", &self.start_probe)
            .finish_non_exhaustive()
    }
}

impl<E: std::error::Error + 'static> ClusterBuilder<E> {
    /// A builder with the crate's defaults: `FailFast` policy, a no-op
    /// monitor, a 30s probe interval and a 10s coalescing window.
    pub fn new() -> Self {
        ClusterBuilder {
            default_config: HostConfig::default(),
            policy: FailoverPolicy::FailFast,
            monitor: Arc::new(NopMonitor),
            classifier: None,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_coalesce_window: DEFAULT_PROBE_COALESCE_WINDOW,
            start_probe: true,
        }
    }

    /// Sets the per-host pool tunables applied to every host added to the
    /// cluster.
    pub fn host_config(mut self, config: HostConfig) -> Self {
        self.default_config = config;
        self
    }

    /// Sets the failover policy.
    pub fn policy(mut self, policy: FailoverPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the diagnostic counter sink.
    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Sets the raw-error classifier. Required before `build`.
    pub fn classifier(mut self, classifier: Arc<dyn ErrorClassifier<E>>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Overrides the health probe's tick period and coalescing window.
    /// Intended for tests; production code should keep the 30s/10s
    /// defaults.
    pub fn probe_timing(mut self, interval: Duration, coalesce_window: Duration) -> Self {
        self.probe_interval = interval;
        self.probe_coalesce_window = coalesce_window;
        self
    }

    /// Disables the automatic `start_probe()` call in `build`. Tests that
    /// want to call `probe_pass()` deterministically should use this.
    pub fn without_probe_loop(mut self) -> Self {
        self.start_probe = false;
        self
    }

    /// Builds the `Cluster`, registers `hosts`, and starts the probe loop
    /// unless [`ClusterBuilder::without_probe_loop`] was called.
    pub async fn build(
        self,
        hosts: impl IntoIterator<Item = Host>,
        transport: Arc<dyn TransportFactory>,
    ) -> Cluster<E> {
        let classifier = self
            .classifier
            .expect("ClusterBuilder::classifier must be set before build()");

        let pool = ClusterPool::new(transport, self.default_config)
            .with_probe_timing(self.probe_interval, self.probe_coalesce_window);
        for host in hosts {
            pool.add_host(host).await;
        }
        if self.start_probe {
            pool.start_probe().await;
        }

        Cluster {
            pool,
            executor: Executor::new(),
            policy: self.policy,
            monitor: self.monitor,
            classifier,
        }
    }
}

impl<E: std::error::Error + 'static> Default for ClusterBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}
