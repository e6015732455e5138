//! A client-side connection pool and failover executor for a distributed,
//! multi-node data store accessed over a request/response RPC protocol.
//!
//! The crate maintains a bounded pool of reusable connections per host,
//! selects a host for each operation under a load-balancing policy, retries
//! failed operations on other hosts under a configurable [`FailoverPolicy`],
//! and moves hosts in and out of service through a periodic background
//! health probe.
//!
//! This crate does not know how to build RPC requests or decode wire
//! formats; it is handed an opened [`RpcChannel`] by a [`TransportFactory`]
//! and an [`ErrorClassifier`] to tell recoverable errors apart from
//! application-level ones. Those collaborators, along with request-building
//! DSLs and metric export, live above this crate.
#![deny(missing_debug_implementations)]

mod cluster;
mod connection;
mod error;
mod executor;
mod host;
mod monitor;
mod policy;
mod pool;
pub mod timestamp;
mod transport;

pub use cluster::{Cluster, ClusterBuilder, ClusterPool};
pub use connection::Connection;
pub use error::{ClassifiedKind, ExecuteError, PoolError};
pub use executor::{Executor, Operation};
pub use host::{Host, HostConfig};
pub use monitor::{Counter, Monitor, NopMonitor};
pub use policy::{Consistency, FailoverPolicy};
pub use pool::{PerHostPool, PoolStats};
pub use timestamp::{create_timestamp, Resolution};
pub use transport::{ErrorClassifier, RpcChannel, TransportError, TransportFactory};
