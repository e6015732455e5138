//! Host identity and per-host tunables.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identity of one server instance: `(address, port)`.
///
/// Immutable and cheap to clone (the address is `Arc`-shared), so it can be
/// used freely as a `HashMap` key and moved into spawned tasks. Two `Host`s
/// are equal iff their address and port match.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Host {
    address: Arc<str>,
    port: u16,
}

impl Host {
    /// Constructs a `Host` from an address and port directly.
    pub fn new(address: impl Into<Arc<str>>, port: u16) -> Self {
        Host {
            address: address.into(),
            port,
        }
    }

    /// Parses a combined `"address:port"` string, splitting on the *last*
    /// `:` so that bracket-free IPv6-style addresses containing colons are
    /// still handled reasonably.
    ///
    /// Returns `None` if there is no `:` in the string or the suffix after
    /// the last `:` is not a valid port number.
    pub fn parse(spec: &str) -> Option<Self> {
        let idx = spec.rfind(':')?;
        let (address, port) = spec.split_at(idx);
        let port: u16 = port[1..].parse().ok()?;
        if address.is_empty() {
            return None;
        }
        Some(Host::new(address, port))
    }

    /// The host's address (hostname or IP literal).
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The host's RPC port.
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Per-host tunables: pool sizing and timeouts.
///
/// Kept separate from [`Host`] the way the teacher pool separates its
/// `Builder<M>` tunables from the connection manager's identity — a `Host`
/// is a map key and should stay cheap and purely identity-based, while
/// `HostConfig` carries the behavior knobs.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Maximum number of simultaneously open connections to this host.
    pub max_active: u32,
    /// Idle connections above this count are closed on release rather than
    /// kept warm.
    pub max_idle: u32,
    /// How long `borrow` waits for a connection to become available before
    /// failing with `PoolError::Exhausted`.
    pub borrow_timeout: Duration,
    /// Socket-level timeout applied to the underlying RPC channel.
    pub socket_timeout: Duration,
    /// Whether the RPC channel should use a framed transport.
    pub framed: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            max_active: 8,
            max_idle: 8,
            borrow_timeout: Duration::from_millis(1_000),
            socket_timeout: Duration::from_millis(5_000),
            framed: true,
        }
    }
}
