//! Collaborator interfaces the executor and pool depend on: the RPC channel
//! factory and the raw-error classifier.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ClassifiedKind;
use crate::host::Host;

/// A channel-setup or channel-I/O failure from the RPC transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The channel could not be established within the configured timeout.
    #[error("connect to {host} timed out after {timeout:?}")]
    ConnectTimeout { host: Host, timeout: Duration },
    /// The channel failed to open for a reason other than a timeout.
    #[error("failed to connect to {host}: {source}")]
    ConnectFailed {
        host: Host,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// An already-open channel failed during use.
    #[error("channel to {host} failed: {source}")]
    ChannelFailed {
        host: Host,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TransportError {
    /// The host the failure occurred against.
    pub fn host(&self) -> &Host {
        match self {
            TransportError::ConnectTimeout { host, .. } => host,
            TransportError::ConnectFailed { host, .. } => host,
            TransportError::ChannelFailed { host, .. } => host,
        }
    }
}

/// A single open RPC channel to one host.
///
/// Object-safe so that a [`crate::Connection`] can hold it as
/// `Box<dyn RpcChannel>` without the pool becoming generic over a concrete
/// transport type.
#[async_trait]
pub trait RpcChannel: Send + fmt::Debug {
    /// Issues a single trivial RPC used by the health probe (e.g.
    /// "describe cluster name"). Returns an error if the channel is no
    /// longer usable.
    async fn ping(&mut self) -> Result<(), TransportError>;

    /// Tears down the channel. Idempotent.
    async fn close(&mut self);
}

/// Opens RPC channels to a [`Host`], honoring a connect timeout.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Establishes a new channel to `host`, failing with
    /// [`TransportError`] if it cannot be opened within `timeout`.
    async fn open(&self, host: &Host, timeout: Duration) -> Result<Box<dyn RpcChannel>, TransportError>;
}

/// Classifies a raw operation error into one of the four kinds the
/// executor's retry loop branches on.
pub trait ErrorClassifier<E>: Send + Sync {
    /// Classifies `err`. Implementations should inspect the error's
    /// concrete variant/payload rather than its `Display` text.
    fn classify(&self, err: &E) -> ClassifiedKind;
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A channel that always pings successfully.
    #[derive(Debug)]
    pub struct OkChannel;

    #[async_trait]
    impl RpcChannel for OkChannel {
        async fn ping(&mut self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn close(&mut self) {}
    }

    /// A [`TransportFactory`] that either always succeeds, always fails, or
    /// fails for the first `n` calls then succeeds — enough shapes to drive
    /// the pool and probe tests without a real socket.
    #[derive(Debug)]
    pub struct FlakyFactory {
        fail_first: AtomicUsize,
    }

    impl FlakyFactory {
        pub fn always_ok() -> Self {
            FlakyFactory {
                fail_first: AtomicUsize::new(0),
            }
        }

        pub fn always_fail() -> Self {
            FlakyFactory {
                fail_first: AtomicUsize::new(usize::MAX),
            }
        }

        pub fn fail_first_n(n: usize) -> Self {
            FlakyFactory {
                fail_first: AtomicUsize::new(n),
            }
        }
    }

    #[async_trait]
    impl TransportFactory for FlakyFactory {
        async fn open(&self, host: &Host, _timeout: Duration) -> Result<Box<dyn RpcChannel>, TransportError> {
            let remaining = self.fail_first.load(Ordering::SeqCst);
            if remaining > 0 {
                if remaining != usize::MAX {
                    self.fail_first.fetch_sub(1, Ordering::SeqCst);
                }
                return Err(TransportError::ConnectFailed {
                    host: host.clone(),
                    source: "simulated connect failure".into(),
                });
            }
            Ok(Box::new(OkChannel))
        }
    }
}
