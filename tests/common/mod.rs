//! Shared mock collaborators for the integration tests: a fake transport
//! and a fake error classifier, standing in for the real RPC channel and
//! exception-translation layers this crate leaves to its caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use cluster_pool::{ClassifiedKind, ErrorClassifier, Host, RpcChannel, TransportError, TransportFactory};

static TRACING_INIT: Once = Once::new();

/// Installs a `tracing` subscriber for the test binary, once. Safe to call
/// at the top of every test; later calls are no-ops. Set `RUST_LOG` to see
/// output (suppressed by default by `libtest`'s output capture unless a
/// test fails).
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Debug)]
pub struct MockChannel {
    pub healthy: bool,
}

#[async_trait]
impl RpcChannel for MockChannel {
    async fn ping(&mut self) -> Result<(), TransportError> {
        if self.healthy {
            Ok(())
        } else {
            Err(TransportError::ChannelFailed {
                host: Host::new("mock", 0),
                source: "probe failed".into(),
            })
        }
    }

    async fn close(&mut self) {}
}

/// A transport whose per-host behavior (always succeed, always fail, or
/// fail the first `n` attempts) is configured independently per host, so a
/// single factory can drive multi-host scenarios such as "every host but
/// the last is broken".
#[derive(Debug, Default)]
pub struct MockTransport {
    fail_first: Mutex<HashMap<Host, usize>>,
    always_fail: Mutex<std::collections::HashSet<Host>>,
    opens: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_first_n(&self, host: &Host, n: usize) {
        self.fail_first.lock().unwrap().insert(host.clone(), n);
    }

    pub fn always_fail(&self, host: &Host) {
        self.always_fail.lock().unwrap().insert(host.clone());
    }

    pub fn total_opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MockTransport {
    async fn open(&self, host: &Host, _timeout: Duration) -> Result<Box<dyn RpcChannel>, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);

        if self.always_fail.lock().unwrap().contains(host) {
            return Err(TransportError::ConnectFailed {
                host: host.clone(),
                source: "host permanently down".into(),
            });
        }

        let mut guard = self.fail_first.lock().unwrap();
        if let Some(remaining) = guard.get_mut(host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(TransportError::ConnectFailed {
                    host: host.clone(),
                    source: "simulated transient failure".into(),
                });
            }
        }
        Ok(Box::new(MockChannel { healthy: true }))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("mock rpc error: {kind}")]
pub struct MockRpcError {
    pub kind: &'static str,
}

pub struct MockClassifier;

impl ErrorClassifier<MockRpcError> for MockClassifier {
    fn classify(&self, err: &MockRpcError) -> ClassifiedKind {
        match err.kind {
            "timeout" => ClassifiedKind::Timeout,
            "unavailable" => ClassifiedKind::Unavailable,
            "application" => ClassifiedKind::Application,
            _ => ClassifiedKind::Transport,
        }
    }
}
