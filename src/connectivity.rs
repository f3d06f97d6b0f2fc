// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication endpoint reachability.
//!
//! Before any networked action the engine probes the endpoint's TCP port.
//! Results are memoized per cycle in a [`ConnectivityGate`]: one host is
//! probed at most once per cycle no matter how many edges point at it, and
//! an unreachable host skips only the edges that need it.
//!
//! A probe makes a bounded number of connect attempts with a fixed wait in
//! between; the wait is tuned for flaky links coming back mid-cycle, not
//! for hosts that are down. Hostless (local) edges always pass.

use crate::command::BoxFuture;
use crate::error::{EngineError, Result};
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, warn};

/// Connect attempts per probe.
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Wait between connect attempts.
pub const DEFAULT_CONNECT_RETRY_WAIT: Duration = Duration::from_secs(3);

/// Per-attempt connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Trait defining a single reachability probe.
pub trait Prober: Send + Sync + 'static {
    /// Attempt one connection; resolves Ok when the endpoint accepted.
    fn probe(&self, host: String, port: u16) -> BoxFuture<'_, ()>;
}

impl<P: Prober> Prober for std::sync::Arc<P> {
    fn probe(&self, host: String, port: u16) -> BoxFuture<'_, ()> {
        (**self).probe(host, port)
    }
}

/// TCP-connect prober with a per-attempt timeout.
#[derive(Debug, Clone)]
pub struct TcpProber {
    timeout: Duration,
}

impl Default for TcpProber {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl TcpProber {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Prober for TcpProber {
    fn probe(&self, host: String, port: u16) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let connect = tokio::net::TcpStream::connect((host.as_str(), port));
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(_stream)) => Ok(()),
                Ok(Err(e)) => Err(EngineError::Unreachable {
                    host,
                    port,
                    message: e.to_string(),
                }),
                Err(_) => Err(EngineError::Unreachable {
                    host,
                    port,
                    message: format!("connect timed out after {:?}", self.timeout),
                }),
            }
        })
    }
}

/// Scripted prober for tests and dry runs: hosts are reachable unless
/// marked otherwise.
#[derive(Default)]
pub struct ScriptedProber {
    unreachable: Mutex<HashSet<String>>,
    probed: Mutex<Vec<(String, u16)>>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unreachable(&self, host: impl Into<String>) {
        self.unreachable
            .lock()
            .expect("unreachable lock")
            .insert(host.into());
    }

    pub fn mark_reachable(&self, host: &str) {
        self.unreachable
            .lock()
            .expect("unreachable lock")
            .remove(host);
    }

    /// Every probe issued so far, in order.
    pub fn probed(&self) -> Vec<(String, u16)> {
        self.probed.lock().expect("probed lock").clone()
    }
}

impl Prober for ScriptedProber {
    fn probe(&self, host: String, port: u16) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.probed
                .lock()
                .expect("probed lock")
                .push((host.clone(), port));
            if self
                .unreachable
                .lock()
                .expect("unreachable lock")
                .contains(&host)
            {
                Err(EngineError::Unreachable {
                    host,
                    port,
                    message: "scripted as unreachable".to_string(),
                })
            } else {
                Ok(())
            }
        })
    }
}

/// Per-cycle reachability memo over a [`Prober`].
pub struct ConnectivityGate<P: Prober> {
    prober: P,
    attempts: u32,
    retry_wait: Duration,
    reachable: HashSet<(String, u16)>,
    unreachable: HashSet<(String, u16)>,
}

impl<P: Prober> ConnectivityGate<P> {
    pub fn new(prober: P) -> Self {
        Self::with_policy(prober, DEFAULT_CONNECT_ATTEMPTS, DEFAULT_CONNECT_RETRY_WAIT)
    }

    pub fn with_policy(prober: P, attempts: u32, retry_wait: Duration) -> Self {
        Self {
            prober,
            attempts: attempts.max(1),
            retry_wait,
            reachable: HashSet::new(),
            unreachable: HashSet::new(),
        }
    }

    /// Forget the memo; call at the start of each cycle.
    pub fn begin_cycle(&mut self) {
        self.reachable.clear();
        self.unreachable.clear();
    }

    /// Whether actions needing this endpoint should be skipped this cycle.
    ///
    /// An empty host means a local edge and never skips.
    pub async fn should_skip(&mut self, host: &str, port: u16) -> bool {
        if host.is_empty() {
            return false;
        }
        let key = (host.to_string(), port);
        if self.reachable.contains(&key) {
            return false;
        }
        if self.unreachable.contains(&key) {
            return true;
        }

        for attempt in 1..=self.attempts {
            match self.prober.probe(host.to_string(), port).await {
                Ok(()) => {
                    debug!(host, port, attempt, "Endpoint reachable");
                    self.reachable.insert(key);
                    return false;
                }
                Err(e) if attempt < self.attempts => {
                    debug!(host, port, attempt, error = %e, "Connect attempt failed, retrying");
                    tokio::time::sleep(self.retry_wait).await;
                }
                Err(e) => {
                    warn!(host, port, error = %e, "Endpoint unreachable, skipping its edges this cycle");
                }
            }
        }
        self.unreachable.insert(key);
        true
    }
}
