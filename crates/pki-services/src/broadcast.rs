//! Broadcast engine — fan a membership snapshot out to every registered node.
//!
//! The snapshot is built under the registry's shared lock; the lock is gone
//! before the first dial. Each node gets its own task, its own pinned TLS
//! config and its own retry budget. `broadcast` returns only after every
//! task has finished.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::{self, JoinSet};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use pki_core::config::BroadcastConfig;
use pki_core::SnapshotKind;

use crate::registry::{ContactTarget, NodeRegistry};
use crate::tls;

/// Retry policy for one node.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub dial_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&BroadcastConfig::default())
    }
}

impl From<&BroadcastConfig> for RetryPolicy {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            dial_timeout: config.dial_timeout(),
        }
    }
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Names of nodes that received the line.
    pub delivered: Vec<String>,
    /// Names of nodes given up on.
    pub failed: Vec<String>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }
}

#[derive(Debug, Clone)]
pub struct Broadcaster {
    policy: RetryPolicy,
}

impl Broadcaster {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Send the `kind` snapshot of `registry` to every node in it.
    pub async fn broadcast(&self, registry: &NodeRegistry, kind: SnapshotKind) -> BroadcastReport {
        let snapshot = registry.snapshot(kind).await;
        let line = format!("{}\n", snapshot.line);

        tracing::info!(
            kind = %kind,
            recipients = snapshot.targets.len(),
            bytes = line.len(),
            "broadcasting"
        );

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for target in snapshot.targets {
            let line = line.clone();
            let policy = self.policy;
            let name = target.name.clone();
            let handle = tasks.spawn(async move {
                match deliver(&target, &line, policy).await {
                    Ok(attempts) => {
                        tracing::debug!(node = %target.name, attempts, "delivered");
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            node = %target.name,
                            addr = %target.contact_addr,
                            error = %e,
                            "giving up on node"
                        );
                        false
                    }
                }
            });
            names.insert(handle.id(), name);
        }

        let report = collect(tasks, names).await;
        tracing::info!(
            kind = %kind,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            "broadcast finished"
        );
        report
    }
}

/// Wait for every delivery task. A task that panicked counts as failed.
async fn collect(mut tasks: JoinSet<bool>, mut names: HashMap<task::Id, String>) -> BroadcastReport {
    let mut report = BroadcastReport::default();
    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, delivered)) => {
                let Some(name) = names.remove(&id) else { continue };
                if delivered {
                    report.delivered.push(name);
                } else {
                    report.failed.push(name);
                }
            }
            Err(e) => {
                let Some(name) = names.remove(&e.id()) else { continue };
                tracing::error!(node = %name, error = %e, "delivery task panicked");
                report.failed.push(name);
            }
        }
    }
    report.delivered.sort();
    report.failed.sort();
    report
}

/// Deliver `line` to one node. Returns the number of dial attempts used.
async fn deliver(target: &ContactTarget, line: &str, policy: RetryPolicy) -> Result<u32> {
    let connector = tls::pinned_connector(&target.contact_cert_pem)
        .context("cannot trust registered contact certificate")?;

    let mut attempt = 1;
    let mut stream = loop {
        match dial(&connector, &target.contact_addr, policy.dial_timeout).await {
            Ok(stream) => break stream,
            Err(e) if attempt < policy.max_attempts => {
                tracing::debug!(
                    node = %target.name,
                    addr = %target.contact_addr,
                    attempt,
                    error = %e,
                    "dial failed, retrying"
                );
                attempt += 1;
                tokio::time::sleep(policy.retry_delay).await;
            }
            Err(e) => {
                return Err(e.context(format!("dial failed after {attempt} attempts")));
            }
        }
    };

    stream
        .write_all(line.as_bytes())
        .await
        .context("failed to write broadcast")?;
    stream.flush().await.context("failed to flush broadcast")?;
    stream.shutdown().await.ok();
    Ok(attempt)
}

/// One attempt: TCP connect plus TLS handshake, bounded by `timeout`.
async fn dial(connector: &TlsConnector, addr: &str, timeout: Duration) -> Result<TlsStream<TcpStream>> {
    let server_name = tls::server_name(addr)?;
    let connect = async {
        let tcp = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connect to {addr}"))?;
        connector
            .connect(server_name, tcp)
            .await
            .with_context(|| format!("TLS handshake with {addr}"))
    };
    tokio::time::timeout(timeout, connect)
        .await
        .with_context(|| format!("dial {addr} timed out"))?
}
