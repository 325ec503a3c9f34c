//! pki integration test harness.
//!
//! Coordinator and nodes run in-process over loopback with throwaway
//! certificates. Each test owns its coordinator and nodes; dropping them
//! aborts their tasks.
//!
//!   cargo test --test integration

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use pki_core::{Announcement, Category, RegistrationMessage, RegistrationStatus};
use pki_services::{
    node, tls, BroadcastInbox, Broadcaster, Credentials, EpochDirectory, EpochPhase, EpochTiming,
    RegistrationListener, RetryPolicy, Scheduler, SharedDirectory,
};

mod broadcast;

// ── Identities ────────────────────────────────────────────────────────────────

/// Self-signed certificate valid for 127.0.0.1 and localhost.
#[derive(Clone)]
pub struct Identity {
    pub cert_pem: String,
    pub key_pem: String,
}

impl Identity {
    pub fn generate() -> Self {
        let cert =
            rcgen::generate_simple_self_signed(vec!["127.0.0.1".into(), "localhost".into()])
                .expect("certificate generation");
        Self {
            cert_pem: cert.cert.pem(),
            key_pem: cert.signing_key.serialize_pem(),
        }
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::from_pem(self.cert_pem.as_bytes(), self.key_pem.as_bytes())
            .expect("generated credentials parse")
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 20,
        retry_delay: Duration::from_millis(20),
        dial_timeout: Duration::from_millis(500),
    }
}

pub fn timing(mix_ms: u64, client_ms: u64, steady_ms: u64) -> EpochTiming {
    EpochTiming {
        mix_window: Duration::from_millis(mix_ms),
        client_window: Duration::from_millis(client_ms),
        steady_window: Duration::from_millis(steady_ms),
    }
}

/// A running coordinator: listener and scheduler tasks plus handles to
/// observe and drive them.
pub struct Coordinator {
    pub addr: String,
    pub identity: Identity,
    pub directory: SharedDirectory,
    pub phases: watch::Receiver<EpochPhase>,
    start: Option<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Coordinator {
    pub async fn spawn(timing: EpochTiming, policy: RetryPolicy) -> Result<Self> {
        let identity = Identity::generate();
        let directory = EpochDirectory::shared();

        let acceptor = tls::acceptor(identity.credentials())?;
        let listener = RegistrationListener::bind(
            "127.0.0.1:0".parse()?,
            acceptor,
            directory.clone(),
        )?;
        let addr = listener.local_addr()?.to_string();

        let scheduler = Scheduler::new(directory.clone(), Broadcaster::new(policy), timing);
        let phases = scheduler.phases();
        let (start, start_rx) = oneshot::channel();

        let tasks = vec![
            tokio::spawn(async move {
                let _ = listener.run().await;
            }),
            tokio::spawn(scheduler.run(start_rx)),
        ];

        Ok(Self {
            addr,
            identity,
            directory,
            phases,
            start: Some(start),
            tasks,
        })
    }

    /// Fire the operator start signal.
    pub fn start(&mut self) {
        if let Some(start) = self.start.take() {
            let _ = start.send(());
        }
    }

    /// Wait until the scheduler reaches `phase`, failing after `secs`.
    pub async fn wait_for_phase(&mut self, phase: EpochPhase, secs: u64) -> Result<()> {
        tokio::time::timeout(
            Duration::from_secs(secs),
            self.phases.wait_for(|p| *p == phase),
        )
        .await
        .with_context(|| format!("timed out waiting for {phase:?}"))?
        .context("scheduler gone")?;
        Ok(())
    }

    /// Wait until the scheduler is anywhere in `epoch`.
    pub async fn wait_for_epoch(&mut self, epoch: u64, secs: u64) -> Result<()> {
        tokio::time::timeout(
            Duration::from_secs(secs),
            self.phases.wait_for(|p| p.epoch() >= Some(epoch)),
        )
        .await
        .with_context(|| format!("timed out waiting for epoch {epoch}"))?
        .context("scheduler gone")?;
        Ok(())
    }

    /// Send one raw line over TLS and return the reply line.
    pub async fn send_raw(&self, line: &str) -> Result<String> {
        let connector = tls::pinned_connector(self.identity.cert_pem.as_bytes())?;
        let tcp = TcpStream::connect(&self.addr).await?;
        let mut stream = connector.connect(tls::server_name(&self.addr)?, tcp).await?;
        stream.write_all(line.as_bytes()).await?;
        stream.flush().await?;

        let mut reply = String::new();
        BufReader::new(stream).read_line(&mut reply).await?;
        Ok(reply)
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

// ── Nodes ─────────────────────────────────────────────────────────────────────

/// An evaluated node: its identity, a contact address with a running
/// broadcast inbox, and everything it received so far.
pub struct TestNode {
    pub name: String,
    pub category: Category,
    pub identity: Identity,
    pub contact_addr: String,
    pub public_key: [u8; 32],
    received: mpsc::UnboundedReceiver<Announcement>,
    task: JoinHandle<()>,
}

impl TestNode {
    pub async fn spawn(name: &str, category: Category) -> Result<Self> {
        let identity = Identity::generate();
        let inbox = BroadcastInbox::bind("127.0.0.1:0", identity.credentials()).await?;
        let contact_addr = inbox.local_addr()?.to_string();

        let (tx, received) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                match inbox.recv().await {
                    Ok(announcement) => {
                        if tx.send(announcement).is_err() {
                            return;
                        }
                    }
                    Err(e) => eprintln!("inbox error: {e:#}"),
                }
            }
        });

        let mut public_key = [0u8; 32];
        for (i, b) in name.bytes().enumerate() {
            public_key[i % 32] ^= b;
        }

        Ok(Self {
            name: name.to_string(),
            category,
            identity,
            contact_addr,
            public_key,
            received,
            task,
        })
    }

    pub fn message(&self) -> RegistrationMessage {
        RegistrationMessage {
            category: self.category as u8,
            name: self.name.clone(),
            public_addr: format!("{}.eval:33000", self.name),
            public_key: hex::encode(self.public_key),
            public_cert: self.identity.cert_pem.clone(),
            contact_addr: self.contact_addr.clone(),
            contact_cert: self.identity.cert_pem.clone(),
        }
    }

    pub async fn register(&self, coordinator: &Coordinator) -> Result<RegistrationStatus> {
        self.register_with(coordinator, &self.message()).await
    }

    pub async fn register_with(
        &self,
        coordinator: &Coordinator,
        msg: &RegistrationMessage,
    ) -> Result<RegistrationStatus> {
        node::register(
            &coordinator.addr,
            coordinator.identity.cert_pem.as_bytes(),
            msg,
        )
        .await
    }

    /// Next broadcast this node received, failing after `secs`.
    pub async fn next_announcement(&mut self, secs: u64) -> Result<Announcement> {
        tokio::time::timeout(Duration::from_secs(secs), self.received.recv())
            .await
            .with_context(|| format!("{} received nothing", self.name))?
            .context("inbox task gone")
    }

    /// Whether anything arrived without waiting.
    pub fn try_announcement(&mut self) -> Option<Announcement> {
        self.received.try_recv().ok()
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Names listed in an announcement.
pub fn names(announcement: &Announcement) -> Vec<String> {
    announcement.nodes().iter().map(|n| n.name.clone()).collect()
}
