//! Epoch scheduler — the coordinator's control loop.
//!
//! ```text
//! AwaitingStart ──start──▶ MixRegistration ──W1──▶ ClientRegistration ──W2──▶ Steady ──W3──▶ Reset ─┐
//!                                ▲                                                                │
//!                                └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Gate closing and the following broadcast happen back to back on window
//! expiry. Each window is its own one-shot timer.

use std::time::Duration;

use tokio::sync::{oneshot, watch};

use pki_core::config::EpochConfig;
use pki_core::{Category, SnapshotKind};

use crate::broadcast::{BroadcastReport, Broadcaster};
use crate::registry::SharedDirectory;

/// Where the scheduler currently is. Epochs are numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochPhase {
    AwaitingStart,
    MixRegistration { epoch: u64 },
    ClientRegistration { epoch: u64 },
    Steady { epoch: u64 },
    Reset { epoch: u64 },
}

impl EpochPhase {
    pub fn epoch(self) -> Option<u64> {
        match self {
            Self::AwaitingStart => None,
            Self::MixRegistration { epoch }
            | Self::ClientRegistration { epoch }
            | Self::Steady { epoch }
            | Self::Reset { epoch } => Some(epoch),
        }
    }
}

/// Window lengths for one epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpochTiming {
    pub mix_window: Duration,
    pub client_window: Duration,
    pub steady_window: Duration,
}

impl From<&EpochConfig> for EpochTiming {
    fn from(config: &EpochConfig) -> Self {
        Self {
            mix_window: config.mix_window(),
            client_window: config.client_window(),
            steady_window: config.steady_window(),
        }
    }
}

/// What happened during one epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpochReport {
    pub epoch: u64,
    pub mixes: usize,
    pub clients: usize,
    pub mix_set: BroadcastReport,
    pub client_set: BroadcastReport,
    pub rotation: BroadcastReport,
}

pub struct Scheduler {
    directory: SharedDirectory,
    broadcaster: Broadcaster,
    timing: EpochTiming,
    phase: watch::Sender<EpochPhase>,
}

impl Scheduler {
    pub fn new(directory: SharedDirectory, broadcaster: Broadcaster, timing: EpochTiming) -> Self {
        let (phase, _) = watch::channel(EpochPhase::AwaitingStart);
        Self {
            directory,
            broadcaster,
            timing,
            phase,
        }
    }

    /// Observe phase changes.
    pub fn phases(&self) -> watch::Receiver<EpochPhase> {
        self.phase.subscribe()
    }

    /// Wait for the start signal, then run epochs forever.
    ///
    /// Returns only if the start sender is dropped without firing.
    pub async fn run(self, start: oneshot::Receiver<()>) {
        tracing::info!("waiting for start signal");
        if start.await.is_err() {
            tracing::warn!("start signal dropped, scheduler not starting");
            return;
        }
        tracing::info!("start signal received");

        let mut epoch = 1;
        loop {
            self.run_epoch(epoch).await;
            epoch += 1;
        }
    }

    /// Drive one full epoch: both registration windows, the steady hold and
    /// the reset.
    pub async fn run_epoch(&self, epoch: u64) -> EpochReport {
        let registry = self.directory.current();

        self.enter(EpochPhase::MixRegistration { epoch });
        tracing::info!(epoch, "mixes and clients can register now");
        tokio::time::sleep(self.timing.mix_window).await;

        registry.close(Category::Mix).await;
        let mixes = registry.count(Category::Mix).await;
        tracing::info!(epoch, mixes, "mix registration closed");
        let mix_set = self.broadcaster.broadcast(&registry, SnapshotKind::MixSet).await;

        self.enter(EpochPhase::ClientRegistration { epoch });
        tokio::time::sleep(self.timing.client_window).await;

        registry.close(Category::Client).await;
        let clients = registry.count(Category::Client).await;
        tracing::info!(epoch, clients, "client registration closed");
        let client_set = self
            .broadcaster
            .broadcast(&registry, SnapshotKind::ClientSet)
            .await;

        self.enter(EpochPhase::Steady { epoch });
        tokio::time::sleep(self.timing.steady_window).await;

        tracing::info!(epoch, "epoch closing");
        let rotation = self
            .broadcaster
            .broadcast(&registry, SnapshotKind::EpochRotate)
            .await;

        self.enter(EpochPhase::Reset { epoch });
        self.directory.rotate().await;
        tracing::info!(epoch, "registry reset");

        EpochReport {
            epoch,
            mixes,
            clients,
            mix_set,
            client_set,
            rotation,
        }
    }

    fn enter(&self, phase: EpochPhase) {
        tracing::debug!(?phase, "phase change");
        self.phase.send_replace(phase);
    }
}
