//! pkid — epoch directory for mix-network evaluation runs.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::sync::oneshot;

use pki_core::config::PkiConfig;
use pki_services::{
    Broadcaster, Credentials, EpochDirectory, EpochTiming, RegistrationListener, RetryPolicy,
    Scheduler,
};

mod control;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = PkiConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = PkiConfig::load().context("failed to load config")?;
    tracing::info!(
        listen = %config.listen.addr,
        tick_ms = config.epoch.tick_ms,
        max_attempts = config.broadcast.max_attempts,
        "pkid starting"
    );

    // Credentials and listener. Either failing is fatal.
    let credentials = Credentials::load(&config.tls.cert_path, &config.tls.key_path)
        .context("failed to load TLS credentials")?;
    let acceptor = pki_services::tls::acceptor(credentials)?;

    let listen_addr = resolve(&config.listen.addr).await?;
    let directory = EpochDirectory::shared();
    let listener = RegistrationListener::bind(listen_addr, acceptor, directory.clone())?
        .with_read_timeout(config.listen.read_timeout());

    let scheduler = Scheduler::new(
        directory,
        Broadcaster::new(RetryPolicy::from(&config.broadcast)),
        EpochTiming::from(&config.epoch),
    );

    // ── Start signal ─────────────────────────────────────────────────────────
    let (start_tx, start_rx) = oneshot::channel();
    control::spawn_start_trigger(config.control.autostart, start_tx)?;

    // ── Spawn tasks ──────────────────────────────────────────────────────────
    let listener_task = tokio::spawn(listener.run());
    let scheduler_task = tokio::spawn(scheduler.run(start_rx));

    // ── Wait for exit ────────────────────────────────────────────────────────
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("shutting down"),
        r = listener_task => {
            tracing::error!("registration listener exited: {:?}", r);
            anyhow::bail!("registration listener exited");
        }
        r = scheduler_task => tracing::error!("scheduler exited: {:?}", r),
    }

    Ok(())
}

async fn resolve(addr: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(addr)
        .await
        .with_context(|| format!("failed to resolve listen address {addr}"))?
        .next()
        .with_context(|| format!("listen address {addr} resolved to nothing"))
}
