//! Operator start trigger.
//!
//! The scheduler waits for a single start signal before the first epoch.
//! With `control.autostart` it fires right away; otherwise the operator
//! sends SIGUSR1 once every node is provisioned.

use anyhow::Result;
use tokio::sync::oneshot;

pub fn spawn_start_trigger(autostart: bool, start: oneshot::Sender<()>) -> Result<()> {
    if autostart {
        tracing::info!("autostart enabled, starting first epoch");
        let _ = start.send(());
        return Ok(());
    }

    #[cfg(unix)]
    {
        use anyhow::Context;
        use tokio::signal::unix::{signal, SignalKind};

        let mut usr1 = signal(SignalKind::user_defined1()).context("failed to install SIGUSR1 handler")?;
        tracing::info!(pid = std::process::id(), "send SIGUSR1 to start the first epoch");
        tokio::spawn(async move {
            if usr1.recv().await.is_some() {
                let _ = start.send(());
            }
        });
        Ok(())
    }

    #[cfg(not(unix))]
    {
        drop(start);
        anyhow::bail!("no start trigger on this platform; set control.autostart = true")
    }
}
