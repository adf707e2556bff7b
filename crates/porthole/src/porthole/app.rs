use anyhow::Context;

use crate::porthole::{config, logging, tunnel};

pub async fn run(local_port: Option<String>) -> anyhow::Result<()> {
    let cfg = config::load(local_port.as_deref())?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt; // keep alive

    let tun = tunnel::Tunnel::new(tunnel::TunnelOptions::from(&cfg));

    let info = match tun.start().await {
        Ok(info) => info,
        Err(err) => {
            tracing::error!(err = %err, "porthole: failed to start tunnel");
            return Err(err).context("start tunnel");
        }
    };

    tracing::info!("tunnel created successfully");
    tracing::info!(
        local = %format!("localhost:{}", info.local_port),
        "tunnel: local server"
    );
    tracing::info!(
        public = %info.public_endpoint(),
        "tunnel: public endpoint"
    );

    shutdown_signal().await?;
    tracing::info!(
        live = tun.live_connections(),
        local_port = tun.local_port(),
        public_port = ?tun.public_port(),
        "shutdown: signal"
    );

    tun.stop().await;
    tracing::info!(state = ?tun.state(), "tunnel stopped");

    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    // Ctrl-C works cross-platform.
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).context("install SIGTERM handler")?;

        tokio::select! {
            res = tokio::signal::ctrl_c() => res.context("wait for ctrl-c")?,
            _ = term.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    }

    Ok(())
}
