//! ubus-master — message bus discovery broker.
//!
//! Usage: ubus-master [bind_ip] [port]

use anyhow::{Context, Result};

use ubus_core::config::UbusConfig;
use ubus_master::Master;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = UbusConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = UbusConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        UbusConfig::default()
    });

    let mut args = std::env::args().skip(1);
    if let Some(ip) = args.next() {
        config.master.bind_ip = ip;
    }
    if let Some(port) = args.next() {
        config.master.port = port
            .parse()
            .with_context(|| format!("invalid port: {port}"))?;
    }
    tracing::info!(
        bind_ip = %config.master.bind_ip,
        port = config.master.port,
        "ubus-master starting"
    );

    let master = Master::bind(config.master).await?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    master.run(shutdown_rx).await
}
