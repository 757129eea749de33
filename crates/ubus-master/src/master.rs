//! Master — binds the control port and runs the broker's loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use ubus_core::config::MasterConfig;

use crate::accept::Acceptor;
use crate::control_loop::ControlLoop;
use crate::registry::Registry;
use crate::watchdog::watchdog_loop;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5);
const JOIN_QUEUE_DEPTH: usize = 256;

pub struct Master {
    listener: TcpListener,
    registry: Arc<Registry>,
    config: MasterConfig,
}

impl Master {
    pub async fn bind(config: MasterConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_ip, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("failed to bind control port {addr}"))?;
        let registry = Arc::new(Registry::new(config.api_version.clone()));
        Ok(Self {
            listener,
            registry,
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Run until `shutdown` fires.
    pub async fn run(self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        let Master {
            listener,
            registry,
            config,
        } = self;
        tracing::info!(
            addr = %listener.local_addr()?,
            api_version = %config.api_version,
            "master listening"
        );

        let (joined_tx, joined_rx) = mpsc::channel(JOIN_QUEUE_DEPTH);
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();

        let acceptor = Acceptor::new(
            listener,
            registry.clone(),
            joined_tx,
            config.frame_timeout(),
            config.max_frame_bytes,
            shutdown.resubscribe(),
        );
        let control = ControlLoop::new(
            registry.clone(),
            joined_rx,
            dead_rx,
            config.tick(),
            config.frame_timeout(),
            config.max_frame_bytes,
            shutdown.resubscribe(),
        );

        let acceptor_task = tokio::spawn(acceptor.run());
        let control_task = tokio::spawn(control.run());
        let watchdog_task = tokio::spawn(watchdog_loop(
            registry.clone(),
            config.keep_alive_interval(),
            config.watchdog_threshold,
            dead_tx,
            shutdown.resubscribe(),
        ));
        let snapshot_task = tokio::spawn(snapshot_loop(registry, shutdown));

        let (acceptor, control, watchdog, snapshot) =
            tokio::join!(acceptor_task, control_task, watchdog_task, snapshot_task);
        if let Err(e) = acceptor.context("acceptor panicked")? {
            tracing::error!(error = %e, "acceptor failed");
        }
        if let Err(e) = control.context("control loop panicked")? {
            tracing::error!(error = %e, "control loop failed");
        }
        watchdog.context("watchdog panicked")?;
        snapshot.context("snapshot task panicked")?;

        tracing::info!("master stopped");
        Ok(())
    }
}

async fn snapshot_loop(registry: Arc<Registry>, mut shutdown: broadcast::Receiver<()>) {
    let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = interval.tick() => {
                tracing::info!(
                    participants = registry.participant_count(),
                    events = registry.event_count(),
                    methods = registry.method_count(),
                    "registry snapshot"
                );
            }
        }
    }
}
