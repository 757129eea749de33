//! ubus integration test harness.
//!
//! Every test starts its own master on 127.0.0.1 with an OS-assigned port
//! and short intervals, joins runtimes to it over loopback, and shuts
//! everything down at the end. Tests share nothing and may run in parallel.
//!
//!   cargo test --test integration

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use ubus_core::config::{MasterConfig, RuntimeConfig};
use ubus_core::control::{ControlDoc, Initiation, ResponseCode};
use ubus_core::message::{Message, MessageError};
use ubus_core::wire::{read_frame, write_frame, Frame, FrameType, API_VERSION, DEFAULT_MAX_FRAME};
use ubus_master::{Master, Registry};
use ubus_runtime::Runtime;

mod debug;
mod events;
mod membership;
mod methods;

// ── Harness ───────────────────────────────────────────────────────────────────

/// Keep-alive period used by test masters and runtimes.
pub const KEEP_ALIVE: Duration = Duration::from_millis(200);
/// Control loop and event loop tick.
pub const TICK: Duration = Duration::from_millis(20);

/// A string payload registered under the first user type id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestMessage1(pub String);

impl Message for TestMessage1 {
    const TYPE_ID: u32 = 11;

    fn serialize(&self) -> Vec<u8> {
        self.0.as_bytes().to_vec()
    }

    fn deserialize(data: &[u8]) -> Result<Self, MessageError> {
        std::str::from_utf8(data)
            .map(|s| TestMessage1(s.to_string()))
            .map_err(|_| MessageError::InvalidUtf8)
    }
}

/// A master running in the background of one test.
pub struct TestMaster {
    pub addr: SocketAddr,
    pub registry: Arc<Registry>,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestMaster {
    pub async fn start() -> Result<Self> {
        let config = MasterConfig {
            bind_ip: "127.0.0.1".into(),
            port: 0,
            keep_alive_interval_ms: KEEP_ALIVE.as_millis() as u64,
            tick_ms: TICK.as_millis() as u64,
            frame_timeout_ms: 2000,
            ..MasterConfig::default()
        };
        let master = Master::bind(config).await?;
        let addr = master.local_addr()?;
        let registry = master.registry();
        let (shutdown, rx) = broadcast::channel(1);
        let task = tokio::spawn(master.run(rx));
        Ok(Self {
            addr,
            registry,
            shutdown,
            task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Join a fresh runtime under `name`.
    pub async fn join(&self, name: &str) -> Result<Runtime> {
        let rt = test_runtime();
        rt.init(name, "127.0.0.1", self.port())
            .await
            .with_context(|| format!("{name} failed to join"))?;
        Ok(rt)
    }

    pub async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        self.task.await?
    }
}

pub fn test_runtime() -> Runtime {
    Runtime::new(RuntimeConfig {
        keep_alive_interval_ms: KEEP_ALIVE.as_millis() as u64,
        tick_ms: TICK.as_millis() as u64,
        request_timeout_ms: 2000,
        connect_timeout_ms: 1000,
        ..RuntimeConfig::default()
    })
}

/// Poll `cond` until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ── Raw protocol client ───────────────────────────────────────────────────────

/// A bare control connection, for talking to the master without a runtime.
pub struct RawClient {
    pub stream: TcpStream,
}

impl RawClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Ok(Self {
            stream: TcpStream::connect(addr).await?,
        })
    }

    pub async fn request(&mut self, frame_type: FrameType, doc: &ControlDoc) -> Result<ControlDoc> {
        write_frame(&mut self.stream, &Frame::control(frame_type, doc)).await?;
        let reply = read_frame(&mut self.stream, DEFAULT_MAX_FRAME).await?;
        if reply.frame_type != frame_type {
            bail!("expected {frame_type:?} reply, got {:?}", reply.frame_type);
        }
        Ok(reply.doc()?)
    }

    pub async fn join(&mut self, name: &str, api_version: &str) -> Result<ResponseCode> {
        let init = Initiation {
            name: name.into(),
            listening_ip: "127.0.0.1".into(),
            listening_port: 1,
            api_version: api_version.into(),
        };
        let reply = self
            .request(FrameType::Initiation, &ControlDoc::encode(&init)?)
            .await?;
        Ok(reply.response_code()?)
    }

    pub async fn join_current(&mut self, name: &str) -> Result<ResponseCode> {
        self.join(name, API_VERSION).await
    }
}
