//! Runtime — a participant's handle on the bus.
//!
//! One `Runtime` joins the bus under one name. It is a client of the master
//! (join, advertise, subscribe, provide, query, keep-alives) and a server to
//! other runtimes (subscription pushes and method calls on its peer port).
//! Cloning is cheap; clones share one participant.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::mapref::entry::Entry;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use ubus_core::config::RuntimeConfig;
use ubus_core::control::{
    ControlDoc, Initiation, MethodCall, MethodQuery, MethodSpec, PeerSubscribe, ProviderLocation,
    PublisherLocation, ResponseCode, TopicRequest, Unsubscribe,
};
use ubus_core::error::BusError;
use ubus_core::message::{to_text, Message};
use ubus_core::poll::next_conn_id;
use ubus_core::wire::{read_frame, write_frame, Frame, FrameType, API_VERSION};

use crate::callback::{EventHandler, MethodHandler, TypedEvent, TypedMethod};
use crate::control::ControlChannel;
use crate::event_loop::{EventLoop, EventLoopCmd};
use crate::keep_alive::keep_alive_loop;
use crate::peer_server::PeerServer;
use crate::state::{MethodRegistration, PubEventInfo, SubEventInfo, Tables};

#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    config: RuntimeConfig,
    tables: Arc<Tables>,
    /// Set while a join is in progress or a session is live.
    starting: AtomicBool,
    /// Bumped by every `shutdown`, so a join that was running at the time
    /// knows to back out.
    epoch: AtomicU64,
    session: RwLock<Option<Arc<Session>>>,
}

/// Everything that exists only after a successful join.
struct Session {
    name: String,
    listen_addr: SocketAddr,
    control: Arc<ControlChannel>,
    events: mpsc::UnboundedSender<EventLoopCmd>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let slot = self.session.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = slot.take() {
            let _ = session.shutdown_tx.send(());
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                tables: Arc::new(Tables::default()),
                starting: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                session: RwLock::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Join the bus as `name`. Fails without side effects if this runtime
    /// has already joined or is joining. A runtime whose master connection
    /// was lost may join again.
    pub async fn init(&self, name: &str, master_ip: &str, master_port: u16) -> Result<(), BusError> {
        self.end_lost_session();
        if self
            .inner
            .starting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BusError::AlreadyInitialized);
        }
        let epoch = self.inner.epoch.load(Ordering::Acquire);

        match self.start(name, master_ip, master_port).await {
            Ok(session) => {
                let mut slot = self.inner.session.write().unwrap_or_else(|e| e.into_inner());
                if self.inner.epoch.load(Ordering::Acquire) != epoch {
                    drop(slot);
                    tracing::info!(%name, "shut down while joining, leaving again");
                    let _ = session.shutdown_tx.send(());
                    return Err(BusError::NotInitialized);
                }
                *slot = Some(Arc::new(session));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(%name, error = %e, "failed to join bus");
                if self.inner.epoch.load(Ordering::Acquire) == epoch {
                    self.inner.starting.store(false, Ordering::Release);
                }
                Err(e)
            }
        }
    }

    /// Join using the master address from the configuration.
    pub async fn init_from_config(&self, name: &str) -> Result<(), BusError> {
        let ip = self.inner.config.master_ip.clone();
        let port = self.inner.config.master_port;
        self.init(name, &ip, port).await
    }

    async fn start(&self, name: &str, master_ip: &str, master_port: u16) -> Result<Session, BusError> {
        let config = &self.inner.config;
        let stream = self.connect(master_ip, master_port).await?;

        // Listen on the interface that reaches the master, so the address we
        // report is one other participants can reach too.
        let local_ip = stream.local_addr()?.ip();
        let listener = TcpListener::bind(SocketAddr::new(local_ip, 0)).await?;
        let listen_addr = listener.local_addr()?;

        // Every loop of this session subscribes before it is spawned.
        let (shutdown_tx, _) = broadcast::channel(1);
        let control = Arc::new(ControlChannel::new(
            stream,
            config.request_timeout(),
            config.max_frame_bytes,
            shutdown_tx.clone(),
        ));
        let init = Initiation {
            name: name.to_string(),
            listening_ip: listen_addr.ip().to_string(),
            listening_port: listen_addr.port(),
            api_version: API_VERSION.to_string(),
        };
        let reply = control
            .request(FrameType::Initiation, &ControlDoc::encode(&init)?)
            .await?;
        BusError::from_code(reply.response_code()?, name)?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let tasks = vec![
            tokio::spawn(keep_alive_loop(
                control.clone(),
                config.keep_alive_interval(),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(
                PeerServer::new(
                    listener,
                    self.inner.tables.clone(),
                    config.request_timeout(),
                    config.max_frame_bytes,
                    shutdown_tx.subscribe(),
                )
                .run(),
            ),
            tokio::spawn(
                EventLoop::new(
                    self.inner.tables.clone(),
                    events_rx,
                    config.tick(),
                    config.max_frame_bytes,
                    shutdown_tx.subscribe(),
                )
                .run(),
            ),
        ];

        tracing::info!(%name, %master_ip, master_port, %listen_addr, "joined bus");
        Ok(Session {
            name: name.to_string(),
            listen_addr,
            control,
            events: events_tx,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        })
    }

    /// Leave the bus: stop every loop, close the control connection (the
    /// master reaps us at once) and drop all peer sockets. A join still in
    /// progress backs out instead of completing.
    pub async fn shutdown(&self) {
        self.inner.epoch.fetch_add(1, Ordering::AcqRel);
        let session = self
            .inner
            .session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(session) = session {
            let _ = session.shutdown_tx.send(());
            session.control.close().await;
            let tasks = std::mem::take(&mut *session.tasks.lock().unwrap_or_else(|e| e.into_inner()));
            for task in tasks {
                let _ = task.await;
            }
            tracing::info!(name = %session.name, "left bus");
        }
        self.inner.tables.clear();
        self.inner.starting.store(false, Ordering::Release);
    }

    /// Tear down a session whose master connection has closed, whether the
    /// master reaped us or the connection failed.
    fn end_lost_session(&self) {
        let lost = matches!(
            self.inner.session.read().unwrap_or_else(|e| e.into_inner()).as_ref(),
            Some(s) if !s.control.is_open()
        );
        if !lost {
            return;
        }
        let mut slot = self.inner.session.write().unwrap_or_else(|e| e.into_inner());
        // Another caller may have ended it or a new join replaced it.
        if slot.as_ref().map_or(true, |s| s.control.is_open()) {
            return;
        }
        let Some(session) = slot.take() else {
            return;
        };
        drop(slot);
        let _ = session.shutdown_tx.send(());
        tracing::warn!(name = %session.name, "lost connection to master, session ended");
        self.inner.tables.clear();
        self.inner.starting.store(false, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.session().is_ok()
    }

    pub fn name(&self) -> Option<String> {
        self.session().ok().map(|s| s.name.clone())
    }

    /// Address of this runtime's peer server.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.session().ok().map(|s| s.listen_addr)
    }

    fn session(&self) -> Result<Arc<Session>, BusError> {
        self.end_lost_session();
        self.inner
            .session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(BusError::NotInitialized)
    }

    pub(crate) fn control(&self) -> Result<Arc<ControlChannel>, BusError> {
        Ok(self.session()?.control.clone())
    }

    // ── Events ───────────────────────────────────────────────────────────────

    /// Become the publisher of `topic`.
    pub async fn advertise_event<T: Message>(&self, topic: &str) -> Result<(), BusError> {
        let control = self.control()?;
        match self.inner.tables.pub_events.entry(topic.to_string()) {
            Entry::Occupied(_) => return Err(BusError::Conflict(ResponseCode::Duplicate)),
            Entry::Vacant(slot) => {
                slot.insert(PubEventInfo {
                    type_id: T::TYPE_ID,
                    subscribers: HashMap::new(),
                });
            }
        }

        let req = TopicRequest {
            topic: topic.to_string(),
            type_id: T::TYPE_ID,
        };
        let result = async {
            let reply = control
                .request(FrameType::EventRegister, &ControlDoc::encode(&req)?)
                .await?;
            BusError::from_code(reply.response_code()?, topic)
        }
        .await;

        if let Err(e) = result {
            self.inner.tables.pub_events.remove(topic);
            return Err(e);
        }
        tracing::info!(%topic, type_id = T::TYPE_ID, "event advertised");
        Ok(())
    }

    /// Send `event` to every current subscriber of `topic`. Returns how many
    /// subscribers it reached. A failed subscriber is dropped and does not
    /// affect the others.
    pub async fn publish_event<T: Message>(&self, topic: &str, event: &T) -> Result<usize, BusError> {
        self.session()?;
        let targets: Vec<_> = {
            let info = self
                .inner
                .tables
                .pub_events
                .get(topic)
                .ok_or_else(|| BusError::NotAdvertised(topic.to_string()))?;
            if info.type_id != T::TYPE_ID {
                return Err(BusError::TypeMismatch {
                    expected: info.type_id,
                    actual: T::TYPE_ID,
                });
            }
            info.subscribers
                .iter()
                .map(|(name, sub)| (name.clone(), sub.clone()))
                .collect()
        };
        if targets.is_empty() {
            return Ok(0);
        }

        let bytes = Frame::new(FrameType::Event, event.serialize()).encode()?;
        let timeout = self.inner.config.request_timeout();
        let mut delivered = 0;
        for (name, sub) in targets {
            let result = {
                let mut writer = sub.writer.lock().await;
                tokio::time::timeout(timeout, async {
                    writer.write_all(&bytes).await?;
                    writer.flush().await
                })
                .await
            };
            match result {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(%topic, subscriber = %name, error = %e, "event push failed");
                    self.inner.tables.prune_subscriber(topic, &name, sub.conn);
                }
                Err(_) => {
                    tracing::warn!(%topic, subscriber = %name, "event push timed out");
                    self.inner.tables.prune_subscriber(topic, &name, sub.conn);
                }
            }
        }
        Ok(delivered)
    }

    /// Subscribe to `topic`, decoding each event as `T`.
    pub async fn subscribe_event<T, F>(&self, topic: &str, callback: F) -> Result<(), BusError>
    where
        T: Message,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_raw(topic, T::TYPE_ID, TypedEvent::new(topic, callback))
            .await
    }

    /// Subscribe to `topic` with an explicit type id and a raw-bytes handler.
    pub async fn subscribe_raw<H: EventHandler>(
        &self,
        topic: &str,
        type_id: u32,
        handler: H,
    ) -> Result<(), BusError> {
        let session = self.session()?;

        let req = TopicRequest {
            topic: topic.to_string(),
            type_id,
        };
        let reply = session
            .control
            .request(FrameType::EventSubscribe, &ControlDoc::encode(&req)?)
            .await?;
        BusError::from_code(reply.response_code()?, topic)?;
        let location: PublisherLocation = reply.decode()?;

        // The master now lists us as a subscriber. Anything failing from here
        // on has to take that back.
        let attached = self
            .attach(&session, topic, type_id, &location, Arc::new(handler))
            .await;
        if let Err(e) = attached {
            tracing::warn!(%topic, publisher = %location.publisher_name, error = %e, "subscription refused");
            withdraw(&session.control, topic).await;
            return Err(e);
        }
        tracing::info!(%topic, publisher = %location.publisher_name, "subscribed");
        Ok(())
    }

    /// Handshake with the publisher and hand the socket to the event loop.
    async fn attach(
        &self,
        session: &Session,
        topic: &str,
        type_id: u32,
        location: &PublisherLocation,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BusError> {
        let mut stream = self
            .connect(&location.publisher_ip, location.publisher_port)
            .await?;
        let hello = PeerSubscribe {
            topic: topic.to_string(),
            type_id,
            name: session.name.clone(),
        };
        let reply = self
            .exchange(
                &mut stream,
                Frame::control(FrameType::EventSubscribe, &ControlDoc::encode(&hello)?),
                FrameType::EventSubscribe,
            )
            .await?;
        BusError::from_code(reply.response_code()?, topic)?;

        let conn = next_conn_id();
        let (reader, writer) = stream.into_split();
        let previous = self.inner.tables.subscriptions.insert(
            topic.to_string(),
            SubEventInfo {
                type_id,
                publisher: location.publisher_name.clone(),
                conn,
                handler,
                _writer: writer,
            },
        );
        if let Some(old) = previous {
            let _ = session.events.send(EventLoopCmd::Remove { conn: old.conn });
        }
        if session
            .events
            .send(EventLoopCmd::Add {
                conn,
                topic: topic.to_string(),
                reader,
            })
            .is_err()
        {
            self.inner.tables.drop_subscription(topic, conn);
            return Err(BusError::Protocol("event loop is not running".into()));
        }
        Ok(())
    }

    /// Stop receiving `topic`. Closing the socket tells the publisher and
    /// the master is told to forget the subscription.
    pub async fn unsubscribe_event(&self, topic: &str) -> Result<bool, BusError> {
        let session = self.session()?;
        let Some((_, sub)) = self.inner.tables.subscriptions.remove(topic) else {
            return Ok(false);
        };
        let _ = session.events.send(EventLoopCmd::Remove { conn: sub.conn });

        let req = Unsubscribe {
            topic: topic.to_string(),
        };
        let reply = session
            .control
            .request(FrameType::EventUnsubscribe, &ControlDoc::encode(&req)?)
            .await?;
        BusError::from_code(reply.response_code()?, topic)?;
        tracing::info!(%topic, publisher = %sub.publisher, "unsubscribed");
        Ok(true)
    }

    /// Current subscriber count of a topic this runtime advertises.
    pub fn subscriber_count(&self, topic: &str) -> Option<usize> {
        self.inner.tables.subscriber_count(topic)
    }

    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.inner.tables.subscriptions.contains_key(topic)
    }

    /// Type id this runtime subscribed to `topic` with.
    pub fn subscribed_type(&self, topic: &str) -> Option<u32> {
        self.inner.tables.subscriptions.get(topic).map(|s| s.type_id)
    }

    // ── Methods ──────────────────────────────────────────────────────────────

    /// Serve `method`, decoding requests as `Req` and encoding replies as `Resp`.
    pub async fn provide_method<Req, Resp, F>(&self, method: &str, handler: F) -> Result<(), BusError>
    where
        Req: Message,
        Resp: Message,
        F: Fn(Req) -> Resp + Send + Sync + 'static,
    {
        self.provide_raw(
            method,
            Req::TYPE_ID,
            Resp::TYPE_ID,
            TypedMethod::<Req, Resp, F>::new(handler),
        )
        .await
    }

    /// Serve `method` with explicit type ids and a raw-bytes handler.
    pub async fn provide_raw<H: MethodHandler>(
        &self,
        method: &str,
        request_type_id: u32,
        response_type_id: u32,
        handler: H,
    ) -> Result<(), BusError> {
        let control = self.control()?;
        match self.inner.tables.methods.entry(method.to_string()) {
            Entry::Occupied(_) => return Err(BusError::Conflict(ResponseCode::Duplicate)),
            Entry::Vacant(slot) => {
                slot.insert(MethodRegistration {
                    request_type_id,
                    response_type_id,
                    handler: Arc::new(handler),
                });
            }
        }

        let spec = MethodSpec {
            method: method.to_string(),
            request_type_id,
            response_type_id,
        };
        let result = async {
            let reply = control
                .request(FrameType::MethodProvide, &ControlDoc::encode(&spec)?)
                .await?;
            BusError::from_code(reply.response_code()?, method)
        }
        .await;

        if let Err(e) = result {
            self.inner.tables.methods.remove(method);
            return Err(e);
        }
        tracing::info!(%method, request_type_id, response_type_id, "method provided");
        Ok(())
    }

    /// Call `method` on whichever participant provides it.
    pub async fn call_method<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, BusError>
    where
        Req: Message,
        Resp: Message,
    {
        let response = self
            .call_method_raw(method, Req::TYPE_ID, Resp::TYPE_ID, &request.serialize())
            .await?;
        Ok(Resp::deserialize(&response)?)
    }

    /// Call `method` with explicit type ids. Payloads must be UTF-8.
    pub async fn call_method_raw(
        &self,
        method: &str,
        request_type_id: u32,
        response_type_id: u32,
        request: &[u8],
    ) -> Result<Vec<u8>, BusError> {
        let session = self.session()?;
        let request_data = to_text(request)?.to_string();

        let query = MethodQuery {
            method: method.to_string(),
            request_type_id,
            response_type_id,
            name: session.name.clone(),
        };
        let reply = session
            .control
            .request(FrameType::MethodQuery, &ControlDoc::encode(&query)?)
            .await?;
        BusError::from_code(reply.response_code()?, method)?;
        let location: ProviderLocation = reply.decode()?;

        let mut stream = self
            .connect(&location.provider_ip, location.provider_port)
            .await?;
        let call = MethodCall {
            method: method.to_string(),
            request_type_id,
            response_type_id,
            name: session.name.clone(),
            request_data,
        };
        let reply = self
            .exchange(
                &mut stream,
                Frame::control(FrameType::MethodCall, &ControlDoc::encode(&call)?),
                FrameType::MethodResponse,
            )
            .await?;
        BusError::from_code(reply.response_code()?, method)?;

        tracing::debug!(%method, provider = %location.provider_name, "method call answered");
        Ok(reply.get_str("response_data")?.as_bytes().to_vec())
    }

    // ── Peer I/O ─────────────────────────────────────────────────────────────

    /// `host` may be a name or an IPv4 or IPv6 literal.
    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, BusError> {
        let timeout = self.inner.config.connect_timeout();
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| BusError::Timeout("connect", timeout))??;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    /// One request, one reply, on a fresh peer connection.
    async fn exchange(
        &self,
        stream: &mut TcpStream,
        request: Frame,
        reply_type: FrameType,
    ) -> Result<ControlDoc, BusError> {
        let timeout = self.inner.config.request_timeout();
        let max_frame = self.inner.config.max_frame_bytes;
        let reply = tokio::time::timeout(timeout, async {
            write_frame(stream, &request).await?;
            read_frame(stream, max_frame).await
        })
        .await
        .map_err(|_| BusError::Timeout("peer request", timeout))??;

        if reply.frame_type != reply_type {
            return Err(BusError::Protocol(format!(
                "expected {reply_type:?} from peer, got {:?}",
                reply.frame_type
            )));
        }
        Ok(reply.doc()?)
    }
}

/// Tell the master to drop a subscription it handed out. Failure only
/// leaves a stale entry behind, which the publisher skips on its own.
async fn withdraw(control: &ControlChannel, topic: &str) {
    let req = Unsubscribe {
        topic: topic.to_string(),
    };
    let result = async {
        let reply = control
            .request(FrameType::EventUnsubscribe, &ControlDoc::encode(&req)?)
            .await?;
        BusError::from_code(reply.response_code()?, topic)
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(%topic, error = %e, "could not withdraw subscription");
    }
}
