//! Participant registry — who has joined, what they publish, what they provide.
//!
//! Participants live in one table indexed two ways (by name and by control
//! connection) behind a single `RwLock`, so the two indexes can never
//! disagree. Events and methods are separate `DashMap`s.
//!
//! Lock order: the participant lock is always taken before touching the
//! event or method maps. Nothing here performs I/O, so no lock is ever held
//! across an await point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use ubus_core::control::{
    EventListing, Initiation, MethodListing, ParticipantListing, ProviderLocation,
    PublisherLocation, ResponseCode,
};
use ubus_core::poll::ConnId;

// ── Records ──────────────────────────────────────────────────────────────────

/// A joined participant.
#[derive(Debug)]
pub struct ParticipantInfo {
    /// Unique across the bus at any instant.
    pub name: String,
    /// Control connection peer address.
    pub ip: String,
    pub port: u16,
    /// Self-reported peer server address, handed to subscribers and callers.
    pub listening_ip: String,
    pub listening_port: u16,
    /// Control connection this participant joined on.
    pub conn: ConnId,
    published: Mutex<HashMap<String, u32>>,
    subscribed: Mutex<HashMap<String, u32>>,
    methods: Mutex<HashMap<String, (u32, u32)>>,
    watchdog: AtomicU32,
}

impl ParticipantInfo {
    fn new(init: &Initiation, peer: SocketAddr, conn: ConnId) -> Self {
        Self {
            name: init.name.clone(),
            ip: peer.ip().to_string(),
            port: peer.port(),
            listening_ip: init.listening_ip.clone(),
            listening_port: init.listening_port,
            conn,
            published: Mutex::new(HashMap::new()),
            subscribed: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            watchdog: AtomicU32::new(0),
        }
    }

    /// Missed keep-alive periods so far.
    pub fn watchdog(&self) -> u32 {
        self.watchdog.load(Ordering::Relaxed)
    }

    pub fn published_topics(&self) -> HashMap<String, u32> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscribed_topics(&self) -> HashMap<String, u32> {
        self.subscribed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn provided_methods(&self) -> HashMap<String, (u32, u32)> {
        self.methods.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[derive(Debug, Clone)]
pub struct EventInfo {
    pub name: String,
    pub type_id: u32,
    pub publisher: Arc<ParticipantInfo>,
    pub subscribers: Vec<Arc<ParticipantInfo>>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name: String,
    pub request_type_id: u32,
    pub response_type_id: u32,
    pub provider: Arc<ParticipantInfo>,
}

#[derive(Debug, Default)]
struct ParticipantTable {
    by_name: HashMap<String, Arc<ParticipantInfo>>,
    by_conn: HashMap<ConnId, Arc<ParticipantInfo>>,
}

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("`{0}` is already registered")]
    Duplicate(String),

    #[error("api version `{got}` does not match `{expected}`")]
    VersionMismatch { expected: String, got: String },

    #[error("`{0}` is not published")]
    NotPublished(String),

    #[error("connection {0} has not joined")]
    UnknownConnection(ConnId),
}

impl RegistryError {
    /// Code sent back to the participant.
    pub fn code(&self) -> ResponseCode {
        match self {
            RegistryError::Duplicate(_) => ResponseCode::Duplicate,
            RegistryError::VersionMismatch { .. } => ResponseCode::VersionMismatch,
            RegistryError::NotPublished(_) => ResponseCode::NotPublished,
            RegistryError::UnknownConnection(_) => ResponseCode::Invalid,
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Registry {
    api_version: String,
    participants: RwLock<ParticipantTable>,
    events: DashMap<String, EventInfo>,
    methods: DashMap<String, MethodInfo>,
}

impl Registry {
    pub fn new(api_version: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            participants: RwLock::new(ParticipantTable::default()),
            events: DashMap::new(),
            methods: DashMap::new(),
        }
    }

    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    fn read(&self) -> RwLockReadGuard<'_, ParticipantTable> {
        self.participants.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ParticipantTable> {
        self.participants.write().unwrap_or_else(|e| e.into_inner())
    }

    // ── Membership ───────────────────────────────────────────────────────────

    /// Register a participant. Version is checked before the name.
    pub fn join(
        &self,
        init: &Initiation,
        peer: SocketAddr,
        conn: ConnId,
    ) -> Result<Arc<ParticipantInfo>, RegistryError> {
        if init.api_version != self.api_version {
            return Err(RegistryError::VersionMismatch {
                expected: self.api_version.clone(),
                got: init.api_version.clone(),
            });
        }

        let mut table = self.write();
        if table.by_name.contains_key(&init.name) {
            return Err(RegistryError::Duplicate(init.name.clone()));
        }
        let info = Arc::new(ParticipantInfo::new(init, peer, conn));
        table.by_name.insert(info.name.clone(), info.clone());
        table.by_conn.insert(conn, info.clone());
        Ok(info)
    }

    pub fn participant(&self, name: &str) -> Option<Arc<ParticipantInfo>> {
        self.read().by_name.get(name).cloned()
    }

    pub fn participant_by_conn(&self, conn: ConnId) -> Option<Arc<ParticipantInfo>> {
        self.read().by_conn.get(&conn).cloned()
    }

    /// Reset the watchdog of the participant on `conn`.
    pub fn keep_alive(&self, conn: ConnId) -> bool {
        match self.read().by_conn.get(&conn) {
            Some(p) => {
                p.watchdog.store(0, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// Remove `name` if it is still the participant that joined on `conn`,
    /// with its events, methods, and subscriptions. Returns whether anything
    /// was removed.
    pub fn remove_participant(&self, name: &str, conn: ConnId) -> bool {
        let mut table = self.write();
        match table.by_name.get(name) {
            Some(p) if p.conn == conn => {}
            _ => return false,
        }
        table.by_name.remove(name);
        table.by_conn.remove(&conn);
        self.cascade(conn);
        true
    }

    /// Remove whoever joined on `conn`. Returns their name.
    pub fn remove_by_conn(&self, conn: ConnId) -> Option<String> {
        let mut table = self.write();
        let info = table.by_conn.remove(&conn)?;
        table.by_name.remove(&info.name);
        self.cascade(conn);
        Some(info.name.clone())
    }

    // Caller holds the participant write lock.
    fn cascade(&self, conn: ConnId) {
        self.events.retain(|_, e| e.publisher.conn != conn);
        for mut e in self.events.iter_mut() {
            e.subscribers.retain(|s| s.conn != conn);
        }
        self.methods.retain(|_, m| m.provider.conn != conn);
    }

    /// Advance every watchdog by one period. Returns participants that have
    /// now missed `threshold` periods.
    pub fn tick_watchdogs(&self, threshold: u32) -> Vec<(String, ConnId)> {
        self.read()
            .by_name
            .values()
            .filter(|p| p.watchdog.fetch_add(1, Ordering::Relaxed) + 1 >= threshold)
            .map(|p| (p.name.clone(), p.conn))
            .collect()
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn register_event(
        &self,
        conn: ConnId,
        topic: &str,
        type_id: u32,
    ) -> Result<(), RegistryError> {
        let table = self.read();
        let publisher = table
            .by_conn
            .get(&conn)
            .ok_or(RegistryError::UnknownConnection(conn))?;

        match self.events.entry(topic.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(topic.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(EventInfo {
                    name: topic.to_string(),
                    type_id,
                    publisher: publisher.clone(),
                    subscribers: Vec::new(),
                });
                publisher
                    .published
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(topic.to_string(), type_id);
                Ok(())
            }
        }
    }

    /// Record `conn` as a subscriber of `topic` and return where the
    /// publisher listens. Type ids are checked by the publisher itself.
    pub fn subscribe_event(
        &self,
        conn: ConnId,
        topic: &str,
        type_id: u32,
    ) -> Result<PublisherLocation, RegistryError> {
        let table = self.read();
        let subscriber = table
            .by_conn
            .get(&conn)
            .ok_or(RegistryError::UnknownConnection(conn))?;

        let mut event = self
            .events
            .get_mut(topic)
            .ok_or_else(|| RegistryError::NotPublished(topic.to_string()))?;
        if !event.subscribers.iter().any(|s| s.conn == conn) {
            event.subscribers.push(subscriber.clone());
        }
        subscriber
            .subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.to_string(), type_id);

        Ok(PublisherLocation {
            publisher_ip: event.publisher.listening_ip.clone(),
            publisher_port: event.publisher.listening_port,
            publisher_name: event.publisher.name.clone(),
        })
    }

    /// Forget `conn` as a subscriber of `topic`. Returns whether it was one.
    pub fn unsubscribe_event(&self, conn: ConnId, topic: &str) -> Result<bool, RegistryError> {
        let table = self.read();
        let subscriber = table
            .by_conn
            .get(&conn)
            .ok_or(RegistryError::UnknownConnection(conn))?;

        let mut event = self
            .events
            .get_mut(topic)
            .ok_or_else(|| RegistryError::NotPublished(topic.to_string()))?;
        let before = event.subscribers.len();
        event.subscribers.retain(|s| s.conn != conn);
        subscriber
            .subscribed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(topic);
        Ok(event.subscribers.len() != before)
    }

    pub fn event(&self, topic: &str) -> Option<EventInfo> {
        self.events.get(topic).map(|e| e.value().clone())
    }

    // ── Methods ──────────────────────────────────────────────────────────────

    pub fn provide_method(
        &self,
        conn: ConnId,
        method: &str,
        request_type_id: u32,
        response_type_id: u32,
    ) -> Result<(), RegistryError> {
        let table = self.read();
        let provider = table
            .by_conn
            .get(&conn)
            .ok_or(RegistryError::UnknownConnection(conn))?;

        match self.methods.entry(method.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate(method.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(MethodInfo {
                    name: method.to_string(),
                    request_type_id,
                    response_type_id,
                    provider: provider.clone(),
                });
                provider
                    .methods
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(method.to_string(), (request_type_id, response_type_id));
                Ok(())
            }
        }
    }

    pub fn query_method(
        &self,
        conn: ConnId,
        method: &str,
    ) -> Result<ProviderLocation, RegistryError> {
        let table = self.read();
        if !table.by_conn.contains_key(&conn) {
            return Err(RegistryError::UnknownConnection(conn));
        }
        let info = self
            .methods
            .get(method)
            .ok_or_else(|| RegistryError::NotPublished(method.to_string()))?;
        Ok(ProviderLocation {
            provider_ip: info.provider.listening_ip.clone(),
            provider_port: info.provider.listening_port,
            provider_name: info.provider.name.clone(),
        })
    }

    pub fn method(&self, name: &str) -> Option<MethodInfo> {
        self.methods.get(name).map(|m| m.value().clone())
    }

    // ── Listings ─────────────────────────────────────────────────────────────

    pub fn list_events(&self) -> Vec<EventListing> {
        let _table = self.read();
        let mut rows: Vec<_> = self
            .events
            .iter()
            .map(|e| EventListing {
                name: e.name.clone(),
                type_id: e.type_id,
                publisher: e.publisher.name.clone(),
                subscribers: e.subscribers.iter().map(|s| s.name.clone()).collect(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub fn list_participants(&self) -> Vec<ParticipantListing> {
        let mut rows: Vec<_> = self
            .read()
            .by_name
            .values()
            .map(|p| ParticipantListing {
                name: p.name.clone(),
                ip: p.ip.clone(),
                port: p.port,
                listening_ip: p.listening_ip.clone(),
                listening_port: p.listening_port,
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub fn list_methods(&self) -> Vec<MethodListing> {
        let _table = self.read();
        let mut rows: Vec<_> = self
            .methods
            .iter()
            .map(|m| MethodListing {
                name: m.name.clone(),
                request_type: m.request_type_id,
                response_type: m.response_type_id,
                provider: m.provider.name.clone(),
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    pub fn participant_count(&self) -> usize {
        self.read().by_name.len()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}
