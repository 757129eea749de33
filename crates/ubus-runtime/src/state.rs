//! Per-runtime tables: what this participant publishes, what it subscribes
//! to, and which methods it serves.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

use ubus_core::poll::ConnId;

use crate::callback::{EventHandler, MethodHandler};

pub(crate) type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;

/// A subscriber's socket as seen by the publisher.
#[derive(Clone)]
pub(crate) struct SubscriberConn {
    pub conn: ConnId,
    pub writer: SharedWriter,
}

/// A topic this runtime publishes.
pub(crate) struct PubEventInfo {
    pub type_id: u32,
    pub subscribers: HashMap<String, SubscriberConn>,
}

/// A topic this runtime subscribes to.
pub(crate) struct SubEventInfo {
    pub type_id: u32,
    pub publisher: String,
    pub conn: ConnId,
    pub handler: Arc<dyn EventHandler>,
    /// Keeps our half of the socket open; dropping it tells the publisher
    /// we are gone.
    pub _writer: OwnedWriteHalf,
}

/// A method this runtime serves.
pub(crate) struct MethodRegistration {
    pub request_type_id: u32,
    pub response_type_id: u32,
    pub handler: Arc<dyn MethodHandler>,
}

#[derive(Default)]
pub(crate) struct Tables {
    pub pub_events: DashMap<String, PubEventInfo>,
    pub subscriptions: DashMap<String, SubEventInfo>,
    pub methods: DashMap<String, MethodRegistration>,
}

impl Tables {
    /// Drop `name` from `topic` if it is still the subscriber on `conn`.
    pub fn prune_subscriber(&self, topic: &str, name: &str, conn: ConnId) -> bool {
        let Some(mut info) = self.pub_events.get_mut(topic) else {
            return false;
        };
        match info.subscribers.get(name) {
            Some(s) if s.conn == conn => {
                info.subscribers.remove(name);
                true
            }
            _ => false,
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> Option<usize> {
        self.pub_events.get(topic).map(|i| i.subscribers.len())
    }

    /// Remove the subscription on `topic` if it still uses `conn`.
    pub fn drop_subscription(&self, topic: &str, conn: ConnId) -> bool {
        self.subscriptions
            .remove_if(topic, |_, s| s.conn == conn)
            .is_some()
    }

    pub fn clear(&self) {
        self.pub_events.clear();
        self.subscriptions.clear();
        self.methods.clear();
    }
}
