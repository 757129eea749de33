//! Type-erased handlers.
//!
//! The tables store handlers as trait objects over raw payload bytes. The
//! typed adapters close over the (de)serialization for one message type,
//! so the loops that invoke them never see a concrete type.

use std::marker::PhantomData;

use ubus_core::message::{Message, MessageError};

/// Receives the raw payload of every EVENT frame on a subscription.
///
/// Runs on the event loop; a slow handler delays later events on every
/// subscription of this runtime.
pub trait EventHandler: Send + Sync + 'static {
    fn on_event(&self, payload: &[u8]);
}

/// Turns a raw request into a raw response. Runs on the blocking pool.
pub trait MethodHandler: Send + Sync + 'static {
    fn call(&self, request: &[u8]) -> Result<Vec<u8>, MessageError>;
}

impl<F> EventHandler for F
where
    F: Fn(&[u8]) + Send + Sync + 'static,
{
    fn on_event(&self, payload: &[u8]) {
        self(payload)
    }
}

impl<F> MethodHandler for F
where
    F: Fn(&[u8]) -> Result<Vec<u8>, MessageError> + Send + Sync + 'static,
{
    fn call(&self, request: &[u8]) -> Result<Vec<u8>, MessageError> {
        self(request)
    }
}

// ── Typed adapters ───────────────────────────────────────────────────────────

pub struct TypedEvent<T, F> {
    topic: String,
    callback: F,
    _type: PhantomData<fn(T)>,
}

impl<T, F> TypedEvent<T, F>
where
    T: Message,
    F: Fn(T) + Send + Sync + 'static,
{
    pub fn new(topic: &str, callback: F) -> Self {
        Self {
            topic: topic.to_string(),
            callback,
            _type: PhantomData,
        }
    }
}

impl<T, F> EventHandler for TypedEvent<T, F>
where
    T: Message,
    F: Fn(T) + Send + Sync + 'static,
{
    fn on_event(&self, payload: &[u8]) {
        match T::deserialize(payload) {
            Ok(event) => (self.callback)(event),
            Err(e) => tracing::warn!(
                topic = %self.topic,
                type_id = T::TYPE_ID,
                error = %e,
                "dropping undecodable event"
            ),
        }
    }
}

pub struct TypedMethod<Req, Resp, F> {
    handler: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> TypedMethod<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(Req) -> Resp + Send + Sync + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _types: PhantomData,
        }
    }
}

impl<Req, Resp, F> MethodHandler for TypedMethod<Req, Resp, F>
where
    Req: Message,
    Resp: Message,
    F: Fn(Req) -> Resp + Send + Sync + 'static,
{
    fn call(&self, request: &[u8]) -> Result<Vec<u8>, MessageError> {
        let req = Req::deserialize(request)?;
        Ok((self.handler)(req).serialize())
    }
}
