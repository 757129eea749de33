//! Control frame dispatch for joined participants.
//!
//! Every handler is a plain function of the registry and one frame; the
//! control loop owns the sockets and writes whatever comes back. A reply
//! always carries the request's frame type.

use ubus_core::control::{
    ControlDoc, ControlError, MethodQuery, MethodSpec, ResponseCode, TopicRequest, Unsubscribe,
};
use ubus_core::poll::ConnId;
use ubus_core::wire::{Frame, FrameType};

use crate::debug::handle_debug;
use crate::registry::Registry;

/// Handle one frame from the participant on `conn`. `None` means no reply
/// is owed (KEEP_ALIVE).
pub fn dispatch(registry: &Registry, conn: ConnId, frame: &Frame) -> Option<Frame> {
    let reply = match frame.frame_type {
        FrameType::KeepAlive => {
            if !registry.keep_alive(conn) {
                tracing::debug!(conn, "keep-alive from unknown connection");
            }
            return None;
        }
        FrameType::EventRegister => handle_event_register(registry, conn, frame),
        FrameType::EventSubscribe => handle_event_subscribe(registry, conn, frame),
        FrameType::EventUnsubscribe => handle_event_unsubscribe(registry, conn, frame),
        FrameType::MethodProvide => handle_method_provide(registry, conn, frame),
        FrameType::MethodQuery => handle_method_query(registry, conn, frame),
        FrameType::Debug => match frame.doc() {
            Ok(doc) => handle_debug(registry, &doc),
            Err(e) => invalid(conn, frame.frame_type, &e),
        },
        other => {
            tracing::warn!(conn, frame_type = ?other, "unexpected control frame");
            ControlDoc::response(ResponseCode::Invalid)
        }
    };
    Some(Frame::control(frame.frame_type, &reply))
}

fn invalid(conn: ConnId, frame_type: FrameType, err: &ControlError) -> ControlDoc {
    tracing::warn!(conn, ?frame_type, error = %err, "malformed control payload");
    ControlDoc::response(ResponseCode::Invalid)
}

fn handle_event_register(registry: &Registry, conn: ConnId, frame: &Frame) -> ControlDoc {
    let req: TopicRequest = match frame.doc().and_then(|d| d.decode()) {
        Ok(r) => r,
        Err(e) => return invalid(conn, frame.frame_type, &e),
    };
    match registry.register_event(conn, &req.topic, req.type_id) {
        Ok(()) => {
            tracing::info!(conn, topic = %req.topic, type_id = req.type_id, "event registered");
            ControlDoc::response(ResponseCode::Ok)
        }
        Err(e) => {
            tracing::debug!(conn, error = %e, "event register refused");
            ControlDoc::response(e.code())
        }
    }
}

fn handle_event_subscribe(registry: &Registry, conn: ConnId, frame: &Frame) -> ControlDoc {
    let req: TopicRequest = match frame.doc().and_then(|d| d.decode()) {
        Ok(r) => r,
        Err(e) => return invalid(conn, frame.frame_type, &e),
    };
    let location = match registry.subscribe_event(conn, &req.topic, req.type_id) {
        Ok(l) => l,
        Err(e) => {
            tracing::debug!(conn, error = %e, "event subscribe refused");
            return ControlDoc::response(e.code());
        }
    };
    tracing::info!(
        conn,
        topic = %req.topic,
        publisher = %location.publisher_name,
        "event subscribed"
    );
    located(&location)
}

fn handle_event_unsubscribe(registry: &Registry, conn: ConnId, frame: &Frame) -> ControlDoc {
    let req: Unsubscribe = match frame.doc().and_then(|d| d.decode()) {
        Ok(r) => r,
        Err(e) => return invalid(conn, frame.frame_type, &e),
    };
    match registry.unsubscribe_event(conn, &req.topic) {
        Ok(was_subscribed) => {
            tracing::info!(conn, topic = %req.topic, was_subscribed, "event unsubscribed");
            ControlDoc::response(ResponseCode::Ok)
        }
        Err(e) => {
            tracing::debug!(conn, error = %e, "event unsubscribe refused");
            ControlDoc::response(e.code())
        }
    }
}

fn handle_method_provide(registry: &Registry, conn: ConnId, frame: &Frame) -> ControlDoc {
    let req: MethodSpec = match frame.doc().and_then(|d| d.decode()) {
        Ok(r) => r,
        Err(e) => return invalid(conn, frame.frame_type, &e),
    };
    match registry.provide_method(conn, &req.method, req.request_type_id, req.response_type_id)
    {
        Ok(()) => {
            tracing::info!(conn, method = %req.method, "method provided");
            ControlDoc::response(ResponseCode::Ok)
        }
        Err(e) => {
            tracing::debug!(conn, error = %e, "method provide refused");
            ControlDoc::response(e.code())
        }
    }
}

fn handle_method_query(registry: &Registry, conn: ConnId, frame: &Frame) -> ControlDoc {
    let req: MethodQuery = match frame.doc().and_then(|d| d.decode()) {
        Ok(r) => r,
        Err(e) => return invalid(conn, frame.frame_type, &e),
    };
    match registry.query_method(conn, &req.method) {
        Ok(location) => {
            tracing::debug!(conn, method = %req.method, provider = %location.provider_name, "method located");
            located(&location)
        }
        Err(e) => {
            tracing::debug!(conn, error = %e, "method query refused");
            ControlDoc::response(e.code())
        }
    }
}

/// `{response: OK}` merged with a location body.
fn located<T: serde::Serialize>(location: &T) -> ControlDoc {
    match ControlDoc::encode(location) {
        Ok(mut doc) => {
            doc.set_str("response", ResponseCode::Ok.as_str());
            doc
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode location");
            ControlDoc::response(ResponseCode::Invalid)
        }
    }
}
