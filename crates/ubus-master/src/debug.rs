//! DEBUG requests: read-only registry listings.

use serde::Serialize;
use serde_json::Value;

use ubus_core::control::{ControlDoc, DebugKind, DebugQuery, ResponseCode};

use crate::registry::Registry;

/// `{debug_type}` → `{response: "OK", response_data: [...]}`.
pub fn handle_debug(registry: &Registry, doc: &ControlDoc) -> ControlDoc {
    let query: DebugQuery = match doc.decode() {
        Ok(q) => q,
        Err(e) => {
            tracing::warn!(error = %e, "bad debug request");
            return ControlDoc::response(ResponseCode::Invalid);
        }
    };

    let rows = match query.debug_type {
        DebugKind::ListEvent => to_values(registry.list_events()),
        DebugKind::ListParticipant => to_values(registry.list_participants()),
        DebugKind::ListMethod => to_values(registry.list_methods()),
    };
    tracing::debug!(kind = ?query.debug_type, rows = rows.len(), "debug listing");

    let mut reply = ControlDoc::response(ResponseCode::Ok);
    reply.set_array("response_data", rows);
    reply
}

fn to_values<T: Serialize>(rows: Vec<T>) -> Vec<Value> {
    rows.iter()
        .filter_map(|r| serde_json::to_value(r).ok())
        .collect()
}
