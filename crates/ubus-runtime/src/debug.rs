//! Registry listings fetched from the master over DEBUG.

use serde::de::DeserializeOwned;
use serde_json::Value;

use ubus_core::control::{
    ControlDoc, DebugKind, DebugQuery, EventListing, MethodListing, ParticipantListing,
};
use ubus_core::error::BusError;
use ubus_core::wire::FrameType;

use crate::runtime::Runtime;

impl Runtime {
    /// Raw `response_data` rows for one listing.
    pub async fn debug_query(&self, kind: DebugKind) -> Result<Vec<Value>, BusError> {
        let doc = ControlDoc::encode(&DebugQuery { debug_type: kind })?;
        let reply = self.control()?.request(FrameType::Debug, &doc).await?;
        BusError::from_code(reply.response_code()?, "debug")?;
        Ok(reply.get_array("response_data")?.clone())
    }

    pub async fn list_events(&self) -> Result<Vec<EventListing>, BusError> {
        rows(self.debug_query(DebugKind::ListEvent).await?)
    }

    pub async fn list_participants(&self) -> Result<Vec<ParticipantListing>, BusError> {
        rows(self.debug_query(DebugKind::ListParticipant).await?)
    }

    pub async fn list_methods(&self) -> Result<Vec<MethodListing>, BusError> {
        rows(self.debug_query(DebugKind::ListMethod).await?)
    }
}

fn rows<T: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<T>, BusError> {
    values
        .into_iter()
        .map(|v| {
            serde_json::from_value(v)
                .map_err(|e| BusError::Protocol(format!("bad listing row: {e}")))
        })
        .collect()
}
